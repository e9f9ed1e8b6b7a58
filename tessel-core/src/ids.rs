//! Identifier types
//!
//! Pools and containers are named by UUID. Objects carry a 128-bit
//! identifier split into `hi`/`lo` halves; object names hash into it with
//! Blake3 so callers can derive stable ids from arbitrary keys.

use crate::error::{Result, TesselError};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Engine rank (one storage process in the cluster)
pub type Rank = u32;

/// Global storage target index
pub type TargetId = u32;

/// Hybrid-logical-clock epoch used to order versions
pub type Epoch = u64;

/// Pool map version
pub type MapVersion = u32;

/// Object layout version
pub type LayoutVersion = u32;

/// Pool identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolId(Uuid);

impl PoolId {
    /// Generate a random pool id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PoolId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolId({})", &self.0.to_string()[..8])
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Container identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(Uuid);

impl ContainerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", &self.0.to_string()[..8])
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// 128-bit object identifier
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    pub hi: u64,
    pub lo: u64,
}

impl ObjectId {
    pub fn new(hi: u64, lo: u64) -> Self {
        Self { hi, lo }
    }

    /// Derive an object id from a name
    pub fn from_name(name: &[u8]) -> Self {
        let hash = blake3::hash(name);
        let bytes = hash.as_bytes();
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[..8]);
        lo.copy_from_slice(&bytes[8..16]);
        Self {
            hi: u64::from_le_bytes(hi),
            lo: u64::from_le_bytes(lo),
        }
    }

    /// Big-endian byte form, used as hashing input by placement
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.hi.to_be_bytes());
        out[8..].copy_from_slice(&self.lo.to_be_bytes());
        out
    }

    /// Parse the `hi.lo` hex form produced by `Display`
    pub fn parse(s: &str) -> Result<Self> {
        let (hi, lo) = s
            .split_once('.')
            .ok_or_else(|| TesselError::Internal(format!("malformed object id: {s}")))?;
        let hi = u64::from_str_radix(hi, 16)
            .map_err(|e| TesselError::Internal(format!("malformed object id {s}: {e}")))?;
        let lo = u64::from_str_radix(lo, 16)
            .map_err(|e| TesselError::Internal(format!("malformed object id {s}: {e}")))?;
        Ok(Self { hi, lo })
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({:x}.{:x})", self.hi, self.lo)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}.{:x}", self.hi, self.lo)
    }
}

/// Inclusive epoch range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochRange {
    pub lo: Epoch,
    pub hi: Epoch,
}

impl EpochRange {
    pub fn new(lo: Epoch, hi: Epoch) -> Result<Self> {
        if lo > hi {
            return Err(TesselError::InvalidEpochRange { lo, hi });
        }
        Ok(Self { lo, hi })
    }

    /// Everything up to and including `hi`
    pub fn up_to(hi: Epoch) -> Self {
        Self { lo: 0, hi }
    }

    pub fn contains(&self, epoch: Epoch) -> bool {
        epoch >= self.lo && epoch <= self.hi
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_from_name_is_stable() {
        let a = ObjectId::from_name(b"obj-1");
        let b = ObjectId::from_name(b"obj-1");
        let c = ObjectId::from_name(b"obj-2");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_epoch_range_validation() {
        assert!(EpochRange::new(5, 3).is_err());
        let range = EpochRange::new(3, 5).unwrap();
        assert!(range.contains(3));
        assert!(range.contains(5));
        assert!(!range.contains(6));
        assert!(EpochRange::up_to(10).contains(0));
    }

    #[test]
    fn test_object_id_parse_rejects_garbage() {
        assert!(ObjectId::parse("nodot").is_err());
        assert!(ObjectId::parse("zz.1").is_err());
        assert_eq!(ObjectId::parse("a.b").unwrap(), ObjectId::new(10, 11));
    }
}
