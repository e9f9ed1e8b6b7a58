//! Object store trait
//!
//! Defines the interface the rebuild engine consumes from the local storage
//! engine. Objects are addressed per target and hold dkey -> akey -> value
//! histories ordered by epoch. Every write carries a `tag`: the rebuild
//! version that produced it (0 for client writes), so a failed rebuild can
//! discard exactly what it migrated.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessel_core::error::Result;
use tessel_core::{ContainerId, Epoch, EpochRange, LayoutVersion, MapVersion, ObjectId, PoolId, TargetId};

/// Address of one object shard held by a local target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub pool: PoolId,
    pub target: TargetId,
    pub cont: ContainerId,
    pub oid: ObjectId,
}

/// One locally stored object shard, as returned by iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEntry {
    pub obj: ObjectRef,
    /// Shard index of this copy within its redundancy group
    pub shard: u32,
    pub layout_version: LayoutVersion,
    /// Highest epoch of any record in the object
    pub max_epoch: Epoch,
    /// Latest object-level punch, if any
    pub punched: Option<Epoch>,
}

/// Metadata applied when a write creates the object shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteMeta {
    pub shard: u32,
    pub layout_version: LayoutVersion,
    /// Rebuild version that produced this write, 0 for client I/O
    pub tag: MapVersion,
}

impl WriteMeta {
    pub fn client(shard: u32, layout_version: LayoutVersion) -> Self {
        Self {
            shard,
            layout_version,
            tag: 0,
        }
    }
}

/// One visible value version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueVersion {
    pub epoch: Epoch,
    pub data: Bytes,
}

/// Visible state of one akey at a read epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AkeyRecord {
    pub akey: Bytes,
    /// Latest punch at or below the read epoch
    pub punched: Option<Epoch>,
    /// Versions newer than any covering punch, oldest first
    pub values: Vec<ValueVersion>,
}

/// Visible state of one dkey at a read epoch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DkeyRecord {
    pub dkey: Bytes,
    pub punched: Option<Epoch>,
    pub akeys: Vec<AkeyRecord>,
}

impl DkeyRecord {
    /// Total bytes referenced by the visible values
    pub fn data_size(&self) -> u64 {
        self.akeys
            .iter()
            .flat_map(|a| a.values.iter())
            .map(|v| v.data.len() as u64)
            .sum()
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Number of object shards stored
    pub object_count: u64,

    /// Bytes used by values
    pub bytes_used: u64,

    /// Total capacity (0 = unlimited)
    pub bytes_capacity: u64,

    /// Number of value writes
    pub writes: u64,

    /// Number of discarded versions
    pub discarded: u64,
}

impl StoreStats {
    /// Calculate usage percentage
    pub fn usage_percent(&self) -> f64 {
        if self.bytes_capacity == 0 {
            0.0
        } else {
            (self.bytes_used as f64 / self.bytes_capacity as f64) * 100.0
        }
    }

    /// Available space in bytes
    pub fn bytes_available(&self) -> u64 {
        if self.bytes_capacity == 0 {
            u64::MAX
        } else {
            self.bytes_capacity.saturating_sub(self.bytes_used)
        }
    }
}

/// Local object store
///
/// Implementations must be Send + Sync; all calls are short and never block
/// on the network.
pub trait ObjectStore: Send + Sync {
    /// List every object shard stored locally for a pool
    fn list_objects(&self, pool: PoolId) -> Result<Vec<ObjectEntry>>;

    /// Look up a single object shard
    fn object(&self, obj: &ObjectRef) -> Result<Option<ObjectEntry>>;

    /// Enumerate the records of an object visible at `epoch`
    fn fetch_object(&self, obj: &ObjectRef, epoch: Epoch) -> Result<Vec<DkeyRecord>>;

    /// Fetch exact value versions of `(akey, epoch)` pairs under one dkey
    fn fetch_values(
        &self,
        obj: &ObjectRef,
        dkey: &Bytes,
        iods: &[(Bytes, Epoch)],
    ) -> Result<Vec<Bytes>>;

    /// Read the value visible at `epoch`
    fn read(&self, obj: &ObjectRef, dkey: &[u8], akey: &[u8], epoch: Epoch)
        -> Result<Option<Bytes>>;

    /// Punch the whole object at `epoch`
    fn punch_object(&self, obj: &ObjectRef, meta: WriteMeta, epoch: Epoch) -> Result<()>;

    /// Punch a dkey at `epoch`
    fn punch_dkey(&self, obj: &ObjectRef, meta: WriteMeta, dkey: &Bytes, epoch: Epoch)
        -> Result<()>;

    /// Punch an akey at `epoch`
    fn punch_akey(
        &self,
        obj: &ObjectRef,
        meta: WriteMeta,
        dkey: &Bytes,
        akey: &Bytes,
        epoch: Epoch,
    ) -> Result<()>;

    /// Write one value version
    fn update(
        &self,
        obj: &ObjectRef,
        meta: WriteMeta,
        dkey: &Bytes,
        akey: &Bytes,
        epoch: Epoch,
        value: Bytes,
    ) -> Result<()>;

    /// Discard records inside `range` whose tag is at least `min_tag`.
    ///
    /// Removes the object once nothing is left. Returns the number of
    /// versions removed; fails with `Busy` while the object is in use.
    fn discard(&self, obj: &ObjectRef, range: EpochRange, min_tag: MapVersion) -> Result<u64>;

    /// Rewrite the layout version of an object shard in place
    fn set_layout_version(&self, obj: &ObjectRef, version: LayoutVersion) -> Result<()>;

    /// Highest epoch this store has committed
    fn stable_epoch(&self) -> Epoch;

    /// Get storage statistics
    fn stats(&self) -> StoreStats;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_available() {
        let stats = StoreStats {
            bytes_used: 40,
            bytes_capacity: 100,
            ..Default::default()
        };
        assert_eq!(stats.bytes_available(), 60);
        assert_eq!(stats.usage_percent(), 40.0);

        let unlimited = StoreStats::default();
        assert_eq!(unlimited.bytes_available(), u64::MAX);
    }

    #[test]
    fn test_dkey_data_size() {
        let record = DkeyRecord {
            dkey: Bytes::from_static(b"d"),
            punched: None,
            akeys: vec![AkeyRecord {
                akey: Bytes::from_static(b"a"),
                punched: None,
                values: vec![
                    ValueVersion {
                        epoch: 1,
                        data: Bytes::from_static(b"abc"),
                    },
                    ValueVersion {
                        epoch: 2,
                        data: Bytes::from_static(b"de"),
                    },
                ],
            }],
        };
        assert_eq!(record.data_size(), 5);
    }
}
