//! Rebuild protocol messages
//!
//! Request and reply bodies exchanged between engines. Every message that
//! refers to a tracker carries `{version, generation, term}` so receivers
//! can drop anything addressed to a superseded tracker.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tessel_core::{
    ContainerId, Epoch, LayoutVersion, MapVersion, ObjectId, PoolId, Rank, TargetId,
};

use crate::error::ErrorCode;
use crate::types::{Counters, RebuildOp};

/// Leader -> follower: start scanning for an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanRequest {
    pub pool: PoolId,
    pub leader: Rank,
    pub term: u64,
    pub op: RebuildOp,
    pub version: MapVersion,
    pub generation: u32,
    pub layout_version: LayoutVersion,
    /// Targets the operation acts on
    pub targets: Vec<TargetId>,
    /// Number of targets in the pool
    pub tgt_count: u32,
    /// Ranks known dead, not participating
    pub excluded_ranks: Vec<Rank>,
    pub reclaim_epoch: Epoch,
    pub min_version: MapVersion,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReply {
    /// Follower's committed epoch
    pub stable_epoch: Epoch,
}

/// One object announced to the engine owning its destination shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectListEntry {
    pub cont: ContainerId,
    pub oid: ObjectId,
    /// Highest epoch of the source copy
    pub epoch: Epoch,
    pub punched: Option<Epoch>,
    pub shard: u32,
    /// Destination target, local to the receiver
    pub target: TargetId,
    /// Target to pull from
    pub source: TargetId,
}

/// Follower -> owner of destination targets, batched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectListRequest {
    pub pool: PoolId,
    pub src_rank: Rank,
    pub version: MapVersion,
    pub generation: u32,
    pub stable_epoch: Epoch,
    pub layout_version: LayoutVersion,
    pub op: RebuildOp,
    pub entries: Vec<ObjectListEntry>,
}

/// Column descriptor: one akey version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iod {
    pub akey: Bytes,
    pub epoch: Epoch,
    pub size: u64,
}

/// One dkey's worth of bundled updates and punches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferUnit {
    pub cont: ContainerId,
    pub oid: ObjectId,
    pub dkey: Bytes,
    pub dkey_punch: Option<Epoch>,
    pub akey_punches: Vec<(Bytes, Epoch)>,
    pub iods: Vec<Iod>,
    /// Values in `iods` order, present when the unit is small
    pub inline: Option<Vec<Bytes>>,
}

impl TransferUnit {
    pub fn data_size(&self) -> u64 {
        self.iods.iter().map(|i| i.size).sum()
    }

    pub fn is_punch_only(&self) -> bool {
        self.iods.is_empty()
    }
}

/// Puller -> source: enumerate an object at an epoch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub pool: PoolId,
    pub source: TargetId,
    pub cont: ContainerId,
    pub oid: ObjectId,
    pub epoch: Epoch,
    /// Units below this size carry their values inline
    pub inline_threshold: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchReply {
    /// Layout of the source copy
    pub layout_version: LayoutVersion,
    pub object_punch: Option<Epoch>,
    pub units: Vec<TransferUnit>,
}

/// Puller -> source: bulk fetch of one unit's values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuesRequest {
    pub pool: PoolId,
    pub source: TargetId,
    pub cont: ContainerId,
    pub oid: ObjectId,
    pub dkey: Bytes,
    pub iods: Vec<(Bytes, Epoch)>,
    /// Exact size of the bulk buffer the destination expects
    pub size: u64,
}

/// Follower -> leader progress report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub pool: PoolId,
    pub rank: Rank,
    pub leader: Rank,
    pub version: MapVersion,
    pub generation: u32,
    pub term: u64,
    /// Per-tracker sequence, strictly increasing
    pub seq: u64,
    /// `counters` are absolute rather than a delta
    pub re_report: bool,
    pub counters: Counters,
    pub scan_done: bool,
    pub pull_done: bool,
    pub stable_epoch: Epoch,
    pub dtx_resync_version: MapVersion,
    pub error: Option<ErrorCode>,
}

/// Leader -> follower authoritative state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderNotice {
    pub pool: PoolId,
    pub leader: Rank,
    pub version: MapVersion,
    pub generation: u32,
    pub term: u64,
    pub global_scan_done: bool,
    pub global_done: bool,
    pub stable_epoch: Epoch,
    pub dtx_resync_version: MapVersion,
}
