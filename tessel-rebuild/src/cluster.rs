//! Collaborator interfaces
//!
//! The engine consumes the cluster map, the placement oracle and the DTX
//! resync signal through these traits. Implementations must be cheap to
//! call: every method answers from in-memory state.

use serde::{Deserialize, Serialize};
use tessel_core::{LayoutVersion, MapVersion, ObjectId, PoolId, TargetId};

use crate::error::Result;
use crate::types::{Leadership, RankInfo, RebuildOp, TargetInfo, TargetState};

/// One (target, shard) assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardPlacement {
    pub target: TargetId,
    pub shard: u32,
}

/// Data movement needed for one object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildPlacement {
    /// Readable copies, preferred sender first
    pub sources: Vec<TargetId>,
    /// Shards that must be created
    pub destinations: Vec<ShardPlacement>,
}

impl RebuildPlacement {
    /// The copy elected to announce this object to its destinations
    pub fn sender(&self) -> Option<TargetId> {
        self.sources.first().copied()
    }
}

/// Structural change needed to move an object to a newer layout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradePlan {
    pub layout_version: LayoutVersion,
    /// Shards the new layout places on other targets
    pub destinations: Vec<ShardPlacement>,
}

/// Cluster membership and pool map
pub trait ClusterMap: Send + Sync {
    /// Version this node believes is current
    fn map_version(&self, pool: PoolId) -> Result<MapVersion>;

    /// Version every engine has acknowledged
    fn acked_version(&self, pool: PoolId) -> Result<MapVersion>;

    fn layout_version(&self, pool: PoolId) -> Result<LayoutVersion>;

    /// Raise the pool layout version, returning the new map version
    fn set_layout_version(&self, pool: PoolId, version: LayoutVersion) -> Result<MapVersion>;

    fn targets(&self, pool: PoolId) -> Result<Vec<TargetInfo>>;

    /// Move targets to `state`, returning the new map version
    fn set_targets_state(
        &self,
        pool: PoolId,
        targets: &[TargetId],
        state: TargetState,
    ) -> Result<MapVersion>;

    fn ranks(&self) -> Vec<RankInfo>;

    fn leader(&self) -> Leadership;
}

/// Placement oracle
pub trait PlacementOracle: Send + Sync {
    /// Shards of `oid` at `version`
    fn place(
        &self,
        pool: PoolId,
        oid: ObjectId,
        version: MapVersion,
        layout: LayoutVersion,
    ) -> Result<Vec<ShardPlacement>>;

    /// Sources and destinations of `oid` for an operation on `targets`
    fn find_rebuild(
        &self,
        pool: PoolId,
        oid: ObjectId,
        version: MapVersion,
        op: RebuildOp,
        targets: &[TargetId],
    ) -> Result<RebuildPlacement>;

    fn find_upgrade(
        &self,
        pool: PoolId,
        oid: ObjectId,
        version: MapVersion,
        from: LayoutVersion,
        to: LayoutVersion,
    ) -> Result<UpgradePlan>;

    /// Whether `shard` of `oid` still belongs on `target` at `version`
    fn is_required(
        &self,
        pool: PoolId,
        oid: ObjectId,
        shard: u32,
        target: TargetId,
        version: MapVersion,
    ) -> Result<bool>;
}

/// Distributed transaction resync progress
pub trait DtxResync: Send + Sync {
    /// Highest map version whose resync has completed locally
    fn resync_version(&self, pool: PoolId) -> MapVersion;
}

/// Rank hosting `target`, from a target listing
pub fn rank_of(targets: &[TargetInfo], target: TargetId) -> Option<tessel_core::Rank> {
    targets.iter().find(|t| t.id == target).map(|t| t.rank)
}
