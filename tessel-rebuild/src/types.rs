//! Core rebuild types
//!
//! Operation kinds, queued tasks, target states and the client-facing
//! status record.

use serde::{Deserialize, Serialize};
use std::fmt;
use tessel_core::{Epoch, LayoutVersion, MapVersion, PoolId, Rank, TargetId};
use tokio::time::Instant;

use crate::error::ErrorCode;

/// Kind of rebuild operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RebuildOp {
    /// Targets failed; rebuild their shards elsewhere
    Exclude,
    /// Targets are leaving; copy their shards out while still readable
    Drain,
    /// Targets are back; move their shards home
    Reintegrate,
    /// New targets joined; rebalance onto them
    Extend,
    /// Pool layout version raised; rewrite object layouts in place
    Upgrade,
    /// Discard data no longer needed after a successful operation
    Reclaim,
    /// Discard partially migrated data after a failed operation
    FailReclaim,
}

impl RebuildOp {
    pub fn is_reclaim(self) -> bool {
        matches!(self, Self::Reclaim | Self::FailReclaim)
    }

    /// Whether scanning produces transfer units
    pub fn moves_data(self) -> bool {
        matches!(
            self,
            Self::Exclude | Self::Drain | Self::Reintegrate | Self::Extend
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exclude => "exclude",
            Self::Drain => "drain",
            Self::Reintegrate => "reintegrate",
            Self::Extend => "extend",
            Self::Upgrade => "upgrade",
            Self::Reclaim => "reclaim",
            Self::FailReclaim => "fail-reclaim",
        }
    }
}

impl fmt::Display for RebuildOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queued unit of work owned by the scheduler
#[derive(Debug, Clone)]
pub struct RebuildTask {
    pub pool: PoolId,
    pub op: RebuildOp,
    /// Sorted, deduplicated
    pub targets: Vec<TargetId>,
    /// Map version that triggered the task
    pub map_version: MapVersion,
    /// Upper discard bound for Reclaim
    pub reclaim_epoch: Epoch,
    /// FailReclaim discards only records tagged at or above this version
    pub min_version: MapVersion,
    pub layout_version: LayoutVersion,
    /// Assigned by the scheduler at launch, unique per pool
    pub generation: u32,
    pub not_before: Instant,
}

impl RebuildTask {
    pub fn new(pool: PoolId, op: RebuildOp, map_version: MapVersion, targets: &[TargetId]) -> Self {
        let mut task = Self {
            pool,
            op,
            targets: Vec::new(),
            map_version,
            reclaim_epoch: 0,
            min_version: 0,
            layout_version: tessel_core::DEFAULT_LAYOUT_VERSION,
            generation: 0,
            not_before: Instant::now(),
        };
        task.add_targets(targets);
        task
    }

    /// Union `targets` into the task's target list
    pub fn add_targets(&mut self, targets: &[TargetId]) {
        self.targets.extend_from_slice(targets);
        self.targets.sort_unstable();
        self.targets.dedup();
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.not_before <= now
    }
}

/// Target state in the cluster map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetState {
    /// Serving and part of placement
    UpIn,
    /// Reintegrating: placed, being filled
    Up,
    /// Failed, not yet rebuilt
    Down,
    /// Failed and rebuilt elsewhere
    DownOut,
    /// Leaving; still readable, no longer placed
    Drain,
    /// Newly added, being filled
    New,
}

impl TargetState {
    /// Part of the placement set
    pub fn is_in(self) -> bool {
        matches!(self, Self::UpIn | Self::Up | Self::New)
    }

    /// Can serve reads
    pub fn is_readable(self) -> bool {
        matches!(self, Self::UpIn | Self::Drain)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    pub id: TargetId,
    pub rank: Rank,
    pub state: TargetState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankInfo {
    pub rank: Rank,
    pub alive: bool,
}

/// Current cluster leader and its term
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leadership {
    pub rank: Rank,
    pub term: u64,
}

/// Progress counters carried through the status protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    /// Objects queued for migration
    pub to_migrate: u64,
    /// Objects fully applied
    pub objects: u64,
    /// Transfer units applied
    pub records: u64,
    pub bytes: u64,
}

impl Counters {
    pub fn add(&mut self, other: &Counters) {
        self.to_migrate += other.to_migrate;
        self.objects += other.objects;
        self.records += other.records;
        self.bytes += other.bytes;
    }

    /// Difference since `earlier`, saturating
    pub fn since(&self, earlier: &Counters) -> Counters {
        Counters {
            to_migrate: self.to_migrate.saturating_sub(earlier.to_migrate),
            objects: self.objects.saturating_sub(earlier.objects),
            records: self.records.saturating_sub(earlier.records),
            bytes: self.bytes.saturating_sub(earlier.bytes),
        }
    }
}

/// Client-visible state of a pool's rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebuildState {
    NotStarted,
    InProgress,
    Completed,
}

/// Answer to a status query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RebuildStatus {
    pub state: RebuildState,
    pub op: Option<RebuildOp>,
    pub map_version: MapVersion,
    pub counters: Counters,
    pub error: Option<ErrorCode>,
    pub failing_rank: Option<Rank>,
}

impl RebuildStatus {
    pub fn not_started() -> Self {
        Self {
            state: RebuildState::NotStarted,
            op: None,
            map_version: 0,
            counters: Counters::default(),
            error: None,
            failing_rank: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == RebuildState::Completed
    }
}
