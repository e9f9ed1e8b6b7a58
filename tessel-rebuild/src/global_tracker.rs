//! Leader-side aggregation of follower progress
//!
//! One `GlobalTracker` per running operation, resident on the leader.
//! Followers' reports update their own participant slot; the control
//! loop reads the aggregate to decide when scanning and pulling are done
//! cluster-wide.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use tessel_core::{Epoch, MapVersion, PoolId, Rank, EPOCH_UNSET};
use tracing::{debug, warn};

use crate::error::ErrorCode;
use crate::messages::StatusReport;
use crate::types::{Counters, RebuildOp};

/// Outcome of applying a follower report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Applied,
    /// Different term, version or generation
    Stale,
    /// Sequence number already applied
    Duplicate,
    /// Sender is not a participant
    UnknownRank,
}

#[derive(Debug, Clone, Default)]
struct ParticipantSlot {
    dtx_resync: MapVersion,
    scan_done: bool,
    pull_done: bool,
    dead: bool,
    counters: Counters,
    last_seq: u64,
}

#[derive(Debug)]
struct GlobalState {
    slots: BTreeMap<Rank, ParticipantSlot>,
    stable_epoch: Epoch,
    /// Upper bound of the Reclaim that follows a successful run
    reclaim_epoch: Epoch,
    error: Option<(ErrorCode, Rank)>,
}

/// Aggregate view of one operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalSnapshot {
    pub participants: usize,
    pub scan_done: usize,
    pub pull_done: usize,
    pub counters: Counters,
    pub dtx_resync: MapVersion,
    pub error: Option<(ErrorCode, Rank)>,
}

#[derive(Debug)]
pub struct GlobalTracker {
    pub pool: PoolId,
    pub op: RebuildOp,
    pub version: MapVersion,
    pub generation: u32,
    pub term: u64,
    state: Mutex<GlobalState>,
}

impl GlobalTracker {
    pub fn new(
        pool: PoolId,
        op: RebuildOp,
        version: MapVersion,
        generation: u32,
        term: u64,
        participants: &[Rank],
    ) -> Self {
        let slots = participants
            .iter()
            .map(|&rank| (rank, ParticipantSlot::default()))
            .collect();
        Self {
            pool,
            op,
            version,
            generation,
            term,
            state: Mutex::new(GlobalState {
                slots,
                stable_epoch: EPOCH_UNSET,
                reclaim_epoch: EPOCH_UNSET,
                error: None,
            }),
        }
    }

    /// Live participants, the recipients of leader notices
    pub fn live_participants(&self) -> Vec<Rank> {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|(_, s)| !s.dead)
            .map(|(&r, _)| r)
            .collect()
    }

    /// Fix the read epoch for the whole migration
    pub fn set_stable_epoch(&self, epoch: Epoch) {
        let mut state = self.state.lock();
        state.stable_epoch = epoch;
        if state.reclaim_epoch == EPOCH_UNSET {
            state.reclaim_epoch = epoch;
        }
    }

    pub fn stable_epoch(&self) -> Epoch {
        self.state.lock().stable_epoch
    }

    /// Fixed by the first stable epoch; later changes leave it alone
    pub fn reclaim_epoch(&self) -> Epoch {
        self.state.lock().reclaim_epoch
    }

    /// Fold one follower report into its slot
    pub fn apply_report(&self, report: &StatusReport) -> ReportOutcome {
        if report.term != self.term
            || report.version != self.version
            || report.generation != self.generation
        {
            debug!(
                pool = %self.pool,
                rank = report.rank,
                term = report.term,
                generation = report.generation,
                "Dropping report for another tracker"
            );
            return ReportOutcome::Stale;
        }

        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(&report.rank) else {
            return ReportOutcome::UnknownRank;
        };
        if report.seq <= slot.last_seq {
            return ReportOutcome::Duplicate;
        }
        slot.last_seq = report.seq;

        if report.re_report {
            slot.counters = report.counters;
        } else {
            slot.counters.add(&report.counters);
        }
        slot.dtx_resync = slot.dtx_resync.max(report.dtx_resync_version);
        if report.scan_done {
            slot.scan_done = true;
        }

        // A failed rank produces no more data, so it may finish both phases at once
        let failed = report.error.is_some();
        let all_scanned = state.slots.values().all(|s| s.scan_done);
        if report.pull_done && (all_scanned || failed) {
            if let Some(slot) = state.slots.get_mut(&report.rank) {
                slot.pull_done = true;
                slot.scan_done = true;
            }
        }

        if let Some(code) = report.error {
            if state.error.is_none() {
                warn!(
                    pool = %self.pool,
                    version = self.version,
                    rank = report.rank,
                    error = %code,
                    "Participant reported failure"
                );
                state.error = Some((code, report.rank));
            }
        }
        ReportOutcome::Applied
    }

    /// Treat a dead rank as done with both phases
    pub fn mark_dead(&self, rank: Rank) -> bool {
        let mut state = self.state.lock();
        match state.slots.get_mut(&rank) {
            Some(slot) if !slot.dead => {
                slot.dead = true;
                slot.scan_done = true;
                slot.pull_done = true;
                warn!(pool = %self.pool, rank, "Participant lost, treating as done");
                true
            }
            _ => false,
        }
    }

    pub fn error(&self) -> Option<(ErrorCode, Rank)> {
        self.state.lock().error
    }

    pub fn scan_done(&self) -> bool {
        self.state.lock().slots.values().all(|s| s.scan_done)
    }

    pub fn pull_done(&self) -> bool {
        self.state.lock().slots.values().all(|s| s.pull_done)
    }

    /// Minimum resync version across live participants
    pub fn dtx_resync(&self) -> MapVersion {
        self.state
            .lock()
            .slots
            .values()
            .filter(|s| !s.dead)
            .map(|s| s.dtx_resync)
            .min()
            .unwrap_or(MapVersion::MAX)
    }

    pub fn counters(&self) -> Counters {
        let state = self.state.lock();
        let mut total = Counters::default();
        for slot in state.slots.values() {
            total.add(&slot.counters);
        }
        total
    }

    pub fn snapshot(&self) -> GlobalSnapshot {
        let state = self.state.lock();
        let mut counters = Counters::default();
        for slot in state.slots.values() {
            counters.add(&slot.counters);
        }
        GlobalSnapshot {
            participants: state.slots.len(),
            scan_done: state.slots.values().filter(|s| s.scan_done).count(),
            pull_done: state.slots.values().filter(|s| s.pull_done).count(),
            counters,
            dtx_resync: state
                .slots
                .values()
                .filter(|s| !s.dead)
                .map(|s| s.dtx_resync)
                .min()
                .unwrap_or(MapVersion::MAX),
            error: state.error,
        }
    }
}
