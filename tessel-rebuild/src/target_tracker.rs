//! Per-node rebuild tracker
//!
//! One `TargetTracker` exists per node for each `{pool, version,
//! generation}` the node is participating in. Scanner, puller and
//! reporter tasks each hold a `TrackerRef`; teardown blocks until they
//! have all let go.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tessel_core::{Epoch, LayoutVersion, MapVersion, PoolId, TargetId, EPOCH_UNSET};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::{RebuildError, Result};
use crate::index::{InsertOutcome, MigrationIndex, PendingShard, PullBatch};
use crate::messages::{LeaderNotice, ObjectListEntry, ScanRequest};
use crate::refcount::RefCount;
use crate::types::{Counters, Leadership, RebuildOp};

/// Outcome of applying a leader notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeOutcome {
    Applied,
    /// Sent under a different term; ignored
    StaleTerm,
}

pub struct TargetTracker {
    id: u64,
    pub pool: PoolId,
    pub version: MapVersion,
    pub generation: u32,
    pub op: RebuildOp,
    pub layout_version: LayoutVersion,
    pub targets: Vec<TargetId>,
    pub reclaim_epoch: Epoch,
    pub min_version: MapVersion,

    leader: Mutex<Leadership>,
    refs: RefCount,

    aborting: AtomicBool,
    finishing: AtomicBool,
    scan_done: AtomicBool,
    global_scan_done: AtomicBool,
    global_done: AtomicBool,
    re_report: AtomicBool,
    retired: AtomicBool,

    stable_epoch: AtomicU64,
    global_dtx_resync: AtomicU32,

    index: Mutex<MigrationIndex>,
    counters: Mutex<Counters>,
    error: Mutex<Option<RebuildError>>,
    seq: AtomicU64,
    parked: AtomicUsize,

    /// Any flag or epoch changed
    changed: Notify,
    /// New transfer work queued
    work: Notify,
}

impl std::fmt::Debug for TargetTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetTracker")
            .field("id", &self.id)
            .field("pool", &self.pool)
            .field("version", &self.version)
            .field("generation", &self.generation)
            .field("op", &self.op)
            .finish_non_exhaustive()
    }
}

impl TargetTracker {
    fn new(id: u64, req: &ScanRequest, migrated_cap: usize) -> Self {
        Self {
            id,
            pool: req.pool,
            version: req.version,
            generation: req.generation,
            op: req.op,
            layout_version: req.layout_version,
            targets: req.targets.clone(),
            reclaim_epoch: req.reclaim_epoch,
            min_version: req.min_version,
            leader: Mutex::new(Leadership {
                rank: req.leader,
                term: req.term,
            }),
            refs: RefCount::new(),
            aborting: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            scan_done: AtomicBool::new(false),
            global_scan_done: AtomicBool::new(false),
            global_done: AtomicBool::new(false),
            re_report: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            stable_epoch: AtomicU64::new(EPOCH_UNSET),
            global_dtx_resync: AtomicU32::new(0),
            index: Mutex::new(MigrationIndex::new(migrated_cap)),
            counters: Mutex::new(Counters::default()),
            error: Mutex::new(None),
            seq: AtomicU64::new(0),
            parked: AtomicUsize::new(0),
            changed: Notify::new(),
            work: Notify::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Take a reference for an async worker
    pub fn acquire(self: &Arc<Self>) -> TrackerRef {
        self.refs.acquire();
        TrackerRef(self.clone())
    }

    pub fn refcount(&self) -> usize {
        self.refs.get()
    }

    pub fn leader(&self) -> Leadership {
        *self.leader.lock()
    }

    /// Adopt a newer leadership term; older terms are stale
    pub fn update_leader(&self, leadership: Leadership) -> Result<bool> {
        let mut current = self.leader.lock();
        if leadership.term < current.term {
            return Err(RebuildError::Stale(format!(
                "term {} older than {}",
                leadership.term, current.term
            )));
        }
        if leadership.term == current.term {
            return Ok(false);
        }
        *current = leadership;
        drop(current);

        // New leader has no history for us: next report is absolute
        self.re_report.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
        Ok(true)
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    pub fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::SeqCst)
    }

    pub fn is_scan_done(&self) -> bool {
        self.scan_done.load(Ordering::SeqCst)
    }

    pub fn is_global_scan_done(&self) -> bool {
        self.global_scan_done.load(Ordering::SeqCst)
    }

    pub fn is_global_done(&self) -> bool {
        self.global_done.load(Ordering::SeqCst)
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Workers should wind down
    pub fn should_stop(&self) -> bool {
        self.is_aborting() || self.is_finishing()
    }

    pub fn set_scan_done(&self) {
        self.scan_done.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn abort(&self) {
        if !self.aborting.swap(true, Ordering::SeqCst) {
            debug!(pool = %self.pool, version = self.version, "Tracker aborting");
        }
        self.changed.notify_waiters();
        self.work.notify_waiters();
    }

    /// Superseded by a newer generation or version
    pub fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.abort();
    }

    /// Record the first error and abort sibling workers
    pub fn set_error(&self, err: RebuildError) {
        {
            let mut slot = self.error.lock();
            if slot.is_none() {
                warn!(
                    pool = %self.pool,
                    version = self.version,
                    generation = self.generation,
                    error = %err,
                    "Rebuild failed locally"
                );
                *slot = Some(err);
            }
        }
        self.abort();
    }

    pub fn error(&self) -> Option<RebuildError> {
        self.error.lock().clone()
    }

    pub fn stable_epoch(&self) -> Option<Epoch> {
        match self.stable_epoch.load(Ordering::SeqCst) {
            EPOCH_UNSET => None,
            epoch => Some(epoch),
        }
    }

    pub fn global_dtx_resync(&self) -> MapVersion {
        self.global_dtx_resync.load(Ordering::SeqCst)
    }

    /// Apply authoritative leader state
    pub fn apply_notice(&self, notice: &LeaderNotice) -> NoticeOutcome {
        let leadership = self.leader();
        if notice.term != leadership.term {
            debug!(
                pool = %self.pool,
                term = notice.term,
                local_term = leadership.term,
                "Ignoring notice from another term"
            );
            return NoticeOutcome::StaleTerm;
        }

        // Done flags only ever go from false to true
        if notice.global_scan_done {
            self.global_scan_done.store(true, Ordering::SeqCst);
        }
        if notice.global_done {
            self.global_done.store(true, Ordering::SeqCst);
        }
        self.global_dtx_resync
            .fetch_max(notice.dtx_resync_version, Ordering::SeqCst);

        if notice.stable_epoch != EPOCH_UNSET {
            let adopted = self.stable_epoch.compare_exchange(
                EPOCH_UNSET,
                notice.stable_epoch,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            if let Err(current) = adopted {
                if current != notice.stable_epoch {
                    warn!(
                        pool = %self.pool,
                        version = self.version,
                        local = current,
                        leader = notice.stable_epoch,
                        "Leader stable epoch differs, keeping local"
                    );
                }
            }
        }

        self.changed.notify_waiters();
        NoticeOutcome::Applied
    }

    /// Wait until `cond` holds, re-checking on every state change
    pub async fn wait_until(&self, cond: impl Fn(&Self) -> bool) {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if cond(self) {
                return;
            }
            notified.await;
        }
    }

    /// Block until the read epoch is fixed and DTX resync has caught up.
    /// Returns `None` if the tracker stopped first.
    pub async fn wait_ready(&self) -> Option<Epoch> {
        self.wait_until(|t| {
            t.should_stop()
                || (t.stable_epoch().is_some() && t.global_dtx_resync() >= t.version)
        })
        .await;
        if self.should_stop() {
            return None;
        }
        self.stable_epoch()
    }

    /// Queue announced shards; returns how many were new
    pub fn insert(&self, entries: &[ObjectListEntry], layout_version: LayoutVersion) -> usize {
        let queued = {
            let mut index = self.index.lock();
            entries
                .iter()
                .filter(|e| {
                    index.insert((e.cont, e.oid), PendingShard::from_entry(e, layout_version))
                        == InsertOutcome::Queued
                })
                .count()
        };
        if queued > 0 {
            self.counters.lock().to_migrate += queued as u64;
            self.work.notify_waiters();
        }
        queued
    }

    pub fn take(&self) -> Option<PullBatch> {
        self.index.lock().take()
    }

    pub fn complete(&self, batch: &PullBatch, applied: &Counters) {
        // Counters first: an idle index implies final counters
        self.counters.lock().add(applied);
        self.index.lock().complete(batch);
        self.changed.notify_waiters();
    }

    pub fn requeue(&self, batch: &PullBatch) {
        self.index.lock().requeue(batch);
    }

    pub fn abandon(&self, batch: &PullBatch) {
        self.index.lock().abandon(batch);
        self.changed.notify_waiters();
    }

    /// Take the next batch, or wait up to `idle` for new work or a state
    /// change. `None` means the caller should re-check the tracker.
    pub async fn next_batch(&self, idle: std::time::Duration) -> Option<PullBatch> {
        let work = self.work.notified();
        let changed = self.changed.notified();
        tokio::pin!(work);
        tokio::pin!(changed);
        work.as_mut().enable();
        changed.as_mut().enable();

        if let Some(batch) = self.take() {
            return Some(batch);
        }
        if self.should_stop() {
            return None;
        }
        tokio::select! {
            _ = work => {}
            _ = changed => {}
            _ = tokio::time::sleep(idle) => {}
        }
        None
    }

    pub fn park(&self) {
        self.parked.fetch_add(1, Ordering::SeqCst);
    }

    pub fn unpark(&self) {
        self.parked.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    /// Notify handle for waiters that also watch other signals
    pub(crate) fn changed(&self) -> &Notify {
        &self.changed
    }

    /// Everything this node will ever receive has been applied
    pub fn local_pull_done(&self) -> bool {
        self.is_scan_done() && self.is_global_scan_done() && self.index.lock().is_idle()
    }

    pub fn index_is_disjoint(&self) -> bool {
        self.index.lock().is_disjoint()
    }

    pub fn counters(&self) -> Counters {
        *self.counters.lock()
    }

    pub fn add_counters(&self, delta: &Counters) {
        self.counters.lock().add(delta);
    }

    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Consume the re-report flag
    pub fn take_re_report(&self) -> bool {
        self.re_report.swap(false, Ordering::SeqCst)
    }

    pub fn request_re_report(&self) {
        self.re_report.store(true, Ordering::SeqCst);
    }

    /// Stop workers, wait for their references, release resources and
    /// unregister. Returns the final refcount.
    pub async fn begin_teardown(&self, registry: &TrackerRegistry) -> usize {
        self.finishing.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
        self.work.notify_waiters();

        self.refs.wait_for_owner().await;

        self.index.lock().clear();
        let remaining = self.refs.release_owner();
        registry.remove(self.id);

        info!(
            pool = %self.pool,
            version = self.version,
            generation = self.generation,
            op = %self.op,
            "Tracker torn down"
        );
        remaining
    }
}

/// Counted handle held by async workers; releases on drop
pub struct TrackerRef(Arc<TargetTracker>);

impl Deref for TrackerRef {
    type Target = Arc<TargetTracker>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Clone for TrackerRef {
    fn clone(&self) -> Self {
        self.0.acquire()
    }
}

impl Drop for TrackerRef {
    fn drop(&mut self) {
        self.0.refs.release();
    }
}

/// Process-wide tracker slab keyed by a stable id
#[derive(Default)]
pub struct TrackerRegistry {
    trackers: Mutex<HashMap<u64, Arc<TargetTracker>>>,
    next_id: AtomicU64,
}

impl TrackerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, req: &ScanRequest, migrated_cap: usize) -> Arc<TargetTracker> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let tracker = Arc::new(TargetTracker::new(id, req, migrated_cap));
        self.trackers.lock().insert(id, tracker.clone());
        tracker
    }

    /// Live tracker for `{pool, version}`, ignoring retired ones
    pub fn find(&self, pool: PoolId, version: MapVersion) -> Option<Arc<TargetTracker>> {
        self.trackers
            .lock()
            .values()
            .filter(|t| t.pool == pool && t.version == version && !t.is_retired())
            .max_by_key(|t| t.generation)
            .cloned()
    }

    /// Live tracker of exactly `{pool, version, generation}`
    pub fn find_generation(
        &self,
        pool: PoolId,
        version: MapVersion,
        generation: u32,
    ) -> Option<Arc<TargetTracker>> {
        self.trackers
            .lock()
            .values()
            .find(|t| {
                t.pool == pool
                    && t.version == version
                    && t.generation == generation
                    && !t.is_retired()
            })
            .cloned()
    }

    pub fn for_pool(&self, pool: PoolId) -> Vec<Arc<TargetTracker>> {
        self.trackers
            .lock()
            .values()
            .filter(|t| t.pool == pool)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<TargetTracker>> {
        self.trackers.lock().values().cloned().collect()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<TargetTracker>> {
        self.trackers.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.trackers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
