//! Rebuild task scheduler
//!
//! Owns the process-wide task queue and the set of running control loops.
//! Constructed once per engine and shared by handle; only the leader's
//! instance runs `run_loop`.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessel_core::{Epoch, LayoutVersion, MapVersion, PoolId, Rank, TargetId};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, info, info_span, instrument, Instrument};

use crate::cluster::ClusterMap;
use crate::config::RebuildConfig;
use crate::control::{ControlLoop, LoopOutcome};
use crate::error::{ErrorCode, RebuildError, Result};
use crate::global_tracker::{GlobalTracker, ReportOutcome};
use crate::messages::StatusReport;
use crate::task_queue::{PushOutcome, TaskQueue};
use crate::transport::Transport;
use crate::types::{RebuildOp, RebuildState, RebuildStatus, RebuildTask, TargetState};

/// Scheduler lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    Queued {
        pool: PoolId,
        op: RebuildOp,
        version: MapVersion,
    },
    Merged {
        pool: PoolId,
        op: RebuildOp,
        version: MapVersion,
    },
    Launched {
        pool: PoolId,
        op: RebuildOp,
        version: MapVersion,
        generation: u32,
        reclaim_epoch: Epoch,
        min_version: MapVersion,
    },
    Finished {
        pool: PoolId,
        op: RebuildOp,
        version: MapVersion,
        generation: u32,
        error: Option<ErrorCode>,
    },
}

/// Optional parameters of `schedule`
#[derive(Debug, Clone, Default)]
pub struct ScheduleOptions {
    pub reclaim_epoch: Epoch,
    pub min_version: MapVersion,
    /// Defaults to the pool's current layout version
    pub layout_version: Option<LayoutVersion>,
    pub delay: Duration,
}

struct RunningOp {
    op: RebuildOp,
    version: MapVersion,
    tracker: Option<Arc<GlobalTracker>>,
}

struct Failure {
    code: ErrorCode,
    rank: Option<Rank>,
}

#[derive(Default)]
struct SchedulerState {
    queue: TaskQueue,
    running: HashMap<PoolId, RunningOp>,
    stopping: HashSet<PoolId>,
    outcomes: HashMap<PoolId, RebuildStatus>,
    failures: HashMap<PoolId, Failure>,
    /// Last generation launched per pool
    generations: HashMap<PoolId, u32>,
}

pub struct Scheduler {
    rank: Rank,
    config: Arc<RebuildConfig>,
    cluster: Arc<dyn ClusterMap>,
    transport: Arc<dyn Transport>,
    state: Mutex<SchedulerState>,
    abort: AtomicBool,
    /// Queue or running set changed
    changed: Notify,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl Scheduler {
    pub fn new(
        rank: Rank,
        config: Arc<RebuildConfig>,
        cluster: Arc<dyn ClusterMap>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            rank,
            config,
            cluster,
            transport,
            state: Mutex::new(SchedulerState::default()),
            abort: AtomicBool::new(false),
            changed: Notify::new(),
            events: None,
        }
    }

    /// Create a scheduler that also streams its lifecycle events
    pub fn with_events(
        rank: Rank,
        config: Arc<RebuildConfig>,
        cluster: Arc<dyn ClusterMap>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut scheduler = Self::new(rank, config, cluster, transport);
        scheduler.events = Some(tx);
        (scheduler, rx)
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub(crate) fn config(&self) -> &RebuildConfig {
        &self.config
    }

    pub(crate) fn cluster(&self) -> &Arc<dyn ClusterMap> {
        &self.cluster
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self, pool: PoolId) -> bool {
        self.state.lock().stopping.contains(&pool)
    }

    pub fn is_running(&self, pool: PoolId) -> bool {
        self.state.lock().running.contains_key(&pool)
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queue a rebuild. A no-op while the pool is shutting down.
    #[instrument(skip(self, targets, opts), fields(rank = self.rank))]
    pub fn schedule(
        &self,
        pool: PoolId,
        op: RebuildOp,
        version: MapVersion,
        targets: &[TargetId],
        opts: ScheduleOptions,
    ) -> Result<()> {
        if self.is_aborted() || self.is_stopping(pool) {
            debug!(%pool, %op, version, "Pool shutting down, not scheduling");
            return Ok(());
        }

        let layout_version = match opts.layout_version {
            Some(v) => v,
            None => self.cluster.layout_version(pool)?,
        };
        let mut task = RebuildTask::new(pool, op, version, targets);
        task.reclaim_epoch = opts.reclaim_epoch;
        task.min_version = opts.min_version;
        task.layout_version = layout_version;
        task.not_before = Instant::now() + opts.delay;

        self.enqueue(task);
        Ok(())
    }

    /// Resubmit a failed task; it relaunches at a fresh generation
    pub(crate) fn resubmit(&self, mut task: RebuildTask, delay: Duration) {
        if self.is_aborted() || self.is_stopping(task.pool) {
            return;
        }
        task.not_before = Instant::now() + delay;
        self.enqueue(task);
    }

    fn enqueue(&self, task: RebuildTask) {
        let (pool, op, version) = (task.pool, task.op, task.map_version);
        let outcome = self.state.lock().queue.push(task);

        match outcome {
            PushOutcome::Queued => {
                info!(%pool, %op, version, "Rebuild queued");
                self.emit(SchedulerEvent::Queued { pool, op, version });
            }
            PushOutcome::Merged { version: merged } => {
                info!(%pool, %op, version, merged, "Rebuild merged into queued task");
                self.emit(SchedulerEvent::Merged {
                    pool,
                    op,
                    version: merged,
                });
            }
        }
        self.changed.notify_waiters();
    }

    /// Launch control loops until aborted
    pub async fn run_loop(self: Arc<Self>) {
        info!(rank = self.rank, "Rebuild scheduler started");
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if self.is_aborted() {
                if self.state.lock().running.is_empty() {
                    break;
                }
            } else {
                let launch = {
                    let mut state = self.state.lock();
                    let running: HashSet<PoolId> = state.running.keys().copied().collect();
                    let room = self.config.max_running_pools.saturating_sub(running.len());
                    let blocked = state.stopping.clone();
                    state
                        .queue
                        .pop_ready(Instant::now(), &running, &blocked, room)
                };
                for task in launch {
                    self.launch(task);
                }
            }

            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep(self.config.scheduler_idle()) => {}
            }
        }
        info!(rank = self.rank, "Rebuild scheduler stopped");
    }

    fn launch(self: &Arc<Self>, mut task: RebuildTask) {
        {
            let mut state = self.state.lock();
            // Every launch gets a generation no follower tracker of this
            // pool has seen, whatever its op
            let generation = state.generations.entry(task.pool).or_default();
            *generation += 1;
            task.generation = *generation;
            state.running.insert(
                task.pool,
                RunningOp {
                    op: task.op,
                    version: task.map_version,
                    tracker: None,
                },
            );
        }
        info!(
            pool = %task.pool,
            op = %task.op,
            version = task.map_version,
            generation = task.generation,
            targets = ?task.targets,
            "Launching rebuild"
        );
        self.emit(SchedulerEvent::Launched {
            pool: task.pool,
            op: task.op,
            version: task.map_version,
            generation: task.generation,
            reclaim_epoch: task.reclaim_epoch,
            min_version: task.min_version,
        });

        let span = info_span!(
            "rebuild",
            pool = %task.pool,
            op = %task.op,
            version = task.map_version,
            generation = task.generation
        );
        let sched = self.clone();
        tokio::spawn(
            async move {
                let outcome = ControlLoop::new(sched.clone(), task.clone()).run().await;
                sched.finish(&task, outcome);
            }
            .instrument(span),
        );
    }

    /// Register the leader-side tracker of a running operation
    pub(crate) fn attach_tracker(&self, pool: PoolId, tracker: Arc<GlobalTracker>) {
        if let Some(running) = self.state.lock().running.get_mut(&pool) {
            running.tracker = Some(tracker);
        }
    }

    pub fn global_tracker(&self, pool: PoolId) -> Option<Arc<GlobalTracker>> {
        self.state
            .lock()
            .running
            .get(&pool)
            .and_then(|r| r.tracker.clone())
    }

    fn finish(&self, task: &RebuildTask, outcome: LoopOutcome) {
        let error = outcome.result.as_ref().err().map(|e| e.code());
        {
            let mut state = self.state.lock();
            state.running.remove(&task.pool);

            match (&outcome.result, outcome.permanent) {
                (Err(err), true) => {
                    let rank = match err {
                        RebuildError::Remote { rank, .. } => Some(*rank),
                        _ => outcome.failing_rank,
                    };
                    state.failures.insert(
                        task.pool,
                        Failure {
                            code: err.code(),
                            rank,
                        },
                    );
                }
                (Ok(()), _) if !task.op.is_reclaim() => {
                    state.failures.remove(&task.pool);
                }
                _ => {}
            }

            let failure = state.failures.get(&task.pool);
            let counters = if task.op.is_reclaim() {
                state
                    .outcomes
                    .get(&task.pool)
                    .map(|s| s.counters)
                    .unwrap_or(outcome.counters)
            } else {
                outcome.counters
            };
            let status = RebuildStatus {
                state: RebuildState::Completed,
                op: Some(task.op),
                map_version: task.map_version,
                counters,
                error: failure.map(|f| f.code),
                failing_rank: failure.and_then(|f| f.rank),
            };
            state.outcomes.insert(task.pool, status);
        }

        info!(
            pool = %task.pool,
            op = %task.op,
            version = task.map_version,
            generation = task.generation,
            error = ?error,
            "Rebuild control loop exited"
        );
        self.emit(SchedulerEvent::Finished {
            pool: task.pool,
            op: task.op,
            version: task.map_version,
            generation: task.generation,
            error,
        });
        self.changed.notify_waiters();
    }

    /// Stop launching, drop queued tasks and wait for running loops
    pub async fn abort_all(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let dropped = self.state.lock().queue.drain();
        info!(dropped = dropped.len(), "Aborting all rebuilds");
        self.changed.notify_waiters();
        self.wait_idle().await;
    }

    /// Shut a pool down: drop its queued tasks and wait for its loop
    pub async fn stop_pool(&self, pool: PoolId) {
        let dropped = {
            let mut state = self.state.lock();
            state.stopping.insert(pool);
            state.queue.remove_pool(pool)
        };
        info!(%pool, dropped = dropped.len(), "Stopping pool rebuilds");
        self.changed.notify_waiters();

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if !self.is_running(pool) {
                return;
            }
            changed.await;
        }
    }

    /// Wait until no control loop is running
    pub async fn wait_idle(&self) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if self.state.lock().running.is_empty() {
                return;
            }
            changed.await;
        }
    }

    /// Rebuild the pool's queue from the current map, as a new leader does
    #[instrument(skip(self), fields(rank = self.rank))]
    pub fn regenerate(&self, pool: PoolId) -> Result<usize> {
        let version = self.cluster.map_version(pool)?;
        let targets = self.cluster.targets(pool)?;
        let dropped = self.state.lock().queue.remove_pool(pool);

        let mut scheduled = 0;
        for (state, op) in [
            (TargetState::Down, RebuildOp::Exclude),
            (TargetState::Drain, RebuildOp::Drain),
            (TargetState::Up, RebuildOp::Reintegrate),
            (TargetState::New, RebuildOp::Extend),
        ] {
            let ids: Vec<TargetId> = targets
                .iter()
                .filter(|t| t.state == state)
                .map(|t| t.id)
                .collect();
            if !ids.is_empty() {
                self.schedule(pool, op, version, &ids, ScheduleOptions::default())?;
                scheduled += 1;
            }
        }
        info!(%pool, version, dropped = dropped.len(), scheduled, "Regenerated rebuild queue");
        Ok(scheduled)
    }

    /// Fold a follower report into the running operation's tracker
    pub fn apply_report(&self, report: &StatusReport) -> Result<ReportOutcome> {
        if self.cluster.leader().rank != self.rank {
            return Err(RebuildError::NotLeader(self.rank));
        }
        let outcome = match self.global_tracker(report.pool) {
            Some(tracker) => tracker.apply_report(report),
            None => ReportOutcome::Stale,
        };
        Ok(outcome)
    }

    /// Client-facing status of a pool
    pub fn query(&self, pool: PoolId) -> RebuildStatus {
        let state = self.state.lock();
        let failure = state.failures.get(&pool);
        let previous = state.outcomes.get(&pool);

        if let Some(running) = state.running.get(&pool) {
            let counters = match &running.tracker {
                Some(t) if !running.op.is_reclaim() => t.counters(),
                _ => previous.map(|s| s.counters).unwrap_or_default(),
            };
            return RebuildStatus {
                state: RebuildState::InProgress,
                op: Some(running.op),
                map_version: running.version,
                counters,
                error: failure.map(|f| f.code),
                failing_rank: failure.and_then(|f| f.rank),
            };
        }

        if let Some(next) = state.queue.iter().find(|t| t.pool == pool) {
            return RebuildStatus {
                state: RebuildState::InProgress,
                op: Some(next.op),
                map_version: next.map_version,
                counters: previous.map(|s| s.counters).unwrap_or_default(),
                error: failure.map(|f| f.code),
                failing_rank: failure.and_then(|f| f.rank),
            };
        }

        previous.cloned().unwrap_or_else(RebuildStatus::not_started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimPoolMap, SimTransport};
    use crate::types::Counters;

    fn scheduler(rank: Rank) -> (Arc<Scheduler>, Arc<SimPoolMap>, PoolId) {
        let pool = PoolId::new();
        let map = Arc::new(SimPoolMap::new(pool, 4, 2));
        let transport = Arc::new(SimTransport::new(map.clone()));
        let (sched, _events) = Scheduler::with_events(
            rank,
            Arc::new(RebuildConfig::fast()),
            map.clone(),
            transport,
        );
        (Arc::new(sched), map, pool)
    }

    fn report(pool: PoolId) -> StatusReport {
        StatusReport {
            pool,
            rank: 1,
            leader: 0,
            version: 1,
            generation: 1,
            term: 1,
            seq: 1,
            re_report: false,
            counters: Counters::default(),
            scan_done: false,
            pull_done: false,
            stable_epoch: 1,
            dtx_resync_version: 1,
            error: None,
        }
    }

    #[tokio::test]
    async fn test_query_reflects_queue() {
        let (sched, _map, pool) = scheduler(0);
        assert_eq!(sched.query(pool).state, RebuildState::NotStarted);

        sched
            .schedule(pool, RebuildOp::Exclude, 2, &[1], ScheduleOptions::default())
            .unwrap();
        let status = sched.query(pool);
        assert_eq!(status.state, RebuildState::InProgress);
        assert_eq!(status.op, Some(RebuildOp::Exclude));
        assert_eq!(status.map_version, 2);
    }

    #[tokio::test]
    async fn test_schedule_merges_same_op() {
        let (sched, _map, pool) = scheduler(0);
        for (version, target) in [(2, 1), (3, 2)] {
            sched
                .schedule(pool, RebuildOp::Exclude, version, &[target], ScheduleOptions::default())
                .unwrap();
        }
        assert_eq!(sched.pending(), 1);

        sched
            .schedule(pool, RebuildOp::Reclaim, 3, &[], ScheduleOptions::default())
            .unwrap();
        assert_eq!(sched.pending(), 2);
    }

    #[tokio::test]
    async fn test_stopping_pool_ignores_new_work() {
        let (sched, _map, pool) = scheduler(0);
        sched
            .schedule(pool, RebuildOp::Drain, 2, &[3], ScheduleOptions::default())
            .unwrap();
        sched.stop_pool(pool).await;
        assert_eq!(sched.pending(), 0);

        sched
            .schedule(pool, RebuildOp::Drain, 3, &[3], ScheduleOptions::default())
            .unwrap();
        assert_eq!(sched.pending(), 0);
        assert!(sched.is_stopping(pool));
    }

    #[tokio::test]
    async fn test_regenerate_from_map() {
        let (sched, map, pool) = scheduler(0);
        map.set_targets_state(pool, &[1], TargetState::Down).unwrap();
        map.set_targets_state(pool, &[2], TargetState::Drain).unwrap();

        assert_eq!(sched.regenerate(pool).unwrap(), 2);
        let ops: Vec<RebuildOp> = sched.state.lock().queue.iter().map(|t| t.op).collect();
        assert!(ops.contains(&RebuildOp::Exclude));
        assert!(ops.contains(&RebuildOp::Drain));
    }

    #[tokio::test]
    async fn test_report_rejected_off_leader() {
        let (sched, _map, pool) = scheduler(1);
        assert_eq!(
            sched.apply_report(&report(pool)),
            Err(RebuildError::NotLeader(1))
        );

        let (sched, _map, pool) = scheduler(0);
        assert_eq!(sched.apply_report(&report(pool)), Ok(ReportOutcome::Stale));
    }

    #[tokio::test]
    async fn test_abort_drains_queue_and_stops_loop() {
        let (sched, _map, pool) = scheduler(0);
        sched
            .schedule(
                pool,
                RebuildOp::Exclude,
                2,
                &[1],
                ScheduleOptions {
                    delay: Duration::from_secs(60),
                    ..Default::default()
                },
            )
            .unwrap();

        let handle = tokio::spawn(sched.clone().run_loop());
        sched.abort_all().await;
        assert_eq!(sched.pending(), 0);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        // Aborted schedulers accept nothing new
        sched
            .schedule(pool, RebuildOp::Exclude, 3, &[1], ScheduleOptions::default())
            .unwrap();
        assert_eq!(sched.pending(), 0);
    }
}
