//! Leader-side control loop
//!
//! One loop per launched task, driven as a state machine:
//! `WaitMapSync -> Prepare -> BroadcastScan -> TrackProgress -> Finalize`,
//! after which the retry policy decides whether and how to resubmit.

use futures::future::join_all;
use std::sync::Arc;
use tessel_core::{Epoch, MapVersion, Rank, TargetId, EPOCH_MAX};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterMap;
use crate::config::ReclaimBoundary;
use crate::error::{RebuildError, Result};
use crate::global_tracker::GlobalTracker;
use crate::messages::{LeaderNotice, ScanRequest};
use crate::scheduler::{ScheduleOptions, Scheduler};
use crate::types::{Counters, RebuildOp, RebuildTask, TargetState};

/// Control loop stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WaitMapSync,
    Prepare,
    BroadcastScan,
    TrackProgress,
    Finalize,
}

/// What to do after a failed loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Leadership lost; the new leader re-drives the version
    Yield,
    /// Same operation and version at the next generation
    Resubmit,
    /// Undo a partial reintegration or extension
    CompensateExclude,
    /// Undo a partial drain
    CompensateReintegrate,
    /// Permanently complete with the error recorded
    Done,
}

/// Retry policy for a failed operation
pub fn retry_decision(op: RebuildOp, err: &RebuildError) -> RetryDecision {
    match err {
        RebuildError::NotLeader(_) => return RetryDecision::Yield,
        RebuildError::Shutdown(_) | RebuildError::Aborted => return RetryDecision::Done,
        _ => {}
    }
    if err.is_retryable() {
        return RetryDecision::Resubmit;
    }
    match op {
        RebuildOp::Reclaim | RebuildOp::FailReclaim | RebuildOp::Exclude => {
            RetryDecision::Resubmit
        }
        RebuildOp::Reintegrate | RebuildOp::Extend => RetryDecision::CompensateExclude,
        RebuildOp::Drain => RetryDecision::CompensateReintegrate,
        RebuildOp::Upgrade => RetryDecision::Done,
    }
}

/// Target state an operation expects its targets to be in
fn pending_state(op: RebuildOp) -> Option<TargetState> {
    match op {
        RebuildOp::Exclude => Some(TargetState::Down),
        RebuildOp::Drain => Some(TargetState::Drain),
        RebuildOp::Reintegrate => Some(TargetState::Up),
        RebuildOp::Extend => Some(TargetState::New),
        RebuildOp::Upgrade | RebuildOp::Reclaim | RebuildOp::FailReclaim => None,
    }
}

/// Target state after a successful operation
fn final_state(op: RebuildOp) -> Option<TargetState> {
    match op {
        RebuildOp::Exclude | RebuildOp::Drain => Some(TargetState::DownOut),
        RebuildOp::Reintegrate | RebuildOp::Extend => Some(TargetState::UpIn),
        RebuildOp::Upgrade | RebuildOp::Reclaim | RebuildOp::FailReclaim => None,
    }
}

/// Result of one control loop run, consumed by the scheduler
#[derive(Debug)]
pub struct LoopOutcome {
    pub result: Result<()>,
    /// No further attempt will be made for this failure
    pub permanent: bool,
    pub counters: Counters,
    pub failing_rank: Option<Rank>,
}

pub(crate) struct ControlLoop {
    sched: Arc<Scheduler>,
    task: RebuildTask,
    term: u64,
    stage: Stage,
    tracker: Option<Arc<GlobalTracker>>,
}

impl ControlLoop {
    pub(crate) fn new(sched: Arc<Scheduler>, task: RebuildTask) -> Self {
        Self {
            sched,
            task,
            term: 0,
            stage: Stage::WaitMapSync,
            tracker: None,
        }
    }

    fn cluster(&self) -> &Arc<dyn ClusterMap> {
        self.sched.cluster()
    }

    pub(crate) async fn run(mut self) -> LoopOutcome {
        let result = match self.drive().await {
            Err(RebuildError::NotLeader(rank)) => {
                info!(stage = ?self.stage, "No longer leader, yielding");
                return LoopOutcome {
                    result: Err(RebuildError::NotLeader(rank)),
                    permanent: false,
                    counters: Counters::default(),
                    failing_rank: None,
                };
            }
            other => other,
        };

        // Participants stop local work on every path
        self.notify_done().await;

        self.stage = Stage::Finalize;
        let counters = self
            .tracker
            .as_ref()
            .map(|t| t.counters())
            .unwrap_or_default();
        match result {
            Ok(reclaim) => {
                let result = self.finalize_success(reclaim);
                let permanent = result.is_err();
                LoopOutcome {
                    result,
                    permanent,
                    counters,
                    failing_rank: None,
                }
            }
            Err(err) => {
                let failing_rank = self.tracker.as_ref().and_then(|t| t.error()).map(|e| e.1);
                let permanent = self.finalize_failure(&err);
                LoopOutcome {
                    result: Err(err),
                    permanent,
                    counters,
                    failing_rank,
                }
            }
        }
    }

    /// Returns the reclaim epoch when data was scanned, `None` for a pure
    /// state flip
    async fn drive(&mut self) -> Result<Option<Epoch>> {
        self.term = self.ensure_leader(None)?;

        self.stage = Stage::WaitMapSync;
        self.wait_map_sync().await?;

        self.stage = Stage::Prepare;
        if !self.prepare()? {
            info!(targets = ?self.task.targets, "No data movement needed");
            return Ok(None);
        }

        self.stage = Stage::BroadcastScan;
        let tracker = self.broadcast_scan().await?;

        self.stage = Stage::TrackProgress;
        self.track_progress(&tracker).await?;
        Ok(Some(tracker.reclaim_epoch()))
    }

    fn ensure_leader(&self, term: Option<u64>) -> Result<u64> {
        let leader = self.cluster().leader();
        if leader.rank != self.sched.rank() || term.is_some_and(|t| t != leader.term) {
            return Err(RebuildError::NotLeader(self.sched.rank()));
        }
        Ok(leader.term)
    }

    fn check_continue(&self) -> Result<()> {
        if self.sched.is_aborted() {
            return Err(RebuildError::Aborted);
        }
        if self.sched.is_stopping(self.task.pool) {
            return Err(RebuildError::Shutdown(self.task.pool));
        }
        self.ensure_leader(Some(self.term)).map(|_| ())
    }

    /// Wait until every engine has acknowledged the current map
    #[instrument(skip(self))]
    async fn wait_map_sync(&self) -> Result<()> {
        let pool = self.task.pool;
        loop {
            self.check_continue()?;
            let current = self.cluster().map_version(pool)?;
            let acked = self.cluster().acked_version(pool)?;
            if acked >= current {
                return Ok(());
            }
            debug!(current, acked, "Waiting for map acknowledgement");
            tokio::time::sleep(self.sched.config().map_sync_poll()).await;
        }
    }

    /// Decide between data movement and a pure state flip
    fn prepare(&mut self) -> Result<bool> {
        let Some(expected) = pending_state(self.task.op) else {
            return Ok(true);
        };
        let targets = self.cluster().targets(self.task.pool)?;
        let relevant: Vec<TargetId> = self
            .task
            .targets
            .iter()
            .copied()
            .filter(|id| targets.iter().any(|t| t.id == *id && t.state == expected))
            .collect();
        if relevant.len() != self.task.targets.len() {
            debug!(
                requested = ?self.task.targets,
                relevant = ?relevant,
                "Dropping targets already past this operation"
            );
        }
        self.task.targets = relevant;
        Ok(!self.task.targets.is_empty())
    }

    /// Start scanning everywhere and fix the migration read epoch
    #[instrument(skip(self))]
    async fn broadcast_scan(&mut self) -> Result<Arc<GlobalTracker>> {
        let pool = self.task.pool;
        let ranks = self.cluster().ranks();
        let participants: Vec<Rank> = ranks.iter().filter(|r| r.alive).map(|r| r.rank).collect();
        let excluded_ranks: Vec<Rank> = ranks.iter().filter(|r| !r.alive).map(|r| r.rank).collect();
        let tgt_count = self.cluster().targets(pool)?.len() as u32;

        let tracker = Arc::new(GlobalTracker::new(
            pool,
            self.task.op,
            self.task.map_version,
            self.task.generation,
            self.term,
            &participants,
        ));
        self.sched.attach_tracker(pool, tracker.clone());
        self.tracker = Some(tracker.clone());

        let req = ScanRequest {
            pool,
            leader: self.sched.rank(),
            term: self.term,
            op: self.task.op,
            version: self.task.map_version,
            generation: self.task.generation,
            layout_version: self.task.layout_version,
            targets: self.task.targets.clone(),
            tgt_count,
            excluded_ranks,
            reclaim_epoch: self.task.reclaim_epoch,
            min_version: self.task.min_version,
        };

        let replies = self
            .sched
            .transport()
            .broadcast_scan(&participants, req)
            .await?;
        // Epoch 0 means unset; an empty store still reads from epoch 1
        let stable = replies
            .iter()
            .map(|(_, r)| r.stable_epoch)
            .min()
            .unwrap_or(0)
            .max(1);
        tracker.set_stable_epoch(stable);

        info!(
            participants = participants.len(),
            stable_epoch = stable,
            "Scan started on all participants"
        );
        Ok(tracker)
    }

    fn notice(&self, tracker: &GlobalTracker, global_done: bool) -> LeaderNotice {
        LeaderNotice {
            pool: self.task.pool,
            leader: self.sched.rank(),
            version: self.task.map_version,
            generation: self.task.generation,
            term: self.term,
            global_scan_done: tracker.scan_done(),
            global_done,
            stable_epoch: tracker.stable_epoch(),
            dtx_resync_version: tracker.dtx_resync(),
        }
    }

    /// Push the current notice to every live participant; losses are
    /// repaired by the next poll
    async fn send_notices(&self, tracker: &GlobalTracker, notice: LeaderNotice) -> usize {
        let transport = self.sched.transport();
        let calls = tracker
            .live_participants()
            .into_iter()
            .map(move |rank| async move { (rank, transport.leader_notice(rank, notice).await) });

        let mut failed = 0;
        for (rank, result) in join_all(calls).await {
            if let Err(e) = result {
                debug!(rank, error = %e, "Leader notice not delivered");
                failed += 1;
            }
        }
        failed
    }

    /// Poll aggregate progress until every participant has pulled
    #[instrument(skip(self, tracker))]
    async fn track_progress(&self, tracker: &GlobalTracker) -> Result<()> {
        let config = self.sched.config();
        let mut last_log: Option<Instant> = None;
        let started = Instant::now();

        loop {
            self.check_continue()?;

            for rank in self.cluster().ranks() {
                if !rank.alive {
                    tracker.mark_dead(rank.rank);
                }
            }

            if let Some((code, rank)) = tracker.error() {
                return Err(RebuildError::Remote { rank, code });
            }

            let pull_done = tracker.pull_done();
            self.send_notices(tracker, self.notice(tracker, false)).await;

            let due = last_log.map_or(true, |t| t.elapsed() >= config.progress_log_interval());
            if due || pull_done {
                let snap = tracker.snapshot();
                info!(
                    scanned = snap.scan_done,
                    pulled = snap.pull_done,
                    participants = snap.participants,
                    to_migrate = snap.counters.to_migrate,
                    objects = snap.counters.objects,
                    records = snap.counters.records,
                    bytes = snap.counters.bytes,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Rebuild progress"
                );
                last_log = Some(Instant::now());
            }

            if pull_done {
                return Ok(());
            }
            tokio::time::sleep(config.poll_interval()).await;
        }
    }

    /// Final notice: tell every participant to stop
    async fn notify_done(&self) {
        let Some(tracker) = &self.tracker else {
            return;
        };
        let notice = self.notice(tracker, true);
        for attempt in 0..=self.sched.config().object_list_retries {
            if self.send_notices(tracker, notice).await == 0 {
                return;
            }
            debug!(attempt, "Retrying final notice");
            tokio::time::sleep(self.sched.config().poll_interval()).await;
        }
        warn!("Final notice not delivered to every participant");
    }

    fn flip_targets(&self, state: TargetState) -> Result<MapVersion> {
        let version = self
            .cluster()
            .set_targets_state(self.task.pool, &self.task.targets, state)?;
        info!(targets = ?self.task.targets, ?state, version, "Target states updated");
        Ok(version)
    }

    fn finalize_success(&self, reclaim: Option<Epoch>) -> Result<()> {
        let pool = self.task.pool;
        let version = match final_state(self.task.op) {
            Some(state) if !self.task.targets.is_empty() => self.flip_targets(state)?,
            _ => self.cluster().map_version(pool)?,
        };

        let needs_reclaim = !matches!(
            self.task.op,
            RebuildOp::Upgrade | RebuildOp::Reclaim | RebuildOp::FailReclaim
        );
        if let (true, Some(reclaim)) = (needs_reclaim, reclaim) {
            let reclaim_epoch = match self.sched.config().reclaim_boundary {
                ReclaimBoundary::StableEpoch => reclaim,
                ReclaimBoundary::Unbounded => EPOCH_MAX,
            };
            self.sched.schedule(
                pool,
                RebuildOp::Reclaim,
                version,
                &self.task.targets,
                ScheduleOptions {
                    reclaim_epoch,
                    ..Default::default()
                },
            )?;
        }
        info!("Rebuild completed");
        Ok(())
    }

    /// Apply the retry policy; returns whether the failure is final
    fn finalize_failure(&self, err: &RebuildError) -> bool {
        let decision = retry_decision(self.task.op, err);
        warn!(error = %err, ?decision, "Rebuild failed");

        let result = match decision {
            RetryDecision::Yield => Ok(false),
            RetryDecision::Resubmit => {
                let delay = self.sched.config().retry_delay();
                self.sched.resubmit(self.task.clone(), delay);
                Ok(false)
            }
            RetryDecision::CompensateExclude => {
                self.compensate(TargetState::Down, RebuildOp::Exclude, true)
            }
            RetryDecision::CompensateReintegrate => {
                self.compensate(TargetState::Up, RebuildOp::Reintegrate, false)
            }
            RetryDecision::Done => {
                if self.scanned() && self.task.op.moves_data() {
                    self.schedule_fail_reclaim(self.task.map_version).map(|_| true)
                } else {
                    Ok(true)
                }
            }
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to reschedule after failure");
            true
        })
    }

    fn scanned(&self) -> bool {
        self.tracker.is_some()
    }

    fn compensate(&self, state: TargetState, op: RebuildOp, fail_reclaim: bool) -> Result<bool> {
        let pool = self.task.pool;
        let version = self.flip_targets(state)?;
        if fail_reclaim && self.scanned() {
            self.schedule_fail_reclaim(version)?;
        }
        info!(%op, version, targets = ?self.task.targets, "Scheduling compensating rebuild");
        self.sched.schedule(
            pool,
            op,
            version,
            &self.task.targets,
            ScheduleOptions::default(),
        )?;
        Ok(false)
    }

    /// Discard what this version migrated, keeping earlier data
    fn schedule_fail_reclaim(&self, version: MapVersion) -> Result<()> {
        let version = version.max(self.cluster().map_version(self.task.pool)?);
        self.sched.schedule(
            self.task.pool,
            RebuildOp::FailReclaim,
            version,
            &self.task.targets,
            ScheduleOptions {
                reclaim_epoch: EPOCH_MAX,
                min_version: self.task.map_version,
                ..Default::default()
            },
        )
    }
}
