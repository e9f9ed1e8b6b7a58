//! Per-engine rebuild service
//!
//! `RebuildNode` bundles one engine's collaborators, its tracker registry
//! and its scheduler, and implements the handlers behind every protocol
//! message.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tessel_core::{PoolId, Rank};
use tessel_storage::{ObjectRef, ObjectStore};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, instrument, Instrument};

use crate::cluster::{ClusterMap, DtxResync, PlacementOracle};
use crate::config::RebuildConfig;
use crate::error::{RebuildError, Result};
use crate::global_tracker::ReportOutcome;
use crate::messages::{
    FetchReply, FetchRequest, Iod, LeaderNotice, ObjectListRequest, ScanReply, ScanRequest,
    StatusReport, TransferUnit, ValuesRequest,
};
use crate::scheduler::{Scheduler, SchedulerEvent};
use crate::target_tracker::{NoticeOutcome, TargetTracker, TrackerRegistry};
use crate::transport::Transport;
use crate::types::Leadership;
use crate::{puller, scanner, status};

/// Collaborators of one engine
#[derive(Clone)]
pub struct NodeContext {
    pub rank: Rank,
    pub config: Arc<RebuildConfig>,
    pub store: Arc<dyn ObjectStore>,
    pub cluster: Arc<dyn ClusterMap>,
    pub placement: Arc<dyn PlacementOracle>,
    pub dtx: Arc<dyn DtxResync>,
    pub transport: Arc<dyn Transport>,
}

pub struct RebuildNode {
    pub(crate) rank: Rank,
    pub(crate) config: Arc<RebuildConfig>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) cluster: Arc<dyn ClusterMap>,
    pub(crate) placement: Arc<dyn PlacementOracle>,
    pub(crate) dtx: Arc<dyn DtxResync>,
    pub(crate) transport: Arc<dyn Transport>,
    trackers: Arc<TrackerRegistry>,
    scheduler: Arc<Scheduler>,
    /// Signalled when local space is freed
    pub(crate) space: Notify,
}

impl RebuildNode {
    pub fn new(ctx: NodeContext) -> Arc<Self> {
        let scheduler = Scheduler::new(
            ctx.rank,
            ctx.config.clone(),
            ctx.cluster.clone(),
            ctx.transport.clone(),
        );
        Self::with_scheduler(ctx, scheduler)
    }

    /// Create a node whose scheduler streams lifecycle events
    pub fn with_events(ctx: NodeContext) -> (Arc<Self>, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (scheduler, events) = Scheduler::with_events(
            ctx.rank,
            ctx.config.clone(),
            ctx.cluster.clone(),
            ctx.transport.clone(),
        );
        (Self::with_scheduler(ctx, scheduler), events)
    }

    fn with_scheduler(ctx: NodeContext, scheduler: Scheduler) -> Arc<Self> {
        Arc::new(Self {
            rank: ctx.rank,
            config: ctx.config,
            store: ctx.store,
            cluster: ctx.cluster,
            placement: ctx.placement,
            dtx: ctx.dtx,
            transport: ctx.transport,
            trackers: Arc::new(TrackerRegistry::new()),
            scheduler: Arc::new(scheduler),
            space: Notify::new(),
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn trackers(&self) -> &TrackerRegistry {
        &self.trackers
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Run this engine's scheduler loop
    pub fn start(&self) -> JoinHandle<()> {
        tokio::spawn(self.scheduler.clone().run_loop())
    }

    /// Wake pullers parked on a full target
    pub fn space_reclaimed(&self) {
        info!(rank = self.rank, "Space reclaimed, waking parked pullers");
        self.space.notify_waiters();
    }

    /// Transfer units currently parked for lack of space
    pub fn parked_units(&self) -> usize {
        self.trackers.all().iter().map(|t| t.parked()).sum()
    }

    /// Begin (or re-join) local work for an operation
    #[instrument(
        skip(self, req),
        fields(rank = self.rank, pool = %req.pool, op = %req.op, version = req.version,
               generation = req.generation, term = req.term)
    )]
    pub async fn handle_scan(self: &Arc<Self>, req: ScanRequest) -> Result<ScanReply> {
        let reply = ScanReply {
            stable_epoch: self.store.stable_epoch(),
        };

        for tracker in self.trackers.for_pool(req.pool) {
            if tracker.is_retired() {
                continue;
            }
            if tracker.version > req.version {
                return Err(RebuildError::Stale(format!(
                    "version {} superseded by {}",
                    req.version, tracker.version
                )));
            }
            if tracker.version < req.version {
                debug!(old = tracker.version, "Retiring tracker of older version");
                tracker.retire();
                continue;
            }
            if req.generation != tracker.generation && req.term > tracker.leader().term {
                // Generations restart with each leader
                debug!(old = tracker.generation, "Retiring tracker of previous leader");
                tracker.retire();
                continue;
            }
            if req.generation < tracker.generation {
                return Err(RebuildError::Stale(format!(
                    "generation {} superseded by {}",
                    req.generation, tracker.generation
                )));
            }
            if req.generation > tracker.generation {
                debug!(old = tracker.generation, "Retiring tracker of older generation");
                tracker.retire();
                continue;
            }

            // Duplicate delivery, possibly from a new leader
            let leadership = Leadership {
                rank: req.leader,
                term: req.term,
            };
            if tracker.update_leader(leadership)? {
                info!(leader = req.leader, "Tracker adopted new leader");
            }
            return Ok(reply);
        }

        let tracker = self.trackers.create(&req, self.config.migrated_record_cap);
        info!(
            targets = ?req.targets,
            leader = req.leader,
            "Rebuild tracker created"
        );

        let span = info_span!(
            "tracker",
            rank = self.rank,
            pool = %req.pool,
            version = req.version,
            generation = req.generation
        );
        tokio::spawn(self.clone().drive(tracker).instrument(span));
        Ok(reply)
    }

    /// Own the tracker: start workers, wait for the end, tear down
    async fn drive(self: Arc<Self>, tracker: Arc<TargetTracker>) {
        tokio::spawn(status::run_reporter(self.clone(), tracker.acquire()).in_current_span());
        tokio::spawn(scanner::run(self.clone(), tracker.acquire()).in_current_span());
        for _ in 0..self.config.pullers_per_tracker {
            tokio::spawn(puller::run(self.clone(), tracker.acquire()).in_current_span());
        }

        tracker
            .wait_until(|t| t.is_global_done() || t.is_retired())
            .await;
        tracker.begin_teardown(&self.trackers).await;
    }

    /// Queue announced objects for local pulling
    #[instrument(skip(self, req), fields(rank = self.rank, pool = %req.pool, version = req.version))]
    pub async fn handle_object_list(&self, req: ObjectListRequest) -> Result<()> {
        let tracker = self.trackers.find(req.pool, req.version).ok_or_else(|| {
            RebuildError::TryAgain(format!("no tracker for version {}", req.version))
        })?;
        if req.generation < tracker.generation {
            return Err(RebuildError::Stale(format!(
                "generation {} superseded by {}",
                req.generation, tracker.generation
            )));
        }
        if req.generation > tracker.generation {
            return Err(RebuildError::TryAgain(format!(
                "generation {} not started",
                req.generation
            )));
        }
        if tracker.should_stop() {
            debug!("Tracker stopping, dropping object list");
            return Ok(());
        }

        let queued = tracker.insert(&req.entries, req.layout_version);
        debug!(
            src_rank = req.src_rank,
            entries = req.entries.len(),
            queued,
            "Object list received"
        );
        Ok(())
    }

    /// Enumerate a local object for a remote puller
    pub fn handle_fetch_object(&self, req: FetchRequest) -> Result<FetchReply> {
        let obj = ObjectRef {
            pool: req.pool,
            target: req.source,
            cont: req.cont,
            oid: req.oid,
        };
        let entry = self
            .store
            .object(&obj)?
            .ok_or_else(|| RebuildError::NotFound(req.oid.to_string()))?;
        let records = self.store.fetch_object(&obj, req.epoch)?;

        let units = records
            .into_iter()
            .filter_map(|record| {
                let inline = (record.data_size() as usize) < req.inline_threshold;
                let mut iods = Vec::new();
                let mut values = Vec::new();
                let mut akey_punches = Vec::new();
                for akey in record.akeys {
                    if let Some(punched) = akey.punched {
                        akey_punches.push((akey.akey.clone(), punched));
                    }
                    for version in akey.values {
                        iods.push(Iod {
                            akey: akey.akey.clone(),
                            epoch: version.epoch,
                            size: version.data.len() as u64,
                        });
                        values.push(version.data);
                    }
                }
                if iods.is_empty() && akey_punches.is_empty() && record.punched.is_none() {
                    return None;
                }
                Some(TransferUnit {
                    cont: req.cont,
                    oid: req.oid,
                    dkey: record.dkey,
                    dkey_punch: record.punched,
                    akey_punches,
                    iods,
                    inline: inline.then_some(values),
                })
            })
            .collect();

        Ok(FetchReply {
            layout_version: entry.layout_version,
            object_punch: entry.punched.filter(|&p| p <= req.epoch),
            units,
        })
    }

    /// Bulk value fetch for a remote puller: fills a buffer of exactly
    /// the size the destination asked for
    pub fn handle_fetch_values(&self, req: ValuesRequest) -> Result<Bytes> {
        let obj = ObjectRef {
            pool: req.pool,
            target: req.source,
            cont: req.cont,
            oid: req.oid,
        };
        let values = self.store.fetch_values(&obj, &req.dkey, &req.iods)?;
        let total: u64 = values.iter().map(|v| v.len() as u64).sum();
        if total != req.size {
            return Err(RebuildError::Internal(format!(
                "bulk buffer of {} bytes cannot hold {total} bytes of {}",
                req.size, req.oid
            )));
        }

        let mut buf = BytesMut::with_capacity(req.size as usize);
        for value in &values {
            buf.extend_from_slice(value);
        }
        Ok(buf.freeze())
    }

    /// Leader side of the bottom-up report. Fails unless the report (or
    /// an earlier delivery of it) was applied, so the sender keeps its delta.
    pub fn handle_report(&self, report: StatusReport) -> Result<()> {
        let outcome = self.scheduler.apply_report(&report)?;
        debug!(rank = report.rank, seq = report.seq, ?outcome, "Status report");
        match outcome {
            ReportOutcome::Applied | ReportOutcome::Duplicate => Ok(()),
            ReportOutcome::Stale | ReportOutcome::UnknownRank => Err(RebuildError::Stale(format!(
                "report {} from rank {} not applied: {outcome:?}",
                report.seq, report.rank
            ))),
        }
    }

    /// Follower side of the top-down notice
    pub fn handle_notice(&self, notice: LeaderNotice) -> Result<()> {
        let Some(tracker) = self
            .trackers
            .find_generation(notice.pool, notice.version, notice.generation)
        else {
            return Ok(());
        };
        if tracker.apply_notice(&notice) == NoticeOutcome::Applied && notice.global_done {
            debug!(pool = %notice.pool, version = notice.version, "Leader declared done");
        }
        Ok(())
    }

    /// Number of live trackers for a pool
    pub fn tracker_count(&self, pool: PoolId) -> usize {
        self.trackers.for_pool(pool).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RebuildConfig;
    use crate::messages::ObjectListEntry;
    use crate::sim::SimCluster;
    use crate::types::RebuildOp;
    use tessel_core::DEFAULT_LAYOUT_VERSION;

    fn scan_request(cluster: &SimCluster, version: u32, generation: u32) -> ScanRequest {
        ScanRequest {
            pool: cluster.pool,
            leader: 0,
            term: 1,
            op: RebuildOp::Exclude,
            version,
            generation,
            layout_version: DEFAULT_LAYOUT_VERSION,
            targets: vec![2],
            tgt_count: 3,
            excluded_ranks: Vec::new(),
            reclaim_epoch: 0,
            min_version: 0,
        }
    }

    fn held_cluster() -> SimCluster {
        let cluster = SimCluster::start(3, 2, RebuildConfig::fast());
        cluster.dtx.hold_at(cluster.pool, 0);
        cluster
    }

    #[tokio::test]
    async fn test_duplicate_scan_is_idempotent() {
        let cluster = held_cluster();
        let node = cluster.node(1);

        node.handle_scan(scan_request(&cluster, 5, 1)).await.unwrap();
        node.handle_scan(scan_request(&cluster, 5, 1)).await.unwrap();
        assert_eq!(node.tracker_count(cluster.pool), 1);

        // A newer leader re-sending the scan takes over the tracker
        let mut req = scan_request(&cluster, 5, 1);
        req.leader = 2;
        req.term = 2;
        node.handle_scan(req).await.unwrap();
        let tracker = node.trackers().find(cluster.pool, 5).unwrap();
        assert_eq!(tracker.leader().rank, 2);
        assert_eq!(node.tracker_count(cluster.pool), 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_scan_generations() {
        let cluster = held_cluster();
        let node = cluster.node(1);

        node.handle_scan(scan_request(&cluster, 5, 2)).await.unwrap();
        let err = node
            .handle_scan(scan_request(&cluster, 5, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RebuildError::Stale(_)));

        let old = node.trackers().find(cluster.pool, 5).unwrap();
        node.handle_scan(scan_request(&cluster, 5, 3)).await.unwrap();
        assert!(old.is_retired());
        assert_eq!(node.trackers().find(cluster.pool, 5).unwrap().generation, 3);

        let err = node
            .handle_scan(scan_request(&cluster, 4, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, RebuildError::Stale(_)));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_next_operation_at_same_version_replaces_tracker() {
        let cluster = held_cluster();
        let node = cluster.node(1);

        let mut fail_reclaim = scan_request(&cluster, 5, 1);
        fail_reclaim.op = RebuildOp::FailReclaim;
        node.handle_scan(fail_reclaim).await.unwrap();
        let old = node.trackers().find(cluster.pool, 5).unwrap();

        node.handle_scan(scan_request(&cluster, 5, 2)).await.unwrap();
        assert!(old.is_retired());
        let current = node.trackers().find(cluster.pool, 5).unwrap();
        assert_eq!(current.op, RebuildOp::Exclude);
        assert_eq!(current.generation, 2);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_new_leader_restarts_generations() {
        let cluster = held_cluster();
        let node = cluster.node(1);

        node.handle_scan(scan_request(&cluster, 5, 4)).await.unwrap();
        let old = node.trackers().find(cluster.pool, 5).unwrap();

        let mut req = scan_request(&cluster, 5, 1);
        req.leader = 2;
        req.term = 2;
        node.handle_scan(req).await.unwrap();
        assert!(old.is_retired());
        let current = node.trackers().find(cluster.pool, 5).unwrap();
        assert_eq!(current.generation, 1);
        assert_eq!(current.leader().term, 2);

        // Notices address the exact generation
        node.handle_notice(LeaderNotice {
            pool: cluster.pool,
            leader: 2,
            version: 5,
            generation: 4,
            term: 2,
            global_scan_done: true,
            global_done: true,
            stable_epoch: 7,
            dtx_resync_version: 5,
        })
        .unwrap();
        assert!(!current.is_global_done());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_unapplied_report_is_rejected() {
        let cluster = held_cluster();
        let report = StatusReport {
            pool: cluster.pool,
            rank: 1,
            leader: 0,
            version: 5,
            generation: 1,
            term: 1,
            seq: 1,
            re_report: false,
            counters: crate::types::Counters {
                objects: 3,
                ..Default::default()
            },
            scan_done: true,
            pull_done: false,
            stable_epoch: 1,
            dtx_resync_version: 5,
            error: None,
        };

        // Nothing is running on the leader, so the delta must not count as sent
        let err = cluster.node(0).handle_report(report).unwrap_err();
        assert!(matches!(err, RebuildError::Stale(_)));
        assert!(err.is_retryable());
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_object_list_routing() {
        let cluster = held_cluster();
        let node = cluster.node(1);
        let entry = ObjectListEntry {
            cont: cluster.cont,
            oid: tessel_core::ObjectId::new(1, 2),
            epoch: 3,
            punched: None,
            shard: 0,
            target: 1,
            source: 0,
        };
        let list = |generation| ObjectListRequest {
            pool: cluster.pool,
            src_rank: 0,
            version: 5,
            generation,
            stable_epoch: 3,
            layout_version: DEFAULT_LAYOUT_VERSION,
            op: RebuildOp::Exclude,
            entries: vec![entry],
        };

        let err = node.handle_object_list(list(2)).await.unwrap_err();
        assert!(matches!(err, RebuildError::TryAgain(_)));

        node.handle_scan(scan_request(&cluster, 5, 2)).await.unwrap();
        let err = node.handle_object_list(list(1)).await.unwrap_err();
        assert!(matches!(err, RebuildError::Stale(_)));
        let err = node.handle_object_list(list(3)).await.unwrap_err();
        assert!(matches!(err, RebuildError::TryAgain(_)));

        node.handle_object_list(list(2)).await.unwrap();
        node.handle_object_list(list(2)).await.unwrap();
        let tracker = node.trackers().find(cluster.pool, 5).unwrap();
        assert_eq!(tracker.counters().to_migrate, 1);
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_object_inlines_small_units() {
        let cluster = SimCluster::start(2, 2, RebuildConfig::fast());
        let oid = cluster
            .write("small", b"d1", b"a", Bytes::from_static(b"tiny"))
            .unwrap();
        cluster
            .write("small", b"d2", b"a", Bytes::from(vec![7u8; 4096]))
            .unwrap();
        let node = cluster.node(0);

        let reply = node
            .handle_fetch_object(FetchRequest {
                pool: cluster.pool,
                source: 0,
                cont: cluster.cont,
                oid,
                epoch: tessel_core::EPOCH_MAX,
                inline_threshold: 1024,
            })
            .unwrap();
        assert_eq!(reply.units.len(), 2);
        let small = reply.units.iter().find(|u| &u.dkey[..] == b"d1").unwrap();
        let large = reply.units.iter().find(|u| &u.dkey[..] == b"d2").unwrap();
        assert_eq!(small.inline.as_ref().map(|v| v.len()), Some(1));
        assert!(large.inline.is_none());
        assert_eq!(large.data_size(), 4096);

        let values = node
            .handle_fetch_values(ValuesRequest {
                pool: cluster.pool,
                source: 0,
                cont: cluster.cont,
                oid,
                dkey: large.dkey.clone(),
                iods: large.iods.iter().map(|i| (i.akey.clone(), i.epoch)).collect(),
                size: large.data_size(),
            })
            .unwrap();
        assert_eq!(values.len(), 4096);
        assert!(values.iter().all(|&b| b == 7));

        let err = node
            .handle_fetch_values(ValuesRequest {
                pool: cluster.pool,
                source: 0,
                cont: cluster.cont,
                oid,
                dkey: large.dkey.clone(),
                iods: large.iods.iter().map(|i| (i.akey.clone(), i.epoch)).collect(),
                size: 100,
            })
            .unwrap_err();
        assert!(matches!(err, RebuildError::Internal(_)));
        cluster.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_missing_object_is_not_found() {
        let cluster = SimCluster::start(2, 2, RebuildConfig::fast());
        let err = cluster
            .node(0)
            .handle_fetch_object(FetchRequest {
                pool: cluster.pool,
                source: 0,
                cont: cluster.cont,
                oid: tessel_core::ObjectId::new(9, 9),
                epoch: 10,
                inline_threshold: 1024,
            })
            .unwrap_err();
        assert!(err.code().is_benign());
        cluster.shutdown().await;
    }
}
