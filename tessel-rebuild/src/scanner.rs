//! Local object scan
//!
//! Walks every object shard on this rank's targets under the stable read
//! epoch and hands each one to an op-specific visitor: rebuild ops announce
//! objects to their destinations, reclaim ops discard what is no longer
//! placed here, and upgrade rewrites layouts.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tessel_core::{Epoch, EpochRange, Rank, TesselError, EPOCH_MAX, EPOCH_UNSET};
use tessel_storage::ObjectEntry;
use tracing::{debug, info, warn};

use crate::cluster::rank_of;
use crate::error::{ErrorCode, RebuildError, Result};
use crate::messages::{ObjectListEntry, ObjectListRequest};
use crate::node::RebuildNode;
use crate::target_tracker::{TargetTracker, TrackerRef};
use crate::types::{Counters, RebuildOp, TargetInfo};

/// Per-object action of one scan
#[async_trait]
trait ObjectVisitor: Send {
    async fn visit(&mut self, entry: &ObjectEntry) -> Result<()>;

    /// Called once after the last object
    async fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Scanner task body
pub(crate) async fn run(node: Arc<RebuildNode>, tracker: TrackerRef) {
    let Some(epoch) = tracker.wait_ready().await else {
        debug!("Tracker stopped before scan started");
        return;
    };

    match scan(&node, &tracker, epoch).await {
        Ok(_) if tracker.should_stop() => debug!("Scan interrupted"),
        Ok(scanned) => {
            info!(scanned, epoch, "Local scan complete");
            tracker.set_scan_done();
        }
        Err(e) => {
            warn!(error = %e, "Local scan failed");
            tracker.set_error(e);
        }
    }
}

async fn scan(node: &Arc<RebuildNode>, tracker: &Arc<TargetTracker>, epoch: Epoch) -> Result<usize> {
    let targets = node.cluster.targets(tracker.pool)?;
    let local: HashSet<_> = targets
        .iter()
        .filter(|t| t.rank == node.rank)
        .map(|t| t.id)
        .collect();

    let mut visitor: Box<dyn ObjectVisitor> = match tracker.op {
        RebuildOp::Reclaim | RebuildOp::FailReclaim => Box::new(ReclaimVisitor {
            node: node.clone(),
            tracker: tracker.clone(),
        }),
        RebuildOp::Upgrade => Box::new(UpgradeVisitor {
            dispatcher: Dispatcher::new(node, tracker, targets, epoch),
        }),
        _ => Box::new(RebuildVisitor {
            dispatcher: Dispatcher::new(node, tracker, targets, epoch),
        }),
    };

    let objects = node.store.list_objects(tracker.pool)?;
    let budget = node.config.scan_yield_budget.max(1);
    let mut scanned = 0usize;

    for entry in objects.iter().filter(|e| local.contains(&e.obj.target)) {
        if tracker.should_stop() {
            return Ok(scanned);
        }
        match visitor.visit(entry).await {
            Ok(()) => {}
            Err(e) if e.code().is_benign() => {
                debug!(oid = %entry.obj.oid, error = %e, "Object vanished during scan");
            }
            Err(e) => return Err(e),
        }
        scanned += 1;
        if scanned % budget == 0 {
            tokio::task::yield_now().await;
        }
    }

    visitor.finish().await?;
    Ok(scanned)
}

/// Batches object announcements per destination rank
struct Dispatcher {
    node: Arc<RebuildNode>,
    tracker: Arc<TargetTracker>,
    targets: Vec<TargetInfo>,
    epoch: Epoch,
    batches: HashMap<Rank, Vec<ObjectListEntry>>,
}

impl Dispatcher {
    fn new(
        node: &Arc<RebuildNode>,
        tracker: &Arc<TargetTracker>,
        targets: Vec<TargetInfo>,
        epoch: Epoch,
    ) -> Self {
        Self {
            node: node.clone(),
            tracker: tracker.clone(),
            targets,
            epoch,
            batches: HashMap::new(),
        }
    }

    async fn dispatch(&mut self, entry: ObjectListEntry) -> Result<()> {
        let rank = rank_of(&self.targets, entry.target).ok_or_else(|| {
            RebuildError::Internal(format!("destination target {} has no rank", entry.target))
        })?;

        if rank == self.node.rank {
            self.tracker.insert(&[entry], self.tracker.layout_version);
            return Ok(());
        }

        let batch = self.batches.entry(rank).or_default();
        batch.push(entry);
        if batch.len() >= self.node.config.object_list_batch {
            let entries = std::mem::take(batch);
            self.send(rank, entries).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        let batches: Vec<_> = self.batches.drain().collect();
        for (rank, entries) in batches {
            if !entries.is_empty() {
                self.send(rank, entries).await?;
            }
        }
        Ok(())
    }

    async fn send(&self, rank: Rank, entries: Vec<ObjectListEntry>) -> Result<()> {
        let req = ObjectListRequest {
            pool: self.tracker.pool,
            src_rank: self.node.rank,
            version: self.tracker.version,
            generation: self.tracker.generation,
            stable_epoch: self.epoch,
            layout_version: self.tracker.layout_version,
            op: self.tracker.op,
            entries,
        };

        let retries = self.node.config.object_list_retries;
        let mut attempt = 0;
        loop {
            match self.node.transport.object_list(rank, req.clone()).await {
                Ok(()) => {
                    debug!(rank, entries = req.entries.len(), "Object list sent");
                    return Ok(());
                }
                // Receiver has not seen the scan request yet
                Err(e) if e.code() == ErrorCode::TryAgain && attempt < retries => {
                    attempt += 1;
                    debug!(rank, attempt, "Object list deferred by receiver");
                    tokio::time::sleep(self.node.config.puller_idle()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct RebuildVisitor {
    dispatcher: Dispatcher,
}

#[async_trait]
impl ObjectVisitor for RebuildVisitor {
    async fn visit(&mut self, entry: &ObjectEntry) -> Result<()> {
        let tracker = &self.dispatcher.tracker;
        let placement = self.dispatcher.node.placement.find_rebuild(
            tracker.pool,
            entry.obj.oid,
            tracker.version,
            tracker.op,
            &tracker.targets,
        )?;

        // Only the elected source announces, so each destination hears once
        if placement.destinations.is_empty() || placement.sender() != Some(entry.obj.target) {
            return Ok(());
        }

        let epoch = entry.max_epoch.min(self.dispatcher.epoch);
        for dest in placement.destinations {
            self.dispatcher
                .dispatch(ObjectListEntry {
                    cont: entry.obj.cont,
                    oid: entry.obj.oid,
                    epoch,
                    punched: entry.punched,
                    shard: dest.shard,
                    target: dest.target,
                    source: entry.obj.target,
                })
                .await?;
        }
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.dispatcher.flush().await
    }
}

struct ReclaimVisitor {
    node: Arc<RebuildNode>,
    tracker: Arc<TargetTracker>,
}

#[async_trait]
impl ObjectVisitor for ReclaimVisitor {
    async fn visit(&mut self, entry: &ObjectEntry) -> Result<()> {
        let tracker = &self.tracker;
        let required = self.node.placement.is_required(
            tracker.pool,
            entry.obj.oid,
            entry.shard,
            entry.obj.target,
            tracker.version,
        )?;
        if required {
            return Ok(());
        }

        let (range, min_tag) = match tracker.op {
            RebuildOp::FailReclaim => (EpochRange::up_to(EPOCH_MAX), tracker.min_version),
            _ => {
                let hi = if tracker.reclaim_epoch == EPOCH_UNSET {
                    EPOCH_MAX
                } else {
                    tracker.reclaim_epoch
                };
                (EpochRange::up_to(hi), 0)
            }
        };

        let retries = self.node.config.discard_retries;
        let mut attempt = 0;
        let removed = loop {
            match self.node.store.discard(&entry.obj, range, min_tag) {
                Ok(removed) => break removed,
                Err(TesselError::Busy(_)) if attempt < retries => {
                    attempt += 1;
                    tokio::time::sleep(self.node.config.discard_retry_delay()).await;
                }
                Err(e) => return Err(e.into()),
            }
        };

        if removed > 0 {
            debug!(oid = %entry.obj.oid, target = entry.obj.target, removed, "Reclaimed object shard");
            self.tracker.add_counters(&Counters {
                objects: 1,
                records: removed,
                ..Default::default()
            });
        }
        Ok(())
    }
}

struct UpgradeVisitor {
    dispatcher: Dispatcher,
}

#[async_trait]
impl ObjectVisitor for UpgradeVisitor {
    async fn visit(&mut self, entry: &ObjectEntry) -> Result<()> {
        let tracker = self.dispatcher.tracker.clone();
        let node = self.dispatcher.node.clone();
        let target_layout = tracker.layout_version;

        if entry.layout_version == target_layout {
            return Ok(());
        }
        if entry.layout_version > target_layout {
            return Err(RebuildError::Layout(format!(
                "object {} has layout {} above pool layout {}",
                entry.obj.oid, entry.layout_version, target_layout
            )));
        }

        let plan = node.placement.find_upgrade(
            tracker.pool,
            entry.obj.oid,
            tracker.version,
            entry.layout_version,
            target_layout,
        )?;

        // Shard 0 announces new shards on behalf of the group
        if entry.shard == 0 {
            for dest in &plan.destinations {
                self.dispatcher
                    .dispatch(ObjectListEntry {
                        cont: entry.obj.cont,
                        oid: entry.obj.oid,
                        epoch: entry.max_epoch.min(self.dispatcher.epoch),
                        punched: entry.punched,
                        shard: dest.shard,
                        target: dest.target,
                        source: entry.obj.target,
                    })
                    .await?;
            }
        }

        node.store.set_layout_version(&entry.obj, plan.layout_version)?;
        tracker.add_counters(&Counters {
            objects: 1,
            ..Default::default()
        });
        Ok(())
    }

    async fn finish(&mut self) -> Result<()> {
        self.dispatcher.flush().await
    }
}
