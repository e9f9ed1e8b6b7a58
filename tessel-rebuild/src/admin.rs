//! Administrative entry points
//!
//! Each call updates the cluster map first and then queues the matching
//! rebuild at the resulting map version.

use std::sync::Arc;
use tessel_core::{LayoutVersion, MapVersion, PoolId, TargetId};
use tracing::info;

use crate::cluster::ClusterMap;
use crate::error::Result;
use crate::scheduler::{ScheduleOptions, Scheduler};
use crate::types::{RebuildOp, RebuildStatus, TargetState};

#[derive(Clone)]
pub struct RebuildAdmin {
    scheduler: Arc<Scheduler>,
    cluster: Arc<dyn ClusterMap>,
}

impl RebuildAdmin {
    pub fn new(scheduler: Arc<Scheduler>, cluster: Arc<dyn ClusterMap>) -> Self {
        Self { scheduler, cluster }
    }

    /// Mark targets failed and rebuild their data elsewhere
    pub fn exclude(&self, pool: PoolId, targets: &[TargetId]) -> Result<MapVersion> {
        self.change(pool, targets, TargetState::Down, RebuildOp::Exclude)
    }

    /// Move data off targets that are leaving
    pub fn drain(&self, pool: PoolId, targets: &[TargetId]) -> Result<MapVersion> {
        self.change(pool, targets, TargetState::Drain, RebuildOp::Drain)
    }

    /// Bring repaired targets back into placement
    pub fn reintegrate(&self, pool: PoolId, targets: &[TargetId]) -> Result<MapVersion> {
        self.change(pool, targets, TargetState::Up, RebuildOp::Reintegrate)
    }

    /// Fill newly added targets
    pub fn extend(&self, pool: PoolId, targets: &[TargetId]) -> Result<MapVersion> {
        self.change(pool, targets, TargetState::New, RebuildOp::Extend)
    }

    /// Raise the pool layout and rewrite every object to it
    pub fn upgrade(&self, pool: PoolId, layout_version: LayoutVersion) -> Result<MapVersion> {
        let version = self.cluster.set_layout_version(pool, layout_version)?;
        info!(%pool, layout_version, version, "Pool layout raised");
        self.scheduler.schedule(
            pool,
            RebuildOp::Upgrade,
            version,
            &[],
            ScheduleOptions {
                layout_version: Some(layout_version),
                ..Default::default()
            },
        )?;
        Ok(version)
    }

    fn change(
        &self,
        pool: PoolId,
        targets: &[TargetId],
        state: TargetState,
        op: RebuildOp,
    ) -> Result<MapVersion> {
        let version = self.cluster.set_targets_state(pool, targets, state)?;
        info!(%pool, %op, ?targets, version, "Target state changed");
        self.scheduler
            .schedule(pool, op, version, targets, ScheduleOptions::default())?;
        Ok(version)
    }

    /// Stop everything on this engine
    pub async fn abort(&self) {
        self.scheduler.abort_all().await;
    }

    /// Shut down rebuilds of one pool
    pub async fn stop(&self, pool: PoolId) {
        self.scheduler.stop_pool(pool).await;
    }

    /// Requeue work implied by the current map, after a leader change
    pub fn regenerate(&self, pool: PoolId) -> Result<usize> {
        self.scheduler.regenerate(pool)
    }

    pub fn query(&self, pool: PoolId) -> RebuildStatus {
        self.scheduler.query(pool)
    }
}
