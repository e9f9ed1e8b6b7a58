//! Ordered rebuild task queue
//!
//! Tasks are kept sorted by map version. Among equal versions, Reclaim and
//! FailReclaim come first so stale data is discarded before a conflicting
//! operation reuses the same epoch range.

use std::collections::HashSet;
use tessel_core::{MapVersion, PoolId};
use tokio::time::Instant;

use crate::types::RebuildTask;

/// Outcome of pushing a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Absorbed by a queued task now at `version`
    Merged { version: MapVersion },
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: Vec<RebuildTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RebuildTask> {
        self.tasks.iter()
    }

    pub fn contains_pool(&self, pool: PoolId) -> bool {
        self.tasks.iter().any(|t| t.pool == pool)
    }

    /// Merge into a compatible neighbour or insert in order
    pub fn push(&mut self, task: RebuildTask) -> PushOutcome {
        if !task.op.is_reclaim() && !task.targets.is_empty() {
            if let Some(idx) = self.merge_candidate(&task) {
                let mut merged = self.tasks.remove(idx);
                merged.add_targets(&task.targets);
                merged.map_version = merged.map_version.max(task.map_version);
                merged.not_before = merged.not_before.max(task.not_before);
                merged.layout_version = merged.layout_version.max(task.layout_version);
                let version = merged.map_version;
                self.insert(merged);
                return PushOutcome::Merged { version };
            }
        }
        self.insert(task);
        PushOutcome::Queued
    }

    /// Highest-versioned task at or below `task`'s version, else the
    /// lowest above it; only if its operation kind matches.
    fn merge_candidate(&self, task: &RebuildTask) -> Option<usize> {
        let same_pool = || {
            self.tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.pool == task.pool)
        };

        // Queue order puts the last equal-version entry after reclaims
        let below = same_pool()
            .filter(|(_, t)| t.map_version <= task.map_version)
            .max_by_key(|(i, t)| (t.map_version, *i));
        if let Some((idx, t)) = below {
            if t.op == task.op {
                return Some(idx);
            }
        }

        let above = same_pool()
            .filter(|(_, t)| t.map_version > task.map_version)
            .min_by_key(|(i, t)| (t.map_version, *i));
        match above {
            Some((idx, t)) if t.op == task.op => Some(idx),
            _ => None,
        }
    }

    fn insert(&mut self, task: RebuildTask) {
        let reclaim = task.op.is_reclaim();
        let pos = self
            .tasks
            .iter()
            .position(|t| {
                t.map_version > task.map_version
                    || (t.map_version == task.map_version && reclaim && !t.op.is_reclaim())
            })
            .unwrap_or(self.tasks.len());
        self.tasks.insert(pos, task);
    }

    /// Take up to `limit` launchable tasks, at most one per pool.
    ///
    /// A pool is skipped for this round once it has a running loop, a
    /// not-yet-due head task, or is in `blocked`, so its later tasks never
    /// overtake earlier ones.
    pub fn pop_ready(
        &mut self,
        now: Instant,
        running: &HashSet<PoolId>,
        blocked: &HashSet<PoolId>,
        limit: usize,
    ) -> Vec<RebuildTask> {
        let mut seen: HashSet<PoolId> = HashSet::new();
        let mut launch = Vec::new();
        let mut i = 0;
        while i < self.tasks.len() && launch.len() < limit {
            let task = &self.tasks[i];
            let pool = task.pool;
            if !seen.insert(pool)
                || running.contains(&pool)
                || blocked.contains(&pool)
                || !task.is_ready(now)
            {
                i += 1;
                continue;
            }
            launch.push(self.tasks.remove(i));
        }
        launch
    }

    /// Earliest `not_before` among queued tasks
    pub fn next_due(&self) -> Option<Instant> {
        self.tasks.iter().map(|t| t.not_before).min()
    }

    pub fn remove_pool(&mut self, pool: PoolId) -> Vec<RebuildTask> {
        let (removed, kept) = std::mem::take(&mut self.tasks)
            .into_iter()
            .partition(|t| t.pool == pool);
        self.tasks = kept;
        removed
    }

    pub fn drain(&mut self) -> Vec<RebuildTask> {
        std::mem::take(&mut self.tasks)
    }
}
