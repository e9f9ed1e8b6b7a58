//! Migration indices
//!
//! `pending` holds objects waiting to be pulled; `migrated` remembers
//! objects already applied so duplicate announcements (at-least-once
//! delivery) are absorbed. An object key lives in at most one of the two.

use std::collections::{BTreeMap, HashMap, VecDeque};
use tessel_core::{ContainerId, Epoch, LayoutVersion, ObjectId, TargetId};

use crate::messages::ObjectListEntry;

/// Index key: one object in one container
pub type ObjectKey = (ContainerId, ObjectId);

/// One destination shard awaiting transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingShard {
    pub target: TargetId,
    pub shard: u32,
    pub source: TargetId,
    pub epoch: Epoch,
    pub punched: Option<Epoch>,
    pub layout_version: LayoutVersion,
}

impl PendingShard {
    pub fn from_entry(entry: &ObjectListEntry, layout_version: LayoutVersion) -> Self {
        Self {
            target: entry.target,
            shard: entry.shard,
            source: entry.source,
            epoch: entry.epoch,
            punched: entry.punched,
            layout_version,
        }
    }

    fn same_slot(&self, other: &PendingShard) -> bool {
        self.target == other.target && self.shard == other.shard
    }
}

#[derive(Debug, Default)]
struct PendingObject {
    shards: Vec<PendingShard>,
    in_flight: bool,
}

#[derive(Debug)]
struct MigratedRecord {
    shards: Vec<(TargetId, u32)>,
    expected: u32,
    received: u32,
}

/// Result of announcing one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Newly queued for transfer
    Queued,
    /// Already queued or already applied
    Duplicate,
}

/// A batch of shards handed to one puller
#[derive(Debug, Clone)]
pub struct PullBatch {
    pub key: ObjectKey,
    pub shards: Vec<PendingShard>,
}

#[derive(Debug)]
pub struct MigrationIndex {
    pending: BTreeMap<ObjectKey, PendingObject>,
    migrated: HashMap<ObjectKey, MigratedRecord>,
    /// Insertion order of `migrated`, oldest first; may hold stale keys
    order: VecDeque<ObjectKey>,
    cap: usize,
    in_flight: usize,
}

impl MigrationIndex {
    pub fn new(cap: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            migrated: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
            in_flight: 0,
        }
    }

    /// Announce one shard; idempotent under duplicate delivery
    pub fn insert(&mut self, key: ObjectKey, shard: PendingShard) -> InsertOutcome {
        if let Some(record) = self.migrated.get_mut(&key) {
            if record.shards.contains(&(shard.target, shard.shard)) {
                record.received += 1;
                if record.received >= record.expected {
                    self.migrated.remove(&key);
                }
                return InsertOutcome::Duplicate;
            }
            // New shard of an applied object: back to pending
            self.migrated.remove(&key);
        }

        let pending = self.pending.entry(key).or_default();
        if pending.shards.iter().any(|s| s.same_slot(&shard)) {
            return InsertOutcome::Duplicate;
        }
        pending.shards.push(shard);
        InsertOutcome::Queued
    }

    /// Hand out the next object not already being pulled
    pub fn take(&mut self) -> Option<PullBatch> {
        let (key, pending) = self
            .pending
            .iter_mut()
            .find(|(_, p)| !p.in_flight && !p.shards.is_empty())?;
        pending.in_flight = true;
        self.in_flight += 1;
        Some(PullBatch {
            key: *key,
            shards: pending.shards.clone(),
        })
    }

    /// Record a successful pull of `batch`
    pub fn complete(&mut self, batch: &PullBatch) {
        let Some(pending) = self.pending.get_mut(&batch.key) else {
            return;
        };
        if pending.in_flight {
            pending.in_flight = false;
            self.in_flight -= 1;
        }
        pending
            .shards
            .retain(|s| !batch.shards.iter().any(|done| done.same_slot(s)));
        if !pending.shards.is_empty() {
            // More shards arrived while pulling
            return;
        }
        self.pending.remove(&batch.key);

        let shards: Vec<_> = batch.shards.iter().map(|s| (s.target, s.shard)).collect();
        self.migrated.insert(
            batch.key,
            MigratedRecord {
                expected: shards.len() as u32,
                shards,
                received: 0,
            },
        );
        self.order.push_back(batch.key);
        self.enforce_cap();
    }

    /// Put `batch` back for a later attempt
    pub fn requeue(&mut self, batch: &PullBatch) {
        if let Some(pending) = self.pending.get_mut(&batch.key) {
            if pending.in_flight {
                pending.in_flight = false;
                self.in_flight -= 1;
            }
        }
    }

    /// Drop `batch` after a permanent failure
    pub fn abandon(&mut self, batch: &PullBatch) {
        if let Some(pending) = self.pending.remove(&batch.key) {
            if pending.in_flight {
                self.in_flight -= 1;
            }
        }
    }

    fn enforce_cap(&mut self) {
        while self.migrated.len() > self.cap {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.migrated.remove(&oldest);
                }
                None => break,
            }
        }
        if self.order.len() > self.cap * 2 {
            let migrated = &self.migrated;
            self.order.retain(|k| migrated.contains_key(k));
        }
    }

    /// Nothing pending and nothing being pulled
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn migrated_len(&self) -> usize {
        self.migrated.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn is_pending(&self, key: &ObjectKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn is_migrated(&self, key: &ObjectKey) -> bool {
        self.migrated.contains_key(key)
    }

    /// No key is both pending and migrated
    pub fn is_disjoint(&self) -> bool {
        self.pending.keys().all(|k| !self.migrated.contains_key(k))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.migrated.clear();
        self.order.clear();
        self.in_flight = 0;
    }
}
