//! In-memory object store
//!
//! Used for testing and simulation. Not persistent. Keeps the full epoch
//! history of every key so rebuild reads at a stable epoch behave like the
//! real engine, and exposes a few failure-injection hooks.

use crate::backend::{
    AkeyRecord, DkeyRecord, ObjectEntry, ObjectRef, ObjectStore, StoreStats, ValueVersion,
    WriteMeta,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tessel_core::error::{Result, TesselError};
use tessel_core::{Epoch, EpochRange, LayoutVersion, MapVersion, PoolId};

#[derive(Debug, Default)]
struct AkeyState {
    punches: BTreeMap<Epoch, MapVersion>,
    values: BTreeMap<Epoch, (Bytes, MapVersion)>,
}

#[derive(Debug, Default)]
struct DkeyState {
    punches: BTreeMap<Epoch, MapVersion>,
    akeys: BTreeMap<Bytes, AkeyState>,
}

#[derive(Debug)]
struct ObjectState {
    shard: u32,
    layout_version: LayoutVersion,
    punches: BTreeMap<Epoch, MapVersion>,
    dkeys: BTreeMap<Bytes, DkeyState>,
}

impl ObjectState {
    fn new(meta: WriteMeta) -> Self {
        Self {
            shard: meta.shard,
            layout_version: meta.layout_version,
            punches: BTreeMap::new(),
            dkeys: BTreeMap::new(),
        }
    }

    fn max_epoch(&self) -> Epoch {
        let mut max = self.punches.keys().next_back().copied().unwrap_or(0);
        for dkey in self.dkeys.values() {
            if let Some(e) = dkey.punches.keys().next_back() {
                max = max.max(*e);
            }
            for akey in dkey.akeys.values() {
                if let Some(e) = akey.punches.keys().next_back() {
                    max = max.max(*e);
                }
                if let Some(e) = akey.values.keys().next_back() {
                    max = max.max(*e);
                }
            }
        }
        max
    }

    fn is_empty(&self) -> bool {
        self.punches.is_empty() && self.dkeys.is_empty()
    }
}

/// Latest key in `map` at or below `epoch`
fn latest_at<V>(map: &BTreeMap<Epoch, V>, epoch: Epoch) -> Option<Epoch> {
    map.range(..=epoch).next_back().map(|(e, _)| *e)
}

/// In-memory object store
pub struct MemoryStore {
    objects: RwLock<BTreeMap<ObjectRef, ObjectState>>,

    /// Maximum capacity (0 = unlimited)
    max_capacity: AtomicU64,

    /// Current bytes used
    bytes_used: AtomicU64,

    /// Highest committed epoch
    hlc: AtomicU64,

    /// Operation counters
    writes: AtomicU64,
    discarded: AtomicU64,

    /// Failure injection
    busy_remaining: AtomicU32,
    update_failures: AtomicU32,
}

impl MemoryStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// Create with a maximum capacity
    pub fn with_capacity(max_bytes: u64) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            max_capacity: AtomicU64::new(max_bytes),
            bytes_used: AtomicU64::new(0),
            hlc: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            busy_remaining: AtomicU32::new(0),
            update_failures: AtomicU32::new(0),
        }
    }

    /// Change the capacity limit (0 = unlimited)
    pub fn set_capacity(&self, max_bytes: u64) {
        self.max_capacity.store(max_bytes, Ordering::SeqCst);
    }

    /// Make the next `count` discards fail with `Busy`
    pub fn inject_busy(&self, count: u32) {
        self.busy_remaining.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` updates fail with an injected error
    pub fn inject_update_failures(&self, count: u32) {
        self.update_failures.store(count, Ordering::SeqCst);
    }

    /// Allocate a new epoch from the local clock
    pub fn next_epoch(&self) -> Epoch {
        self.hlc.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advance the local clock past an epoch observed elsewhere
    pub fn observe_epoch(&self, epoch: Epoch) {
        self.bump_clock(epoch);
    }

    /// Number of object shards held for a pool
    pub fn object_count(&self, pool: PoolId) -> usize {
        self.objects.read().keys().filter(|o| o.pool == pool).count()
    }

    fn take_injected(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn bump_clock(&self, epoch: Epoch) {
        self.hlc.fetch_max(epoch, Ordering::SeqCst);
    }

    fn with_object_mut<T>(
        &self,
        obj: &ObjectRef,
        meta: WriteMeta,
        f: impl FnOnce(&mut ObjectState) -> T,
    ) -> T {
        let mut objects = self.objects.write();
        let state = objects
            .entry(*obj)
            .or_insert_with(|| ObjectState::new(meta));
        f(state)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectStore for MemoryStore {
    fn list_objects(&self, pool: PoolId) -> Result<Vec<ObjectEntry>> {
        let objects = self.objects.read();
        Ok(objects
            .iter()
            .filter(|(o, _)| o.pool == pool)
            .map(|(o, state)| ObjectEntry {
                obj: *o,
                shard: state.shard,
                layout_version: state.layout_version,
                max_epoch: state.max_epoch(),
                punched: state.punches.keys().next_back().copied(),
            })
            .collect())
    }

    fn object(&self, obj: &ObjectRef) -> Result<Option<ObjectEntry>> {
        let objects = self.objects.read();
        Ok(objects.get(obj).map(|state| ObjectEntry {
            obj: *obj,
            shard: state.shard,
            layout_version: state.layout_version,
            max_epoch: state.max_epoch(),
            punched: state.punches.keys().next_back().copied(),
        }))
    }

    fn fetch_object(&self, obj: &ObjectRef, epoch: Epoch) -> Result<Vec<DkeyRecord>> {
        let objects = self.objects.read();
        let state = objects
            .get(obj)
            .ok_or_else(|| TesselError::ObjectNotFound(obj.oid.to_string()))?;

        let obj_punch = latest_at(&state.punches, epoch);
        let mut records = Vec::new();

        for (dkey, dstate) in &state.dkeys {
            let dkey_punch = latest_at(&dstate.punches, epoch);
            let mut akeys = Vec::new();

            for (akey, astate) in &dstate.akeys {
                let akey_punch = latest_at(&astate.punches, epoch);
                let cover = obj_punch.max(dkey_punch).max(akey_punch);
                let values: Vec<ValueVersion> = astate
                    .values
                    .range(..=epoch)
                    .filter(|(e, _)| cover.map_or(true, |c| **e > c))
                    .map(|(e, (data, _))| ValueVersion {
                        epoch: *e,
                        data: data.clone(),
                    })
                    .collect();

                if akey_punch.is_some() || !values.is_empty() {
                    akeys.push(AkeyRecord {
                        akey: akey.clone(),
                        punched: akey_punch,
                        values,
                    });
                }
            }

            if dkey_punch.is_some() || !akeys.is_empty() {
                records.push(DkeyRecord {
                    dkey: dkey.clone(),
                    punched: dkey_punch,
                    akeys,
                });
            }
        }

        Ok(records)
    }

    fn fetch_values(
        &self,
        obj: &ObjectRef,
        dkey: &Bytes,
        iods: &[(Bytes, Epoch)],
    ) -> Result<Vec<Bytes>> {
        let objects = self.objects.read();
        let state = objects
            .get(obj)
            .ok_or_else(|| TesselError::ObjectNotFound(obj.oid.to_string()))?;
        let dstate = state
            .dkeys
            .get(dkey)
            .ok_or_else(|| TesselError::ObjectNotFound(format!("{} dkey", obj.oid)))?;

        iods.iter()
            .map(|(akey, epoch)| {
                dstate
                    .akeys
                    .get(akey)
                    .and_then(|a| a.values.get(epoch))
                    .map(|(data, _)| data.clone())
                    .ok_or_else(|| {
                        TesselError::ObjectNotFound(format!("{} value @{}", obj.oid, epoch))
                    })
            })
            .collect()
    }

    fn read(
        &self,
        obj: &ObjectRef,
        dkey: &[u8],
        akey: &[u8],
        epoch: Epoch,
    ) -> Result<Option<Bytes>> {
        let objects = self.objects.read();
        let Some(state) = objects.get(obj) else {
            return Ok(None);
        };
        let Some(dstate) = state.dkeys.get(dkey) else {
            return Ok(None);
        };
        let Some(astate) = dstate.akeys.get(akey) else {
            return Ok(None);
        };

        let cover = latest_at(&state.punches, epoch)
            .max(latest_at(&dstate.punches, epoch))
            .max(latest_at(&astate.punches, epoch));

        Ok(astate
            .values
            .range(..=epoch)
            .next_back()
            .filter(|(e, _)| cover.map_or(true, |c| **e > c))
            .map(|(_, (data, _))| data.clone()))
    }

    fn punch_object(&self, obj: &ObjectRef, meta: WriteMeta, epoch: Epoch) -> Result<()> {
        self.with_object_mut(obj, meta, |state| {
            state.punches.insert(epoch, meta.tag);
        });
        self.bump_clock(epoch);
        Ok(())
    }

    fn punch_dkey(
        &self,
        obj: &ObjectRef,
        meta: WriteMeta,
        dkey: &Bytes,
        epoch: Epoch,
    ) -> Result<()> {
        self.with_object_mut(obj, meta, |state| {
            state
                .dkeys
                .entry(dkey.clone())
                .or_default()
                .punches
                .insert(epoch, meta.tag);
        });
        self.bump_clock(epoch);
        Ok(())
    }

    fn punch_akey(
        &self,
        obj: &ObjectRef,
        meta: WriteMeta,
        dkey: &Bytes,
        akey: &Bytes,
        epoch: Epoch,
    ) -> Result<()> {
        self.with_object_mut(obj, meta, |state| {
            state
                .dkeys
                .entry(dkey.clone())
                .or_default()
                .akeys
                .entry(akey.clone())
                .or_default()
                .punches
                .insert(epoch, meta.tag);
        });
        self.bump_clock(epoch);
        Ok(())
    }

    fn update(
        &self,
        obj: &ObjectRef,
        meta: WriteMeta,
        dkey: &Bytes,
        akey: &Bytes,
        epoch: Epoch,
        value: Bytes,
    ) -> Result<()> {
        if Self::take_injected(&self.update_failures) {
            return Err(TesselError::Injected(format!("update of {}", obj.oid)));
        }

        let data_len = value.len() as u64;
        let mut objects = self.objects.write();

        let old_len = objects
            .get(obj)
            .and_then(|s| s.dkeys.get(dkey))
            .and_then(|d| d.akeys.get(akey))
            .and_then(|a| a.values.get(&epoch))
            .map(|(data, _)| data.len() as u64)
            .unwrap_or(0);

        // Check capacity
        let capacity = self.max_capacity.load(Ordering::SeqCst);
        if capacity > 0 {
            let current = self.bytes_used.load(Ordering::SeqCst);
            if current - old_len + data_len > capacity {
                return Err(TesselError::StorageFull {
                    used: current,
                    capacity,
                });
            }
        }

        objects
            .entry(*obj)
            .or_insert_with(|| ObjectState::new(meta))
            .dkeys
            .entry(dkey.clone())
            .or_default()
            .akeys
            .entry(akey.clone())
            .or_default()
            .values
            .insert(epoch, (value, meta.tag));

        self.bytes_used.fetch_sub(old_len, Ordering::SeqCst);
        self.bytes_used.fetch_add(data_len, Ordering::SeqCst);
        self.writes.fetch_add(1, Ordering::Relaxed);
        drop(objects);

        self.bump_clock(epoch);
        Ok(())
    }

    fn discard(&self, obj: &ObjectRef, range: EpochRange, min_tag: MapVersion) -> Result<u64> {
        if Self::take_injected(&self.busy_remaining) {
            return Err(TesselError::Busy(obj.oid.to_string()));
        }

        let mut objects = self.objects.write();
        let Some(state) = objects.get_mut(obj) else {
            return Err(TesselError::ObjectNotFound(obj.oid.to_string()));
        };

        let in_scope = |epoch: &Epoch, tag: &MapVersion| range.contains(*epoch) && *tag >= min_tag;
        let mut removed = 0u64;
        let mut freed = 0u64;

        let before = state.punches.len();
        state.punches.retain(|e, t| !in_scope(e, t));
        removed += (before - state.punches.len()) as u64;

        for dstate in state.dkeys.values_mut() {
            let before = dstate.punches.len();
            dstate.punches.retain(|e, t| !in_scope(e, t));
            removed += (before - dstate.punches.len()) as u64;

            for astate in dstate.akeys.values_mut() {
                let before = astate.punches.len();
                astate.punches.retain(|e, t| !in_scope(e, t));
                removed += (before - astate.punches.len()) as u64;

                astate.values.retain(|e, (data, t)| {
                    if in_scope(e, t) {
                        removed += 1;
                        freed += data.len() as u64;
                        false
                    } else {
                        true
                    }
                });
            }
            dstate
                .akeys
                .retain(|_, a| !a.punches.is_empty() || !a.values.is_empty());
        }
        state
            .dkeys
            .retain(|_, d| !d.punches.is_empty() || !d.akeys.is_empty());

        if state.is_empty() {
            objects.remove(obj);
        }

        self.bytes_used.fetch_sub(freed, Ordering::SeqCst);
        self.discarded.fetch_add(removed, Ordering::Relaxed);
        Ok(removed)
    }

    fn set_layout_version(&self, obj: &ObjectRef, version: LayoutVersion) -> Result<()> {
        let mut objects = self.objects.write();
        let state = objects
            .get_mut(obj)
            .ok_or_else(|| TesselError::ObjectNotFound(obj.oid.to_string()))?;
        state.layout_version = version;
        Ok(())
    }

    fn stable_epoch(&self) -> Epoch {
        self.hlc.load(Ordering::SeqCst)
    }

    fn stats(&self) -> StoreStats {
        let objects = self.objects.read();
        StoreStats {
            object_count: objects.len() as u64,
            bytes_used: self.bytes_used.load(Ordering::SeqCst),
            bytes_capacity: self.max_capacity.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
