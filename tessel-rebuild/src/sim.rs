//! In-process cluster simulation
//!
//! Wires several `RebuildNode`s over `MemoryStore`s with an in-memory
//! transport, a rendezvous-hash placement and a versioned pool map. Used
//! by the `simulate` command and the integration tests; fault hooks let
//! callers drop notices, fail broadcasts or duplicate object lists.

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tessel_core::{
    ContainerId, Epoch, LayoutVersion, MapVersion, ObjectId, PoolId, Rank, TargetId,
    DEFAULT_LAYOUT_VERSION, EPOCH_MAX,
};
use tessel_storage::{MemoryStore, ObjectRef, ObjectStore, WriteMeta};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::admin::RebuildAdmin;
use crate::cluster::{
    ClusterMap, DtxResync, PlacementOracle, RebuildPlacement, ShardPlacement, UpgradePlan,
};
use crate::config::RebuildConfig;
use crate::error::{RebuildError, Result};
use crate::messages::{
    FetchReply, FetchRequest, LeaderNotice, ObjectListRequest, ScanReply, ScanRequest,
    StatusReport, ValuesRequest,
};
use crate::node::{NodeContext, RebuildNode};
use crate::scheduler::SchedulerEvent;
use crate::transport::Transport;
use crate::types::{Leadership, RankInfo, RebuildOp, RebuildStatus, TargetInfo, TargetState};

struct MapRecord {
    version: MapVersion,
    layout_version: LayoutVersion,
    targets: Vec<TargetInfo>,
}

struct MapState {
    history: Vec<MapRecord>,
    alive: HashMap<Rank, bool>,
    leader: Leadership,
}

/// Versioned pool map with rendezvous-hash placement
pub struct SimPoolMap {
    pool: PoolId,
    replicas: usize,
    state: RwLock<MapState>,
}

impl SimPoolMap {
    /// One target per rank, target id equal to rank, rank 0 leading
    pub fn new(pool: PoolId, ranks: u32, replicas: usize) -> Self {
        let targets = (0..ranks)
            .map(|r| TargetInfo {
                id: r,
                rank: r,
                state: TargetState::UpIn,
            })
            .collect();
        Self {
            pool,
            replicas,
            state: RwLock::new(MapState {
                history: vec![MapRecord {
                    version: 1,
                    layout_version: DEFAULT_LAYOUT_VERSION,
                    targets,
                }],
                alive: (0..ranks).map(|r| (r, true)).collect(),
                leader: Leadership { rank: 0, term: 1 },
            }),
        }
    }

    pub fn pool(&self) -> PoolId {
        self.pool
    }

    fn check_pool(&self, pool: PoolId) -> Result<()> {
        if pool != self.pool {
            return Err(RebuildError::NotFound(format!("pool {pool}")));
        }
        Ok(())
    }

    fn push_record(
        state: &mut MapState,
        f: impl FnOnce(&mut Vec<TargetInfo>, &mut LayoutVersion),
    ) -> MapVersion {
        let (version, mut layout_version, mut targets) = match state.history.last() {
            Some(last) => (last.version + 1, last.layout_version, last.targets.clone()),
            None => (1, DEFAULT_LAYOUT_VERSION, Vec::new()),
        };
        f(&mut targets, &mut layout_version);
        state.history.push(MapRecord {
            version,
            layout_version,
            targets,
        });
        version
    }

    /// Targets as of `version`
    fn targets_at(&self, version: MapVersion) -> Vec<TargetInfo> {
        let state = self.state.read();
        state
            .history
            .iter()
            .rev()
            .find(|r| r.version <= version)
            .or_else(|| state.history.first())
            .map(|r| r.targets.clone())
            .unwrap_or_default()
    }

    /// Add a rank hosting one new target in `New` state
    pub fn add_rank(&self, rank: Rank) -> MapVersion {
        let mut state = self.state.write();
        state.alive.insert(rank, true);
        Self::push_record(&mut state, |targets, _| {
            targets.push(TargetInfo {
                id: rank,
                rank,
                state: TargetState::New,
            })
        })
    }

    pub fn set_rank_alive(&self, rank: Rank, alive: bool) {
        self.state.write().alive.insert(rank, alive);
    }

    pub fn is_alive(&self, rank: Rank) -> bool {
        self.state.read().alive.get(&rank).copied().unwrap_or(false)
    }

    /// Hand leadership to `rank` under a new term
    pub fn set_leader(&self, rank: Rank) -> Leadership {
        let mut state = self.state.write();
        state.leader = Leadership {
            rank,
            term: state.leader.term + 1,
        };
        state.leader
    }

    fn rendezvous(oid: ObjectId, target: TargetId) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&oid.to_bytes());
        hasher.update(&target.to_le_bytes());
        let hash = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(head)
    }

    /// Highest-weight `replicas` of `candidates`
    fn rank_targets(
        &self,
        oid: ObjectId,
        candidates: impl Iterator<Item = TargetId>,
    ) -> Vec<TargetId> {
        let mut weighted: Vec<(u64, TargetId)> = candidates
            .map(|t| (Self::rendezvous(oid, t), t))
            .collect();
        weighted.sort_unstable_by(|a, b| b.cmp(a));
        weighted
            .into_iter()
            .take(self.replicas)
            .map(|(_, t)| t)
            .collect()
    }
}

impl ClusterMap for SimPoolMap {
    fn map_version(&self, pool: PoolId) -> Result<MapVersion> {
        self.check_pool(pool)?;
        Ok(self.state.read().history.last().map_or(1, |r| r.version))
    }

    fn acked_version(&self, pool: PoolId) -> Result<MapVersion> {
        self.map_version(pool)
    }

    fn layout_version(&self, pool: PoolId) -> Result<LayoutVersion> {
        self.check_pool(pool)?;
        Ok(self
            .state
            .read()
            .history
            .last()
            .map_or(DEFAULT_LAYOUT_VERSION, |r| r.layout_version))
    }

    fn set_layout_version(&self, pool: PoolId, version: LayoutVersion) -> Result<MapVersion> {
        self.check_pool(pool)?;
        let current = self.layout_version(pool)?;
        if version < current {
            return Err(RebuildError::Layout(format!(
                "layout {version} below current {current}"
            )));
        }
        let mut state = self.state.write();
        Ok(Self::push_record(&mut state, |_, layout| *layout = version))
    }

    fn targets(&self, pool: PoolId) -> Result<Vec<TargetInfo>> {
        let version = self.map_version(pool)?;
        Ok(self.targets_at(version))
    }

    fn set_targets_state(
        &self,
        pool: PoolId,
        targets: &[TargetId],
        new_state: TargetState,
    ) -> Result<MapVersion> {
        self.check_pool(pool)?;
        let mut state = self.state.write();
        Ok(Self::push_record(&mut state, |infos, _| {
            for info in infos.iter_mut().filter(|t| targets.contains(&t.id)) {
                info.state = new_state;
            }
        }))
    }

    fn ranks(&self) -> Vec<RankInfo> {
        let mut ranks: Vec<RankInfo> = self
            .state
            .read()
            .alive
            .iter()
            .map(|(&rank, &alive)| RankInfo { rank, alive })
            .collect();
        ranks.sort_by_key(|r| r.rank);
        ranks
    }

    fn leader(&self) -> Leadership {
        self.state.read().leader
    }
}

impl PlacementOracle for SimPoolMap {
    fn place(
        &self,
        pool: PoolId,
        oid: ObjectId,
        version: MapVersion,
        _layout: LayoutVersion,
    ) -> Result<Vec<ShardPlacement>> {
        self.check_pool(pool)?;
        let targets = self.targets_at(version);
        let in_targets = targets.iter().filter(|t| t.state.is_in()).map(|t| t.id);
        let placed = self.rank_targets(oid, in_targets);
        Ok(placed
            .into_iter()
            .enumerate()
            .map(|(shard, target)| ShardPlacement {
                target,
                shard: shard as u32,
            })
            .collect())
    }

    fn find_rebuild(
        &self,
        pool: PoolId,
        oid: ObjectId,
        version: MapVersion,
        op: RebuildOp,
        changed: &[TargetId],
    ) -> Result<RebuildPlacement> {
        self.check_pool(pool)?;
        let targets = self.targets_at(version);

        // Placement before the operation: failing targets were still in,
        // joining targets not yet
        let was_in = |t: &TargetInfo| match op {
            RebuildOp::Exclude | RebuildOp::Drain => t.state.is_in() || changed.contains(&t.id),
            RebuildOp::Reintegrate | RebuildOp::Extend => {
                t.state.is_in() && !changed.contains(&t.id)
            }
            _ => t.state.is_in(),
        };
        let old = self.rank_targets(oid, targets.iter().filter(|&t| was_in(t)).map(|t| t.id));
        let new = self.rank_targets(
            oid,
            targets.iter().filter(|t| t.state.is_in()).map(|t| t.id),
        );

        let readable =
            |id: &TargetId| targets.iter().any(|t| t.id == *id && t.state.is_readable());
        let mut sources: Vec<TargetId> = old
            .iter()
            .copied()
            .filter(|t| new.contains(t) && readable(t))
            .collect();
        if sources.is_empty() {
            sources = old.iter().copied().filter(readable).collect();
        }

        let destinations = new
            .iter()
            .enumerate()
            .filter(|(_, t)| !old.contains(t))
            .map(|(shard, &target)| ShardPlacement {
                target,
                shard: shard as u32,
            })
            .collect();

        Ok(RebuildPlacement {
            sources,
            destinations,
        })
    }

    fn find_upgrade(
        &self,
        pool: PoolId,
        _oid: ObjectId,
        _version: MapVersion,
        _from: LayoutVersion,
        to: LayoutVersion,
    ) -> Result<UpgradePlan> {
        self.check_pool(pool)?;
        // Replicated layouts keep their shards in place
        Ok(UpgradePlan {
            layout_version: to,
            destinations: Vec::new(),
        })
    }

    fn is_required(
        &self,
        pool: PoolId,
        oid: ObjectId,
        _shard: u32,
        target: TargetId,
        version: MapVersion,
    ) -> Result<bool> {
        let layout = self.layout_version(pool)?;
        Ok(self
            .place(pool, oid, version, layout)?
            .iter()
            .any(|p| p.target == target))
    }
}

/// DTX resync progress; complete for every version unless held back
#[derive(Default)]
pub struct SimDtx {
    held: RwLock<HashMap<PoolId, MapVersion>>,
}

impl SimDtx {
    /// Report resync complete only up to `version`
    pub fn hold_at(&self, pool: PoolId, version: MapVersion) {
        self.held.write().insert(pool, version);
    }

    pub fn release(&self, pool: PoolId) {
        self.held.write().remove(&pool);
    }
}

impl DtxResync for SimDtx {
    fn resync_version(&self, pool: PoolId) -> MapVersion {
        self.held.read().get(&pool).copied().unwrap_or(MapVersion::MAX)
    }
}

/// In-memory transport with fault injection
pub struct SimTransport {
    map: Arc<SimPoolMap>,
    nodes: RwLock<HashMap<Rank, Weak<RebuildNode>>>,
    failing_broadcasts: AtomicU32,
    drop_notices: AtomicBool,
    duplicate_lists: AtomicBool,
}

impl SimTransport {
    pub fn new(map: Arc<SimPoolMap>) -> Self {
        Self {
            map,
            nodes: RwLock::new(HashMap::new()),
            failing_broadcasts: AtomicU32::new(0),
            drop_notices: AtomicBool::new(false),
            duplicate_lists: AtomicBool::new(false),
        }
    }

    pub fn register(&self, node: &Arc<RebuildNode>) {
        self.nodes.write().insert(node.rank(), Arc::downgrade(node));
    }

    /// Deliver the next `count` scan broadcasts, then fail them
    pub fn fail_next_broadcasts(&self, count: u32) {
        self.failing_broadcasts.store(count, Ordering::SeqCst);
    }

    pub fn drop_notices(&self, drop: bool) {
        self.drop_notices.store(drop, Ordering::SeqCst);
    }

    /// Deliver every object list twice
    pub fn duplicate_object_lists(&self, duplicate: bool) {
        self.duplicate_lists.store(duplicate, Ordering::SeqCst);
    }

    async fn node(&self, rank: Rank) -> Result<Arc<RebuildNode>> {
        tokio::task::yield_now().await;
        if !self.map.is_alive(rank) {
            return Err(RebuildError::Network {
                rank,
                reason: "rank unreachable".into(),
            });
        }
        self.nodes
            .read()
            .get(&rank)
            .and_then(Weak::upgrade)
            .ok_or_else(|| RebuildError::Network {
                rank,
                reason: "no such rank".into(),
            })
    }
}

#[async_trait::async_trait]
impl Transport for SimTransport {
    async fn scan(&self, rank: Rank, req: ScanRequest) -> Result<ScanReply> {
        self.node(rank).await?.handle_scan(req).await
    }

    async fn broadcast_scan(
        &self,
        ranks: &[Rank],
        req: ScanRequest,
    ) -> Result<Vec<(Rank, ScanReply)>> {
        let calls = ranks.iter().map(|&rank| {
            let req = req.clone();
            async move { (rank, self.scan(rank, req).await) }
        });
        let results = join_all(calls).await;

        let failing = self
            .failing_broadcasts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            debug!(version = req.version, "Injected broadcast failure");
            return Err(RebuildError::GroupVersion {
                local: req.version,
                remote: req.version + 1,
            });
        }

        let mut replies = Vec::with_capacity(results.len());
        for (rank, result) in results {
            replies.push((rank, result?));
        }
        Ok(replies)
    }

    async fn object_list(&self, rank: Rank, req: ObjectListRequest) -> Result<()> {
        let node = self.node(rank).await?;
        if self.duplicate_lists.load(Ordering::SeqCst) {
            node.handle_object_list(req.clone()).await?;
        }
        node.handle_object_list(req).await
    }

    async fn fetch_object(&self, rank: Rank, req: FetchRequest) -> Result<FetchReply> {
        self.node(rank).await?.handle_fetch_object(req)
    }

    async fn fetch_values(&self, rank: Rank, req: ValuesRequest) -> Result<Bytes> {
        self.node(rank).await?.handle_fetch_values(req)
    }

    async fn report_status(&self, rank: Rank, report: StatusReport) -> Result<()> {
        self.node(rank).await?.handle_report(report)
    }

    async fn leader_notice(&self, rank: Rank, notice: LeaderNotice) -> Result<()> {
        let node = self.node(rank).await?;
        if self.drop_notices.load(Ordering::SeqCst) {
            return Err(RebuildError::Timeout(format!("notice to rank {rank} dropped")));
        }
        node.handle_notice(notice)
    }
}

/// A running simulated cluster
pub struct SimCluster {
    pub pool: PoolId,
    pub cont: ContainerId,
    pub map: Arc<SimPoolMap>,
    pub transport: Arc<SimTransport>,
    pub dtx: Arc<SimDtx>,
    config: Arc<RebuildConfig>,
    nodes: RwLock<Vec<Arc<RebuildNode>>>,
    stores: RwLock<Vec<Arc<MemoryStore>>>,
    events: Mutex<HashMap<Rank, mpsc::UnboundedReceiver<SchedulerEvent>>>,
    loops: Mutex<Vec<JoinHandle<()>>>,
    clock: AtomicU64,
}

impl SimCluster {
    /// Start `ranks` engines, each with one target and a running scheduler
    pub fn start(ranks: u32, replicas: usize, config: RebuildConfig) -> Self {
        let pool = PoolId::new();
        let map = Arc::new(SimPoolMap::new(pool, ranks, replicas));
        let transport = Arc::new(SimTransport::new(map.clone()));
        let cluster = Self {
            pool,
            cont: ContainerId::new(),
            map,
            transport,
            dtx: Arc::new(SimDtx::default()),
            config: Arc::new(config),
            nodes: RwLock::new(Vec::new()),
            stores: RwLock::new(Vec::new()),
            events: Mutex::new(HashMap::new()),
            loops: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
        };
        for rank in 0..ranks {
            cluster.spawn_node(rank);
        }
        cluster
    }

    fn spawn_node(&self, rank: Rank) {
        let store = Arc::new(MemoryStore::new());
        store.observe_epoch(self.clock.load(Ordering::SeqCst));
        let ctx = NodeContext {
            rank,
            config: self.config.clone(),
            store: store.clone(),
            cluster: self.map.clone(),
            placement: self.map.clone(),
            dtx: self.dtx.clone(),
            transport: self.transport.clone(),
        };
        let (node, events) = RebuildNode::with_events(ctx);
        self.transport.register(&node);
        self.loops.lock().push(node.start());
        self.events.lock().insert(rank, events);
        self.nodes.write().push(node);
        self.stores.write().push(store);
    }

    /// Add an engine hosting one `New` target
    pub fn add_rank(&self) -> (Rank, MapVersion) {
        let rank = self.nodes.read().len() as Rank;
        self.spawn_node(rank);
        let version = self.map.add_rank(rank);
        (rank, version)
    }

    /// Engine of `rank`; panics on a rank the cluster never started
    pub fn node(&self, rank: Rank) -> Arc<RebuildNode> {
        self.nodes.read()[rank as usize].clone()
    }

    pub fn store(&self, rank: Rank) -> Arc<MemoryStore> {
        self.stores.read()[rank as usize].clone()
    }

    pub fn leader(&self) -> Arc<RebuildNode> {
        self.node(self.map.leader().rank)
    }

    /// Admin handle bound to the current leader
    pub fn admin(&self) -> RebuildAdmin {
        RebuildAdmin::new(self.leader().scheduler().clone(), self.map.clone())
    }

    /// Take the scheduler event stream of a rank
    pub fn take_events(&self, rank: Rank) -> Option<mpsc::UnboundedReceiver<SchedulerEvent>> {
        self.events.lock().remove(&rank)
    }

    fn tick(&self) -> Epoch {
        let epoch = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        for store in self.stores.read().iter() {
            store.observe_epoch(epoch);
        }
        epoch
    }

    /// Client write of one value to every placed replica
    pub fn write(&self, name: &str, dkey: &[u8], akey: &[u8], value: Bytes) -> Result<ObjectId> {
        let oid = ObjectId::from_name(name.as_bytes());
        let version = self.map.map_version(self.pool)?;
        let layout = self.map.layout_version(self.pool)?;
        let targets = self.map.targets(self.pool)?;
        let epoch = self.tick();
        let dkey = Bytes::copy_from_slice(dkey);
        let akey = Bytes::copy_from_slice(akey);

        for placement in self.map.place(self.pool, oid, version, layout)? {
            let Some(info) = targets.iter().find(|t| t.id == placement.target) else {
                continue;
            };
            let obj = self.object_ref(placement.target, oid);
            self.store(info.rank).update(
                &obj,
                WriteMeta::client(placement.shard, layout),
                &dkey,
                &akey,
                epoch,
                value.clone(),
            )?;
        }
        Ok(oid)
    }

    /// Client punch of a dkey on every placed replica
    pub fn punch_dkey(&self, oid: ObjectId, dkey: &[u8]) -> Result<()> {
        let version = self.map.map_version(self.pool)?;
        let layout = self.map.layout_version(self.pool)?;
        let targets = self.map.targets(self.pool)?;
        let epoch = self.tick();
        let dkey = Bytes::copy_from_slice(dkey);
        for placement in self.map.place(self.pool, oid, version, layout)? {
            let Some(info) = targets.iter().find(|t| t.id == placement.target) else {
                continue;
            };
            let obj = self.object_ref(placement.target, oid);
            self.store(info.rank).punch_dkey(
                &obj,
                WriteMeta::client(placement.shard, layout),
                &dkey,
                epoch,
            )?;
        }
        Ok(())
    }

    pub fn object_ref(&self, target: TargetId, oid: ObjectId) -> ObjectRef {
        ObjectRef {
            pool: self.pool,
            target,
            cont: self.cont,
            oid,
        }
    }

    /// Targets currently holding a copy of `oid`
    pub fn holders(&self, oid: ObjectId) -> Vec<TargetId> {
        let Ok(targets) = self.map.targets(self.pool) else {
            return Vec::new();
        };
        targets
            .iter()
            .filter(|t| {
                self.store(t.rank)
                    .object(&self.object_ref(t.id, oid))
                    .ok()
                    .flatten()
                    .is_some()
            })
            .map(|t| t.id)
            .collect()
    }

    pub fn replica_count(&self, oid: ObjectId) -> usize {
        self.holders(oid).len()
    }

    /// Latest value of `(dkey, akey)` on one target
    pub fn read(&self, target: TargetId, oid: ObjectId, dkey: &[u8], akey: &[u8]) -> Option<Bytes> {
        self.store(target)
            .read(&self.object_ref(target, oid), dkey, akey, EPOCH_MAX)
            .ok()
            .flatten()
    }

    /// Poll the leader until `done` holds for the pool status
    pub async fn wait_for(
        &self,
        timeout: Duration,
        done: impl Fn(&RebuildStatus) -> bool,
    ) -> Result<RebuildStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.leader().scheduler().query(self.pool);
            if done(&status) {
                return Ok(status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RebuildError::Timeout(format!(
                    "pool {} still {:?}",
                    self.pool, status.state
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until the leader has nothing queued or running
    pub async fn wait_settled(&self, timeout: Duration) -> Result<RebuildStatus> {
        self.wait_for(timeout, |s| s.is_completed()).await
    }

    pub async fn shutdown(&self) {
        let nodes: Vec<_> = self.nodes.read().clone();
        for node in nodes {
            node.scheduler().abort_all().await;
        }
        for handle in self.loops.lock().drain(..) {
            handle.abort();
        }
    }
}
