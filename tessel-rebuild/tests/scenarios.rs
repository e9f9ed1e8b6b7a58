//! End-to-end rebuild scenarios on a simulated cluster

use bytes::Bytes;
use std::time::Duration;
use tessel_core::{Epoch, MapVersion, ObjectId, TargetId, EPOCH_MAX};
use tessel_rebuild::scheduler::SchedulerEvent;
use tessel_rebuild::sim::SimCluster;
use tessel_rebuild::{
    ClusterMap, ErrorCode, RebuildConfig, RebuildOp, RebuildState, TargetState,
};
use tessel_storage::ObjectStore;
use tokio::sync::mpsc::UnboundedReceiver;

const TIMEOUT: Duration = Duration::from_secs(20);

fn value(i: usize) -> Bytes {
    Bytes::from(format!("value-{i:04}").repeat(8))
}

fn write_objects(cluster: &SimCluster, count: usize) -> Vec<ObjectId> {
    (0..count)
        .map(|i| {
            cluster
                .write(&format!("obj-{i}"), b"dkey", b"akey", value(i))
                .unwrap()
        })
        .collect()
}

fn target_state(cluster: &SimCluster, target: TargetId) -> TargetState {
    cluster
        .map
        .targets(cluster.pool)
        .unwrap()
        .into_iter()
        .find(|t| t.id == target)
        .unwrap()
        .state
}

fn drain_events(rx: &mut UnboundedReceiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn launched(events: &[SchedulerEvent]) -> Vec<(RebuildOp, u32, u32)> {
    events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::Launched {
                op,
                version,
                generation,
                ..
            } => Some((*op, *version, *generation)),
            _ => None,
        })
        .collect()
}

/// `(version, generation, reclaim_epoch, min_version)` of every launch of `op`
fn launch_bounds(
    events: &[SchedulerEvent],
    op: RebuildOp,
) -> Vec<(MapVersion, u32, Epoch, MapVersion)> {
    events
        .iter()
        .filter_map(|e| match e {
            SchedulerEvent::Launched {
                op: launched,
                version,
                generation,
                reclaim_epoch,
                min_version,
                ..
            } if *launched == op => Some((*version, *generation, *reclaim_epoch, *min_version)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_exclude_without_spare_targets_reclaims_copies() {
    let cluster = SimCluster::start(3, 3, RebuildConfig::fast());
    let mut events = cluster.take_events(0).unwrap();
    let oids = write_objects(&cluster, 12);
    // No client writes follow, so the scan reads at the last written epoch
    let stable = (0..3).map(|r| cluster.store(r).stable_epoch()).min().unwrap();
    assert!(stable > 0);

    let version = cluster.admin().exclude(cluster.pool, &[2]).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();

    assert_eq!(status.state, RebuildState::Completed);
    assert_eq!(status.error, None);
    assert_eq!(target_state(&cluster, 2), TargetState::DownOut);

    let events = drain_events(&mut events);
    let ops: Vec<RebuildOp> = launched(&events)
        .into_iter()
        .map(|(op, _, _)| op)
        .collect();
    assert_eq!(ops, vec![RebuildOp::Exclude, RebuildOp::Reclaim]);

    let reclaims = launch_bounds(&events, RebuildOp::Reclaim);
    assert_eq!(reclaims.len(), 1);
    let (reclaim_version, _, reclaim_epoch, _) = reclaims[0];
    assert!(reclaim_version > version);
    assert_eq!(reclaim_epoch, stable);

    for oid in oids {
        let holders = cluster.holders(oid);
        assert_eq!(holders.len(), 2);
        assert!(!holders.contains(&2));
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_exclude_moves_data_to_new_homes() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 40);
    let moved = oids
        .iter()
        .filter(|&&oid| cluster.holders(oid).contains(&1))
        .count() as u64;
    assert!(moved > 0);

    cluster.admin().exclude(cluster.pool, &[1]).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();

    assert_eq!(status.error, None);
    // Reclaim keeps reporting the migration counters
    assert_eq!(status.counters.to_migrate, moved);
    assert_eq!(status.counters.objects, moved);

    for (i, oid) in oids.iter().enumerate() {
        let holders = cluster.holders(*oid);
        assert_eq!(holders.len(), 2, "object {i} holders {holders:?}");
        assert!(!holders.contains(&1));
        for target in holders {
            assert_eq!(cluster.read(target, *oid, b"dkey", b"akey"), Some(value(i)));
        }
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_punched_dkeys_stay_punched_after_rebuild() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 20);
    for oid in &oids[..10] {
        cluster.punch_dkey(*oid, b"dkey").unwrap();
    }

    cluster.admin().exclude(cluster.pool, &[0]).unwrap();
    cluster.wait_settled(TIMEOUT).await.unwrap();

    for (i, oid) in oids.iter().enumerate() {
        for target in cluster.holders(*oid) {
            let read = cluster.read(target, *oid, b"dkey", b"akey");
            if i < 10 {
                assert_eq!(read, None, "object {i} on target {target}");
            } else {
                assert_eq!(read, Some(value(i)));
            }
        }
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_broadcast_is_resubmitted_at_next_generation() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let mut events = cluster.take_events(0).unwrap();
    let oids = write_objects(&cluster, 20);
    cluster.transport.fail_next_broadcasts(1);

    let version = cluster.admin().exclude(cluster.pool, &[3]).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();
    assert_eq!(status.error, None);

    let events = drain_events(&mut events);
    let excludes: Vec<_> = launched(&events)
        .into_iter()
        .filter(|(op, _, _)| *op == RebuildOp::Exclude)
        .collect();
    assert_eq!(
        excludes,
        vec![
            (RebuildOp::Exclude, version, 1),
            (RebuildOp::Exclude, version, 2)
        ]
    );
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::Finished {
            op: RebuildOp::Exclude,
            generation: 1,
            error: Some(ErrorCode::GroupVersion),
            ..
        }
    )));

    for oid in oids {
        assert_eq!(cluster.replica_count(oid), 2);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_object_lists_are_pulled_once() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 30);
    let moved = oids
        .iter()
        .filter(|&&oid| cluster.holders(oid).contains(&2))
        .count() as u64;
    cluster.transport.duplicate_object_lists(true);

    cluster.admin().exclude(cluster.pool, &[2]).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();

    assert_eq!(status.error, None);
    assert_eq!(status.counters.to_migrate, moved);
    assert_eq!(status.counters.objects, moved);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_pullers_park_on_full_target_and_resume() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 40);
    for rank in [0, 2, 3] {
        let store = cluster.store(rank);
        store.set_capacity(store.stats().bytes_used.max(1));
    }

    cluster.admin().exclude(cluster.pool, &[1]).unwrap();

    let parked = tokio::time::timeout(TIMEOUT, async {
        loop {
            let parked: usize = [0, 2, 3]
                .iter()
                .map(|&r| cluster.node(r).parked_units())
                .sum();
            if parked > 0 {
                return parked;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(parked > 0);
    assert_eq!(
        cluster.leader().scheduler().query(cluster.pool).state,
        RebuildState::InProgress
    );

    for rank in [0, 2, 3] {
        cluster.store(rank).set_capacity(0);
    }
    let status = tokio::time::timeout(TIMEOUT, async {
        loop {
            for rank in 0..4 {
                cluster.node(rank).space_reclaimed();
            }
            let status = cluster.leader().scheduler().query(cluster.pool);
            if status.is_completed() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(status.error, None);
    for oid in oids {
        assert_eq!(cluster.replica_count(oid), 2);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_failed_reintegration_is_compensated() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let mut events = cluster.take_events(0).unwrap();
    let oids = write_objects(&cluster, 40);

    cluster.admin().exclude(cluster.pool, &[3]).unwrap();
    cluster.wait_settled(TIMEOUT).await.unwrap();
    drain_events(&mut events);

    cluster.store(3).inject_update_failures(1);
    let reintegrated = cluster.admin().reintegrate(cluster.pool, &[3]).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();
    assert_eq!(status.state, RebuildState::Completed);

    let events = drain_events(&mut events);
    let ops: Vec<RebuildOp> = launched(&events)
        .into_iter()
        .map(|(op, _, _)| op)
        .collect();
    assert_eq!(ops[0], RebuildOp::Reintegrate);
    assert_eq!(
        ops.iter().filter(|&&op| op == RebuildOp::Reintegrate).count(),
        1
    );
    assert!(ops.contains(&RebuildOp::FailReclaim));
    assert!(ops.contains(&RebuildOp::Exclude));

    // Cleanup runs first and discards only what the reintegration wrote
    let fail_reclaims = launch_bounds(&events, RebuildOp::FailReclaim);
    let (cleanup_version, cleanup_gen, epoch, min_version) = fail_reclaims[0];
    assert_eq!(epoch, EPOCH_MAX);
    assert_eq!(min_version, reintegrated);

    // The compensating Exclude shares the version but not the generation
    let (exclude_version, exclude_gen, _, _) = launch_bounds(&events, RebuildOp::Exclude)[0];
    assert_eq!(exclude_version, cleanup_version);
    assert!(exclude_gen > cleanup_gen);
    assert!(events.iter().any(|e| matches!(
        e,
        SchedulerEvent::Finished {
            op: RebuildOp::Exclude,
            error: None,
            ..
        }
    )));

    assert_eq!(target_state(&cluster, 3), TargetState::DownOut);
    for oid in oids {
        let holders = cluster.holders(oid);
        assert_eq!(holders.len(), 2);
        assert!(!holders.contains(&3));
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_reintegrate_restores_placement() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 40);
    let placed_before: Vec<Vec<TargetId>> = oids.iter().map(|&o| cluster.holders(o)).collect();

    cluster.admin().exclude(cluster.pool, &[1]).unwrap();
    cluster.wait_settled(TIMEOUT).await.unwrap();
    cluster.admin().reintegrate(cluster.pool, &[1]).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();

    assert_eq!(status.error, None);
    assert_eq!(target_state(&cluster, 1), TargetState::UpIn);
    for (oid, before) in oids.iter().zip(placed_before) {
        assert_eq!(cluster.holders(*oid), before);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_drain_empties_target() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 30);

    cluster.admin().drain(cluster.pool, &[2]).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();

    assert_eq!(status.error, None);
    assert_eq!(target_state(&cluster, 2), TargetState::DownOut);
    assert_eq!(cluster.store(2).object_count(cluster.pool), 0);
    for oid in oids {
        assert_eq!(cluster.replica_count(oid), 2);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_extend_fills_new_target() {
    let cluster = SimCluster::start(3, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 60);

    let (rank, _) = cluster.add_rank();
    cluster.admin().extend(cluster.pool, &[rank]).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();

    assert_eq!(status.error, None);
    assert_eq!(target_state(&cluster, rank), TargetState::UpIn);
    assert!(cluster.store(rank).object_count(cluster.pool) > 0);
    for oid in oids {
        assert_eq!(cluster.replica_count(oid), 2);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_upgrade_rewrites_layout() {
    let cluster = SimCluster::start(3, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 10);
    let layout = cluster.map.layout_version(cluster.pool).unwrap() + 1;

    cluster.admin().upgrade(cluster.pool, layout).unwrap();
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();
    assert_eq!(status.op, Some(RebuildOp::Upgrade));
    assert_eq!(status.error, None);

    for oid in oids {
        for target in cluster.holders(oid) {
            let entry = cluster
                .store(target)
                .object(&cluster.object_ref(target, oid))
                .unwrap()
                .unwrap();
            assert_eq!(entry.layout_version, layout);
        }
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_scan_waits_for_dtx_resync() {
    let cluster = SimCluster::start(3, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 10);
    cluster.dtx.hold_at(cluster.pool, 0);

    cluster.admin().exclude(cluster.pool, &[0]).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = cluster.leader().scheduler().query(cluster.pool);
    assert_eq!(status.state, RebuildState::InProgress);
    assert_eq!(status.counters.objects, 0);

    cluster.dtx.release(cluster.pool);
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();
    assert_eq!(status.error, None);
    for oid in oids {
        assert_eq!(cluster.replica_count(oid), 2);
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_stop_pool_cancels_and_blocks_new_work() {
    let cluster = SimCluster::start(3, 2, RebuildConfig::fast());
    write_objects(&cluster, 10);
    cluster.dtx.hold_at(cluster.pool, 0);

    let admin = cluster.admin();
    admin.exclude(cluster.pool, &[1]).unwrap();
    let scheduler = cluster.leader().scheduler().clone();
    tokio::time::timeout(TIMEOUT, async {
        while !scheduler.is_running(cluster.pool) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    tokio::time::timeout(TIMEOUT, admin.stop(cluster.pool))
        .await
        .unwrap();
    assert!(!scheduler.is_running(cluster.pool));

    admin.drain(cluster.pool, &[2]).unwrap();
    assert_eq!(scheduler.pending(), 0);
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_new_leader_redrives_running_operation() {
    let cluster = SimCluster::start(4, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 30);
    cluster.dtx.hold_at(cluster.pool, 0);

    cluster.admin().exclude(cluster.pool, &[2]).unwrap();
    let old_leader = cluster.leader().scheduler().clone();
    tokio::time::timeout(TIMEOUT, async {
        while old_leader.global_tracker(cluster.pool).is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let leadership = cluster.map.set_leader(1);
    assert_eq!(leadership.term, 2);
    tokio::time::timeout(TIMEOUT, old_leader.wait_idle())
        .await
        .unwrap();

    assert_eq!(cluster.admin().regenerate(cluster.pool).unwrap(), 1);
    cluster.dtx.release(cluster.pool);
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();

    assert_eq!(status.error, None);
    assert_eq!(target_state(&cluster, 2), TargetState::DownOut);
    for oid in oids {
        let holders = cluster.holders(oid);
        assert_eq!(holders.len(), 2);
        assert!(!holders.contains(&2));
    }
    cluster.shutdown().await;
}

#[tokio::test]
async fn test_lost_notices_stall_until_delivered() {
    let cluster = SimCluster::start(3, 2, RebuildConfig::fast());
    let oids = write_objects(&cluster, 10);
    cluster.transport.drop_notices(true);

    cluster.admin().exclude(cluster.pool, &[1]).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = cluster.leader().scheduler().query(cluster.pool);
    assert_eq!(status.state, RebuildState::InProgress);
    assert_eq!(status.counters.objects, 0);

    cluster.transport.drop_notices(false);
    let status = cluster.wait_settled(TIMEOUT).await.unwrap();
    assert_eq!(status.error, None);
    for oid in oids {
        assert_eq!(cluster.replica_count(oid), 2);
    }
    cluster.shutdown().await;
}
