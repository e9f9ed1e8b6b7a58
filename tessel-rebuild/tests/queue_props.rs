//! Property tests for task queue ordering and merging

use proptest::prelude::*;
use std::collections::HashSet;
use tessel_core::PoolId;
use tessel_rebuild::task_queue::TaskQueue;
use tessel_rebuild::{RebuildOp, RebuildTask};
use tokio::time::{Duration, Instant};

const OPS: [RebuildOp; 5] = [
    RebuildOp::Exclude,
    RebuildOp::Drain,
    RebuildOp::Reintegrate,
    RebuildOp::Reclaim,
    RebuildOp::FailReclaim,
];

fn pool(i: u8) -> PoolId {
    PoolId::from_uuid(uuid::Uuid::from_u128(i as u128 + 1))
}

fn arb_push() -> impl Strategy<Value = (u8, usize, u32, Vec<u32>)> {
    (
        0u8..3,
        0usize..OPS.len(),
        1u32..20,
        prop::collection::vec(0u32..16, 1..4),
    )
}

fn build(pushes: &[(u8, usize, u32, Vec<u32>)]) -> TaskQueue {
    let mut queue = TaskQueue::new();
    for (p, op, version, targets) in pushes {
        queue.push(RebuildTask::new(pool(*p), OPS[*op], *version, targets));
    }
    queue
}

proptest! {
    #[test]
    fn prop_queue_sorted_with_reclaims_first(pushes in prop::collection::vec(arb_push(), 1..40)) {
        let queue = build(&pushes);
        let tasks: Vec<&RebuildTask> = queue.iter().collect();
        for pair in tasks.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            prop_assert!(a.map_version <= b.map_version);
            if a.map_version == b.map_version && b.op.is_reclaim() {
                prop_assert!(a.op.is_reclaim());
            }
        }
    }

    #[test]
    fn prop_merge_never_loses_targets(pushes in prop::collection::vec(arb_push(), 1..40)) {
        let queue = build(&pushes);
        for (p, op, _, targets) in &pushes {
            let op = OPS[*op];
            for target in targets {
                let covered = queue
                    .iter()
                    .any(|t| t.pool == pool(*p) && t.op == op && t.targets.contains(target));
                prop_assert!(covered, "{op} target {target} of pool {p} lost");
            }
        }
    }

    #[test]
    fn prop_reclaims_never_merge(pushes in prop::collection::vec(arb_push(), 1..40)) {
        let queue = build(&pushes);
        let reclaims = pushes.iter().filter(|(_, op, _, _)| OPS[*op].is_reclaim()).count();
        let queued = queue.iter().filter(|t| t.op.is_reclaim()).count();
        prop_assert_eq!(reclaims, queued);
    }

    #[test]
    fn prop_pop_ready_launches_pool_heads_only(pushes in prop::collection::vec(arb_push(), 1..40)) {
        let mut queue = build(&pushes);
        let heads: Vec<(PoolId, RebuildOp, u32)> = (0..3)
            .filter_map(|p| {
                queue
                    .iter()
                    .find(|t| t.pool == pool(p))
                    .map(|t| (t.pool, t.op, t.map_version))
            })
            .collect();

        let later = Instant::now() + Duration::from_secs(1);
        let launched = queue.pop_ready(later, &HashSet::new(), &HashSet::new(), usize::MAX);

        let pools: HashSet<PoolId> = launched.iter().map(|t| t.pool).collect();
        prop_assert_eq!(pools.len(), launched.len());
        prop_assert_eq!(launched.len(), heads.len());
        for task in &launched {
            prop_assert!(heads.contains(&(task.pool, task.op, task.map_version)));
        }
    }
}
