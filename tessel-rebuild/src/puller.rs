//! Object pullers
//!
//! Each tracker runs a small pool of pullers draining the pending index.
//! A puller fetches an object from its source at the stable epoch and
//! replays it onto the local destination shards: punches first, then
//! value updates, all tagged with the rebuild version.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use tessel_core::{Rank, TargetId};
use tessel_storage::{ObjectRef, WriteMeta};
use tracing::{debug, info, warn};

use crate::cluster::rank_of;
use crate::error::{RebuildError, Result};
use crate::index::{PendingShard, PullBatch};
use crate::messages::{FetchReply, FetchRequest, Iod, TransferUnit, ValuesRequest};
use crate::node::RebuildNode;
use crate::target_tracker::{TargetTracker, TrackerRef};
use crate::types::{Counters, RebuildOp};

/// Puller task body
pub(crate) async fn run(node: Arc<RebuildNode>, tracker: TrackerRef) {
    // Lists can arrive before our own notice fixes the read epoch
    if tracker.wait_ready().await.is_none() {
        return;
    }

    loop {
        if tracker.should_stop() {
            break;
        }
        let Some(batch) = tracker.next_batch(node.config.puller_idle()).await else {
            continue;
        };

        match pull(&node, &tracker, &batch).await {
            Ok(applied) => tracker.complete(&batch, &applied),
            Err(e) if e.code().is_benign() => {
                debug!(oid = %batch.key.1, error = %e, "Source object gone, skipping");
                tracker.complete(&batch, &Counters::default());
            }
            Err(e) if e.code().is_no_space() => {
                tracker.requeue(&batch);
                park(&node, &tracker).await;
            }
            Err(e) => {
                warn!(oid = %batch.key.1, error = %e, "Pull failed");
                tracker.abandon(&batch);
                tracker.set_error(e);
                break;
            }
        }
    }
}

/// Suspend until space is reclaimed or the tracker stops
async fn park(node: &RebuildNode, tracker: &TargetTracker) {
    let space = node.space.notified();
    tokio::pin!(space);
    space.as_mut().enable();

    tracker.park();
    info!(parked = tracker.parked(), "Target full, puller parked");

    loop {
        let changed = tracker.changed().notified();
        tokio::pin!(changed);
        changed.as_mut().enable();
        if tracker.should_stop() {
            break;
        }
        tokio::select! {
            _ = &mut space => break,
            _ = changed => {}
        }
    }

    tracker.unpark();
    debug!("Puller resumed");
}

async fn pull(node: &RebuildNode, tracker: &TargetTracker, batch: &PullBatch) -> Result<Counters> {
    let epoch = tracker
        .stable_epoch()
        .ok_or_else(|| RebuildError::Internal("pull before stable epoch".into()))?;
    let targets = node.cluster.targets(tracker.pool)?;
    let (cont, oid) = batch.key;

    let mut by_source: BTreeMap<TargetId, Vec<&PendingShard>> = BTreeMap::new();
    for shard in &batch.shards {
        by_source.entry(shard.source).or_default().push(shard);
    }

    let mut applied = Counters::default();
    for (source, shards) in by_source {
        let source_rank = rank_of(&targets, source)
            .ok_or_else(|| RebuildError::NotFound(format!("source target {source}")))?;
        let req = FetchRequest {
            pool: tracker.pool,
            source,
            cont,
            oid,
            epoch,
            inline_threshold: node.config.inline_threshold,
        };
        let reply: FetchReply = if source_rank == node.rank {
            node.handle_fetch_object(req)?
        } else {
            node.transport.fetch_object(source_rank, req).await?
        };

        for shard in shards {
            let obj = ObjectRef {
                pool: tracker.pool,
                target: shard.target,
                cont,
                oid,
            };
            let layout_version = if tracker.op == RebuildOp::Upgrade {
                shard.layout_version
            } else {
                reply.layout_version
            };
            let meta = WriteMeta {
                shard: shard.shard,
                layout_version,
                tag: tracker.version,
            };

            if let Some(punched) = reply.object_punch {
                node.store.punch_object(&obj, meta, punched)?;
            }
            for unit in &reply.units {
                let unit_applied =
                    apply_unit(node, tracker, source_rank, source, &obj, meta, unit).await?;
                applied.add(&unit_applied);
            }
            applied.objects += 1;
        }
    }
    Ok(applied)
}

async fn apply_unit(
    node: &RebuildNode,
    tracker: &TargetTracker,
    source_rank: Rank,
    source: TargetId,
    obj: &ObjectRef,
    meta: WriteMeta,
    unit: &TransferUnit,
) -> Result<Counters> {
    if let Some(punched) = unit.dkey_punch {
        node.store.punch_dkey(obj, meta, &unit.dkey, punched)?;
    }
    for (akey, punched) in &unit.akey_punches {
        node.store.punch_akey(obj, meta, &unit.dkey, akey, *punched)?;
    }

    let mut applied = Counters {
        records: 1,
        ..Default::default()
    };
    if unit.is_punch_only() {
        return Ok(applied);
    }

    let values = match &unit.inline {
        Some(values) => values.clone(),
        None => fetch_bulk(node, tracker, source_rank, source, obj, unit).await?,
    };
    if values.len() != unit.iods.len() {
        return Err(RebuildError::Internal(format!(
            "unit carries {} values for {} iods",
            values.len(),
            unit.iods.len()
        )));
    }

    for (iod, value) in unit.iods.iter().zip(values) {
        if value.len() as u64 != iod.size {
            return Err(RebuildError::Internal(format!(
                "value size {} does not match iod size {}",
                value.len(),
                iod.size
            )));
        }
        applied.bytes += iod.size;
        node.store.update(obj, meta, &unit.dkey, &iod.akey, iod.epoch, value)?;
    }
    Ok(applied)
}

/// Pull a large unit's values as one buffer sized from its iods
async fn fetch_bulk(
    node: &RebuildNode,
    tracker: &TargetTracker,
    source_rank: Rank,
    source: TargetId,
    obj: &ObjectRef,
    unit: &TransferUnit,
) -> Result<Vec<Bytes>> {
    let expected = unit.data_size();
    let req = ValuesRequest {
        pool: tracker.pool,
        source,
        cont: obj.cont,
        oid: obj.oid,
        dkey: unit.dkey.clone(),
        iods: unit.iods.iter().map(|i| (i.akey.clone(), i.epoch)).collect(),
        size: expected,
    };
    let buf = if source_rank == node.rank {
        node.handle_fetch_values(req)?
    } else {
        node.transport.fetch_values(source_rank, req).await?
    };
    split_bulk(buf, &unit.iods)
}

/// Slice a bulk buffer into per-iod values without copying
fn split_bulk(mut buf: Bytes, iods: &[Iod]) -> Result<Vec<Bytes>> {
    let expected: u64 = iods.iter().map(|i| i.size).sum();
    if buf.len() as u64 != expected {
        return Err(RebuildError::Internal(format!(
            "bulk fetch returned {} bytes, expected {expected}",
            buf.len()
        )));
    }
    Ok(iods
        .iter()
        .map(|iod| buf.split_to(iod.size as usize))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iod(akey: &'static [u8], size: u64) -> Iod {
        Iod {
            akey: Bytes::from_static(akey),
            epoch: 1,
            size,
        }
    }

    #[test]
    fn test_split_bulk_slices_in_place() {
        let buf = Bytes::from(b"aaabbbbbc".to_vec());
        let base = buf.as_ptr();
        let values = split_bulk(buf, &[iod(b"x", 3), iod(b"y", 5), iod(b"z", 1)]).unwrap();

        assert_eq!(values[0], Bytes::from_static(b"aaa"));
        assert_eq!(values[1], Bytes::from_static(b"bbbbb"));
        assert_eq!(values[2], Bytes::from_static(b"c"));
        // Views into the fetched buffer, not copies
        assert_eq!(values[1].as_ptr(), base.wrapping_add(3));
    }

    #[test]
    fn test_split_bulk_rejects_short_buffer() {
        let err = split_bulk(Bytes::from_static(b"abc"), &[iod(b"x", 4)]).unwrap_err();
        assert!(matches!(err, RebuildError::Internal(_)));
    }
}
