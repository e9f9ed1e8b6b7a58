//! Follower status reporting
//!
//! Every tracker runs one reporter that periodically pushes its progress
//! to the current leader. Counters travel as deltas since the last
//! acknowledged report, or as absolute values after a leader change.

use std::sync::Arc;
use tracing::{debug, trace};

use crate::messages::StatusReport;
use crate::node::RebuildNode;
use crate::target_tracker::{TargetTracker, TrackerRef};
use crate::types::Counters;

/// Reporter task body
pub(crate) async fn run_reporter(node: Arc<RebuildNode>, tracker: TrackerRef) {
    let mut acked = Counters::default();
    let interval = node.config.report_interval();

    loop {
        if tracker.is_finishing() || tracker.is_global_done() {
            break;
        }

        let (report, snapshot) = build_report(&node, &tracker, &acked);
        let leader = report.leader;
        let re_report = report.re_report;
        match node.transport.report_status(leader, report).await {
            Ok(()) => acked = snapshot,
            Err(e) => {
                debug!(leader, error = %e, "Status report failed");
                if re_report {
                    tracker.request_re_report();
                }
            }
        }

        tokio::time::sleep(interval).await;
    }
    trace!("Reporter exiting");
}

/// Assemble the next report; returns it with the counters it covers
pub(crate) fn build_report(
    node: &RebuildNode,
    tracker: &TargetTracker,
    acked: &Counters,
) -> (StatusReport, Counters) {
    let scan_done = tracker.is_scan_done();
    let pull_done = tracker.local_pull_done();
    let counters = tracker.counters();
    let leadership = tracker.leader();
    let re_report = tracker.take_re_report();
    let error = tracker.error().map(|e| e.code());
    let failed = error.is_some();

    let report = StatusReport {
        pool: tracker.pool,
        rank: node.rank,
        leader: leadership.rank,
        version: tracker.version,
        generation: tracker.generation,
        term: leadership.term,
        seq: tracker.next_seq(),
        re_report,
        counters: if re_report {
            counters
        } else {
            counters.since(acked)
        },
        scan_done: failed || scan_done,
        pull_done: failed || pull_done,
        stable_epoch: tracker.stable_epoch().unwrap_or_default(),
        dtx_resync_version: node.dtx.resync_version(tracker.pool),
        error,
    };
    (report, counters)
}
