//! Tessel Rebuild Engine
//!
//! Restores redundancy and rebalances data when pool targets change state.
//!
//! The leader engine runs one control loop per pool:
//! - Wait for the cluster map to settle and pick the targets to act on
//! - Broadcast a scan; every engine walks its local objects
//! - Followers announce objects to their new homes and pull them
//! - Aggregate progress bottom-up, flip target states when done
//! - Retry, compensate or reclaim on failure
//!
//! `sim` wires several engines over in-memory stores for tests and the
//! `simulate` command.

pub mod admin;
pub mod cluster;
pub mod config;
pub mod control;
pub mod error;
pub mod global_tracker;
pub mod index;
pub mod messages;
pub mod node;
mod puller;
pub mod refcount;
mod scanner;
pub mod scheduler;
pub mod sim;
mod status;
pub mod target_tracker;
pub mod task_queue;
pub mod transport;
pub mod types;

// Re-export main types
pub use admin::RebuildAdmin;
pub use cluster::{ClusterMap, DtxResync, PlacementOracle, RebuildPlacement, ShardPlacement};
pub use config::{ConfigError, RebuildConfig, ReclaimBoundary};
pub use error::{ErrorCode, RebuildError, Result};
pub use node::{NodeContext, RebuildNode};
pub use scheduler::{ScheduleOptions, Scheduler, SchedulerEvent};
pub use transport::Transport;
pub use types::{
    Counters, RebuildOp, RebuildState, RebuildStatus, RebuildTask, TargetInfo, TargetState,
};
