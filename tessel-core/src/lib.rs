//! Tessel Core Library
//!
//! Shared building blocks for the Tessel object-storage cluster:
//! - Identifier newtypes (pools, containers, objects, ranks, targets)
//! - Epoch and map-version aliases
//! - The unified storage-level error type

pub mod error;
pub mod ids;

pub use error::{Result, TesselError};
pub use ids::{
    ContainerId, Epoch, EpochRange, LayoutVersion, MapVersion, ObjectId, PoolId, Rank, TargetId,
};

/// Epoch value meaning "no epoch assigned yet"
pub const EPOCH_UNSET: Epoch = 0;

/// Highest representable epoch, used as an open upper bound
pub const EPOCH_MAX: Epoch = u64::MAX;

/// Layout version written by a freshly formatted pool
pub const DEFAULT_LAYOUT_VERSION: LayoutVersion = 1;
