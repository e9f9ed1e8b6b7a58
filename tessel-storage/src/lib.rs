//! Tessel Storage
//!
//! Provides the storage abstraction consumed by the rebuild engine:
//! - `ObjectStore` trait: epoch-versioned object/dkey/akey store
//! - `MemoryStore` for testing and simulation

pub mod backend;
pub mod memory;

pub use backend::{
    AkeyRecord, DkeyRecord, ObjectEntry, ObjectRef, ObjectStore, StoreStats, ValueVersion,
    WriteMeta,
};
pub use memory::MemoryStore;
