//! Error types for Tessel
//!
//! Provides the error type shared by the storage engine and its consumers.

use thiserror::Error;

/// Result type alias for Tessel storage operations
pub type Result<T> = std::result::Result<T, TesselError>;

/// Unified storage-level error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TesselError {
    // ===== Capacity Errors =====
    #[error("Storage full: {used} / {capacity} bytes")]
    StorageFull { used: u64, capacity: u64 },

    // ===== Lookup Errors =====
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    // ===== Concurrency Errors =====
    #[error("Object busy: {0}")]
    Busy(String),

    // ===== Argument Errors =====
    #[error("Invalid epoch range: {lo}..={hi}")]
    InvalidEpochRange { lo: u64, hi: u64 },

    // ===== Test Hooks =====
    #[error("Injected failure: {0}")]
    Injected(String),

    // ===== Generic Errors =====
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesselError {
    /// The object or its container no longer exists
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ObjectNotFound(_) | Self::ContainerNotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TesselError::StorageFull {
            used: 90,
            capacity: 100,
        };
        assert_eq!(err.to_string(), "Storage full: 90 / 100 bytes");
    }

    #[test]
    fn test_not_found_classification() {
        assert!(TesselError::ObjectNotFound("x".into()).is_not_found());
        assert!(TesselError::ContainerNotFound("c".into()).is_not_found());
        assert!(!TesselError::Busy("x".into()).is_not_found());
    }
}
