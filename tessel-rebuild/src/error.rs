//! Rebuild errors
//!
//! Every failure is classified into one of the classes the control loop
//! cares about: retryable, benign, resource exhaustion, or fatal to the
//! operation. The classification travels across nodes as an `ErrorCode`.

use serde::{Deserialize, Serialize};
use std::fmt;
use tessel_core::{MapVersion, PoolId, Rank, TesselError};
use thiserror::Error;

/// Rebuild engine errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RebuildError {
    #[error("Network error talking to rank {rank}: {reason}")]
    Network { rank: Rank, reason: String },

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Group version mismatch: local {local}, remote {remote}")]
    GroupVersion { local: MapVersion, remote: MapVersion },

    #[error("Stale request: {0}")]
    Stale(String),

    #[error("Rank {0} is no longer the leader")]
    NotLeader(Rank),

    #[error("Not ready, try again: {0}")]
    TryAgain(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("No space left on target")]
    NoSpace,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pool {0} is shutting down")]
    Shutdown(PoolId),

    #[error("Rebuild aborted")]
    Aborted,

    #[error("Layout incompatible: {0}")]
    Layout(String),

    #[error("Storage error: {0}")]
    Storage(TesselError),

    /// Failure reported by another rank through the status protocol
    #[error("Rank {rank} reported {code}")]
    Remote { rank: Rank, code: ErrorCode },

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RebuildError>;

impl From<TesselError> for RebuildError {
    fn from(err: TesselError) -> Self {
        match err {
            TesselError::StorageFull { .. } => RebuildError::NoSpace,
            TesselError::ObjectNotFound(what) | TesselError::ContainerNotFound(what) => {
                RebuildError::NotFound(what)
            }
            TesselError::Busy(what) => RebuildError::Busy(what),
            other => RebuildError::Storage(other),
        }
    }
}

impl RebuildError {
    /// Wire form of this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Network { .. } => ErrorCode::Network,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::GroupVersion { .. } => ErrorCode::GroupVersion,
            Self::Stale(_) => ErrorCode::Stale,
            Self::NotLeader(_) => ErrorCode::NotLeader,
            Self::TryAgain(_) => ErrorCode::TryAgain,
            Self::Busy(_) => ErrorCode::Busy,
            Self::NoSpace => ErrorCode::NoSpace,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Shutdown(_) => ErrorCode::Shutdown,
            Self::Aborted => ErrorCode::Aborted,
            Self::Layout(_) => ErrorCode::Layout,
            Self::Storage(_) => ErrorCode::Storage,
            Self::Remote { code, .. } => *code,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}

/// Serialisable error classification carried in status messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Network,
    Timeout,
    GroupVersion,
    Stale,
    NotLeader,
    TryAgain,
    Busy,
    NoSpace,
    NotFound,
    Shutdown,
    Aborted,
    Layout,
    Storage,
    Internal,
}

impl ErrorCode {
    /// Transient: the cluster state corrects itself, resubmit
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::GroupVersion
                | Self::Stale
                | Self::TryAgain
                | Self::Busy
        )
    }

    /// Absorbed silently, never counted as a failure
    pub fn is_benign(self) -> bool {
        matches!(self, Self::NotFound)
    }

    /// Handled by backpressure instead of failure
    pub fn is_no_space(self) -> bool {
        matches!(self, Self::NoSpace)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::GroupVersion => "group-version",
            Self::Stale => "stale",
            Self::NotLeader => "not-leader",
            Self::TryAgain => "try-again",
            Self::Busy => "busy",
            Self::NoSpace => "no-space",
            Self::NotFound => "not-found",
            Self::Shutdown => "shutdown",
            Self::Aborted => "aborted",
            Self::Layout => "layout",
            Self::Storage => "storage",
            Self::Internal => "internal",
        };
        write!(f, "{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_errors_are_classified() {
        let full: RebuildError = TesselError::StorageFull {
            used: 1,
            capacity: 1,
        }
        .into();
        assert_eq!(full, RebuildError::NoSpace);
        assert!(full.code().is_no_space());

        let gone: RebuildError = TesselError::ContainerNotFound("c".into()).into();
        assert!(gone.code().is_benign());

        let busy: RebuildError = TesselError::Busy("o".into()).into();
        assert!(busy.is_retryable());

        let injected: RebuildError = TesselError::Injected("x".into()).into();
        assert_eq!(injected.code(), ErrorCode::Storage);
        assert!(!injected.is_retryable());
    }

    #[test]
    fn test_retryable_taxonomy() {
        assert!(RebuildError::Network {
            rank: 1,
            reason: "reset".into()
        }
        .is_retryable());
        assert!(RebuildError::GroupVersion { local: 3, remote: 4 }.is_retryable());
        assert!(!RebuildError::NotLeader(0).is_retryable());
        assert!(!RebuildError::Layout("v9".into()).is_retryable());
        assert!(!RebuildError::Aborted.is_retryable());
    }

    #[test]
    fn test_remote_error_keeps_code() {
        let err = RebuildError::Remote {
            rank: 2,
            code: ErrorCode::Timeout,
        };
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = RebuildError::GroupVersion { local: 3, remote: 5 };
        assert_eq!(err.to_string(), "Group version mismatch: local 3, remote 5");
        assert_eq!(ErrorCode::NoSpace.to_string(), "no-space");
    }
}
