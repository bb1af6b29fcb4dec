//! Error types for TPU scheduling operations

use thiserror::Error;

/// Result type alias for TPU operations
pub type Result<T> = std::result::Result<T, TpuError>;

/// Coarse classification of a [`TpuError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input
    InvalidArgument,
    /// Illegal state transition
    FailedPrecondition,
    /// Admission rejected or bounded wait timed out
    DeadlineExceeded,
    /// Invariant violation or counter overflow
    Internal,
    /// Lookup failed
    NotFound,
    /// Request torn down before completion
    Cancelled,
    /// Passed through from a collaborator layer
    Unknown,
}

/// Errors that can occur in the scheduling core
///
/// `Clone` so one merged status can be handed to several callbacks.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TpuError {
    /// Caller supplied a malformed value
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong
        reason: String,
    },

    /// Operation not legal in the current state
    #[error("Failed precondition: {reason}")]
    FailedPrecondition {
        /// Current state description
        reason: String,
    },

    /// Deadline admission rejected or a poll timed out
    #[error("Deadline exceeded: {reason}")]
    DeadlineExceeded {
        /// Reason for rejection
        reason: String,
    },

    /// Invariant violation
    #[error("Internal error: {reason}")]
    Internal {
        /// Reason for failure
        reason: String,
    },

    /// Named entity does not exist
    #[error("Not found: {what}")]
    NotFound {
        /// What was looked up
        what: String,
    },

    /// Request cancelled before the hardware completed it
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Why the request was cancelled
        reason: String,
    },

    /// Error from a collaborator layer (OS, timer, register access)
    #[error("Unknown error: {reason}")]
    Unknown {
        /// Reason for failure
        reason: String,
    },
}

impl TpuError {
    /// Create an invalid argument error
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a failed precondition error
    pub fn failed_precondition(reason: impl Into<String>) -> Self {
        Self::FailedPrecondition {
            reason: reason.into(),
        }
    }

    /// Create a deadline exceeded error
    pub fn deadline_exceeded(reason: impl Into<String>) -> Self {
        Self::DeadlineExceeded {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a cancelled error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// Create an unknown error
    pub fn unknown(reason: impl Into<String>) -> Self {
        Self::Unknown {
            reason: reason.into(),
        }
    }

    /// Classification of this error
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::FailedPrecondition { .. } => ErrorKind::FailedPrecondition,
            Self::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::Unknown { .. } => ErrorKind::Unknown,
        }
    }
}

/// Fold `next` into an accumulated status; the first error wins.
pub(crate) fn merge_status(acc: &mut Result<()>, next: Result<()>) {
    if acc.is_ok() {
        *acc = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            TpuError::deadline_exceeded("x").kind(),
            ErrorKind::DeadlineExceeded
        );
        assert_eq!(TpuError::not_found("layer").kind(), ErrorKind::NotFound);
    }

    #[test]
    fn merge_keeps_first_error() {
        let mut acc = Ok(());
        merge_status(&mut acc, Ok(()));
        merge_status(&mut acc, Err(TpuError::internal("first")));
        merge_status(&mut acc, Err(TpuError::cancelled("second")));
        assert_eq!(acc, Err(TpuError::internal("first")));
    }
}
