//! Error types for the refstm engine
//!
//! We use `thiserror` for automatic `Display` and `Error` trait
//! implementations. Commit conflicts are deliberately absent from this enum:
//! a conflict is transient control flow inside the coordinator's retry loop,
//! expressed there as a tagged commit outcome, and never surfaces to callers.

use crate::types::RefId;
use thiserror::Error;

/// Result type alias for refstm operations.
pub type Result<T> = std::result::Result<T, StmError>;

/// Terminal failures surfaced to callers.
///
/// Every variant here is permanent for the attempt that produced it; none of
/// them triggers a retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StmError {
    /// A ref write, commute, or transaction-id query was attempted with no
    /// transaction active on the current execution context.
    #[error("operation requires an active transaction")]
    NotInTransaction,

    /// The targeted ref is no longer present in the store, typically because
    /// its last handle was dropped.
    #[error("unknown ref: {0}")]
    UnknownRef(RefId),

    /// A validator predicate rejected a candidate value at commit time.
    #[error("validator rejected the candidate value for {0}")]
    ValidationFailed(RefId),

    /// The configured retry ceiling was reached without a successful commit.
    #[error("transaction gave up after {attempts} conflicted attempt(s)")]
    RetryLimitExceeded {
        /// Number of attempts made before giving up.
        attempts: usize,
    },

    /// A transaction body signalled failure. Propagated out of the retry
    /// loop unchanged, without further attempts.
    #[error("transaction aborted: {reason}")]
    Aborted {
        /// Human-readable reason supplied by the transaction body.
        reason: String,
    },

    /// The operation does not make sense in the current engine state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl StmError {
    /// Convenience constructor for user-signalled aborts.
    pub fn aborted(reason: impl Into<String>) -> Self {
        StmError::Aborted {
            reason: reason.into(),
        }
    }

    /// Convenience constructor for invalid-operation errors.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        StmError::InvalidOperation(message.into())
    }
}
