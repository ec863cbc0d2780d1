use thiserror::Error;

use crate::types::{OpId, TxnId};

/// Convenience alias for `Result<T, TabletError>`.
pub type TabletResult<T> = Result<T, TabletError>;

/// Top-level error type for the tablet engine.
///
/// Classification:
/// - `Corruption`      — structural/sequencing invariant violated in logs or
///                       records; fatal to the current bootstrap or batch.
/// - `IllegalState`    — operation attempted outside the required lifecycle
///                       state; rejected immediately, retryable later.
/// - `NotFound`        — mutate target absent; a normal negative result.
/// - `AlreadyPresent`  — duplicate key on insert; a normal negative result.
/// - `InvalidArgument` — malformed request.
/// - `Aborted`         — batch-level conflict (locks, txn conflicts); the
///                       caller SHOULD retry.
/// - `Fatal`           — durable-write failure that would break the
///                       replication contract if swallowed.
#[derive(Error, Debug)]
pub enum TabletError {
    #[error("Corruption: {0}")]
    Corruption(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already present: {0}")]
    AlreadyPresent(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Aborted: {0}")]
    Aborted(String),

    #[error("Transaction {txn_id} conflict: {reason}")]
    TxnConflict { txn_id: TxnId, reason: String },

    #[error("Operation timed out: {0}")]
    TimedOut(String),

    /// Replicate entry violated log sequencing during replay.
    #[error("Log sequencing violation at {op_id}: {reason}")]
    Sequencing { op_id: OpId, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A durable write to storage failed. Never silently swallowed: the
    /// replication layer has already acknowledged this entry.
    #[error("Fatal storage failure: {0}")]
    Fatal(String),
}

impl TabletError {
    /// True for per-operation failures that are recorded on the operation
    /// and returned within the batch response without aborting siblings.
    pub fn is_per_op(&self) -> bool {
        matches!(
            self,
            TabletError::NotFound(_) | TabletError::AlreadyPresent(_)
        )
    }

    /// True when the whole process must come down rather than continue
    /// with a broken durability contract.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TabletError::Fatal(_))
    }

    /// True when the caller should retry the batch.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TabletError::Aborted(_) | TabletError::TxnConflict { .. } | TabletError::TimedOut(_)
        )
    }

    pub fn corruption(msg: impl Into<String>) -> Self {
        TabletError::Corruption(msg.into())
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        TabletError::IllegalState(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(TabletError::NotFound("k".into()).is_per_op());
        assert!(TabletError::AlreadyPresent("k".into()).is_per_op());
        assert!(!TabletError::Corruption("bad".into()).is_per_op());

        assert!(TabletError::Aborted("lock".into()).is_retryable());
        assert!(!TabletError::Fatal("disk".into()).is_retryable());
        assert!(TabletError::Fatal("disk".into()).is_fatal());
    }
}
