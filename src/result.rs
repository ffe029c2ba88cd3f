use thiserror::Error;

use self::StmError::*;

/// `StmResult` is the result of a single step of a STM calculation.
///
/// Retry-class errors are consumed by [`run_transaction`](crate::run_transaction)
/// and never reach user code; all other kinds propagate to the caller after the
/// transaction has been rolled back. Normally you should not handle an
/// `StmError` yourself. Pass it on with `?` and let the driver decide.
pub type StmResult<T> = Result<T, StmError>;

/// Errors produced by the STM runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StmError {
    /// A write found the cell's head version beyond this transaction's
    /// snapshot. Handled by re-running the transaction.
    #[error("cell was committed past this transaction's snapshot")]
    WriteCollision,

    /// A re-read of a cell written earlier in this transaction found the head
    /// version beyond the snapshot. Handled by re-running the transaction.
    #[error("written cell was committed past this transaction's snapshot")]
    WritableReadCollision,

    /// A commute enlisted a cell that the outer transaction had already
    /// enlisted. A contract violation; never retried.
    #[error("commute enlistments overlap the transaction's own enlistments")]
    InvalidCommute,

    /// A strict commute touched a cell outside its affecting set.
    #[error("strict commute touched a cell outside its affecting set")]
    ForbiddenEnlist,

    /// A conditional's test read no cells, so it could never be triggered.
    #[error("conditional test did not read any cell")]
    EmptyConditionalReadSet,

    /// A mutating operation was invoked with no active transaction.
    #[error("operation requires an active transaction")]
    OutOfTransaction,

    /// The user aborted the transaction with [`rollback`](crate::rollback).
    #[error("transaction rolled back explicitly (retry: {retry})")]
    ExplicitRollback {
        /// Whether the transaction should be restarted.
        retry: bool,
    },
}

impl StmError {
    /// True for errors the driver handles by re-running the transaction body.
    pub fn is_retry(&self) -> bool {
        matches!(
            self,
            WriteCollision | WritableReadCollision | ExplicitRollback { retry: true }
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(WriteCollision.is_retry());
        assert!(WritableReadCollision.is_retry());
        assert!(ExplicitRollback { retry: true }.is_retry());

        assert!(!ExplicitRollback { retry: false }.is_retry());
        assert!(!InvalidCommute.is_retry());
        assert!(!ForbiddenEnlist.is_retry());
        assert!(!EmptyConditionalReadSet.is_retry());
        assert!(!OutOfTransaction.is_retry());
    }
}
