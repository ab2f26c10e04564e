use burrow_common::types::TransactionId;
use burrow_lock::LockError;
use thiserror::Error;

pub type TxnResult<T> = Result<T, TransactionError>;

#[derive(Error, Debug)]
pub enum TransactionError {
    /// The transaction (or session) already reached `Completed`; no further
    /// operations are accepted.
    #[error("transaction already completed")]
    AlreadyCompleted,

    /// A contract violation by the caller, e.g. enlisting a participant
    /// while the two-phase protocol is running.
    #[error("transaction protocol violation: {0}")]
    Protocol(String),

    /// The transaction is not registered with the manager.
    #[error("transaction {0} not found")]
    NotFound(TransactionId),

    /// The transaction-id space is exhausted.
    #[error("transaction id space exhausted at {0}")]
    IdExhausted(TransactionId),

    /// A log device operation failed.
    #[error("log device error: {0}")]
    Log(String),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl From<burrow_common::IdSpaceExhausted> for TransactionError {
    fn from(err: burrow_common::IdSpaceExhausted) -> Self {
        Self::IdExhausted(err.0)
    }
}
