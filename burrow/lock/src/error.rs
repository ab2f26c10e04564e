use std::time::Duration;

use thiserror::Error;

pub type LockResult<T> = Result<T, LockError>;

#[derive(Error, Debug)]
pub enum LockError {
    /// The lock could not be granted before the caller's deadline. The
    /// resource is left exactly as if the request had never been posted.
    #[error("lock not granted within {0:?}")]
    Timeout(Duration),

    /// An illegal state transition was attempted (releasing a lock that is
    /// not held to a stronger mode, upgrading along a forbidden path, and so
    /// on). These are contract violations by the caller and are never
    /// retried internally.
    #[error("lock protocol violation: {0}")]
    Protocol(String),

    /// An internal consistency check failed. Not recoverable.
    #[error("lock state invariant violated: {0}")]
    Invariant(String),
}
