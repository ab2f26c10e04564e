//! Transaction commit/rollback protocol for the burrow storage engine.
//!
//! A [`Transaction`] counts nested begins, enlists page participants for
//! two-phase prepare/commit, and coordinates the write-ahead log markers
//! around them; on completion all locks held through its
//! [`burrow_lock::TransactionLockOwnerBlock`] are released in one pass.
//! The ambient [`context`] supplies "which transaction is this call chain
//! inside" without parameter threading.

pub mod context;
pub mod error;
pub mod manager;
pub mod participant;
pub mod transaction;
pub mod wal;

pub use context::{TransactionScope, current_transaction_id};
pub use error::{TransactionError, TxnResult};
pub use manager::TransactionManager;
pub use participant::{CompletionSentinel, PageParticipant, SentinelOutcome};
pub use transaction::{
    DEFAULT_TRANSACTION_TIMEOUT, IsolationLevel, ROLLBACK_WAIT, Transaction, TransactionOptions,
    TransactionOutcome, TransactionState,
};
pub use wal::{LogDevice, LogEntry, LogOperation, MemoryLogDevice};
