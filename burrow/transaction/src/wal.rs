//! Write-ahead log contract used by the transaction protocol.
//!
//! The protocol only needs three things from a log device: append an
//! entry, physically roll back the entries one transaction wrote, and hand
//! out transaction ids consistent with the log. Binary layout and
//! durability are the device's business. Embedders without a physical log
//! can run against [`MemoryLogDevice`] or no device at all, in which case
//! commit and rollback degrade to lock-release-only.

use burrow_common::TransactionIdGenerator;
use burrow_common::types::TransactionId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::TxnResult;

/// Transaction markers serialized into the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOperation {
    BeginTransaction,
    CommitTransaction,
    RollbackTransaction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub txn_id: TransactionId,
    pub op: LogOperation,
}

impl LogEntry {
    pub fn new(txn_id: TransactionId, op: LogOperation) -> Self {
        Self { txn_id, op }
    }
}

/// The slice of a log device the transaction protocol depends on.
pub trait LogDevice: Send + Sync {
    /// Append one entry to the log.
    fn write_entry(&self, entry: LogEntry) -> TxnResult<()>;

    /// Physically undo the given entries, written by one transaction. The
    /// end-of-transaction marker is not among them; it stays in the log.
    fn rollback_transaction(&self, entries: &[LogEntry]) -> TxnResult<()>;

    /// Next transaction id, consistent with ids already present in the log.
    fn next_transaction_id(&self) -> TxnResult<TransactionId>;
}

/// In-memory log device for tests and embedders without a physical log.
#[derive(Default)]
pub struct MemoryLogDevice {
    entries: Mutex<Vec<LogEntry>>,
    rolled_back: Mutex<Vec<LogEntry>>,
    ids: TransactionIdGenerator,
}

impl MemoryLogDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the log in append order.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    /// Entries undone via [`LogDevice::rollback_transaction`].
    pub fn rolled_back(&self) -> Vec<LogEntry> {
        self.rolled_back.lock().clone()
    }

    /// The last entry appended for `txn_id`, if any.
    pub fn last_entry_for(&self, txn_id: TransactionId) -> Option<LogEntry> {
        self.entries
            .lock()
            .iter()
            .rev()
            .find(|entry| entry.txn_id == txn_id)
            .copied()
    }
}

impl LogDevice for MemoryLogDevice {
    fn write_entry(&self, entry: LogEntry) -> TxnResult<()> {
        self.entries.lock().push(entry);
        Ok(())
    }

    fn rollback_transaction(&self, entries: &[LogEntry]) -> TxnResult<()> {
        let mut log = self.entries.lock();
        let mut undone = self.rolled_back.lock();
        for target in entries {
            if let Some(pos) = log.iter().rposition(|entry| entry == target) {
                undone.push(log.remove(pos));
            }
        }
        Ok(())
    }

    fn next_transaction_id(&self) -> TxnResult<TransactionId> {
        Ok(self.ids.next()?)
    }
}
