//! Transaction registry.
//!
//! The manager owns the lock manager and log device shared by every
//! transaction it begins, and keeps the active set so diagnostics and
//! shutdown can see in-flight work. Completion itself is driven on the
//! [`Transaction`] object; `finish` only unregisters.

use std::sync::Arc;

use burrow_common::types::TransactionId;
use burrow_lock::GlobalLockManager;
use crossbeam_skiplist::SkipMap;

use crate::error::{TransactionError, TxnResult};
use crate::transaction::{Transaction, TransactionOptions, TransactionState};
use crate::wal::LogDevice;

pub struct TransactionManager {
    lock_manager: Arc<GlobalLockManager>,
    log_device: Option<Arc<dyn LogDevice>>,
    /// Active transactions, keyed by id.
    active: SkipMap<TransactionId, Arc<Transaction>>,
}

impl TransactionManager {
    pub fn new(
        lock_manager: Arc<GlobalLockManager>,
        log_device: Option<Arc<dyn LogDevice>>,
    ) -> Self {
        Self {
            lock_manager,
            log_device,
            active: SkipMap::new(),
        }
    }

    pub fn lock_manager(&self) -> &Arc<GlobalLockManager> {
        &self.lock_manager
    }

    /// Begin a transaction and add it to the active set. Registration
    /// forces id assignment; standalone transactions stay lazy.
    pub fn begin(&self, options: TransactionOptions) -> TxnResult<Arc<Transaction>> {
        let txn = Arc::new(Transaction::new(
            Arc::clone(&self.lock_manager),
            self.log_device.clone(),
            options,
        ));
        let id = txn.id()?;
        self.active.insert(id, Arc::clone(&txn));
        Ok(txn)
    }

    /// Unregister a transaction once it has completed.
    pub fn finish(&self, txn: &Transaction) -> TxnResult<()> {
        let id = txn.id()?;
        if txn.state() != TransactionState::Completed {
            return Err(TransactionError::Protocol(format!(
                "transaction {id} is still in progress"
            )));
        }
        self.active
            .remove(&id)
            .ok_or(TransactionError::NotFound(id))?;
        Ok(())
    }

    pub fn is_active(&self, id: TransactionId) -> bool {
        self.active.contains_key(&id)
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionOutcome;
    use crate::wal::MemoryLogDevice;

    fn manager() -> TransactionManager {
        TransactionManager::new(
            Arc::new(GlobalLockManager::default()),
            Some(Arc::new(MemoryLogDevice::new()) as Arc<dyn LogDevice>),
        )
    }

    #[test]
    fn begin_registers_and_finish_unregisters() {
        let manager = manager();
        let txn = manager.begin(TransactionOptions::default()).unwrap();
        let id = txn.id().unwrap();
        assert!(manager.is_active(id));
        assert_eq!(manager.active_len(), 1);

        assert_eq!(
            txn.commit().unwrap(),
            Some(TransactionOutcome::Committed)
        );
        manager.finish(&txn).unwrap();
        assert!(!manager.is_active(id));
        assert_eq!(manager.active_len(), 0);
    }

    #[test]
    fn finish_rejects_an_in_progress_transaction() {
        let manager = manager();
        let txn = manager.begin(TransactionOptions::default()).unwrap();
        assert!(matches!(
            manager.finish(&txn),
            Err(TransactionError::Protocol(_))
        ));
        txn.rollback().unwrap();
        manager.finish(&txn).unwrap();
    }

    #[test]
    fn finish_errors_on_an_unknown_transaction() {
        let manager = manager();
        let stray = Transaction::new(
            Arc::clone(manager.lock_manager()),
            None,
            TransactionOptions::default(),
        );
        stray.commit().unwrap();
        assert!(matches!(
            manager.finish(&stray),
            Err(TransactionError::NotFound(_))
        ));
    }

    #[test]
    fn concurrent_transactions_get_distinct_ids() {
        let manager = manager();
        let a = manager.begin(TransactionOptions::default()).unwrap();
        let b = manager.begin(TransactionOptions::default()).unwrap();
        assert_ne!(a.id().unwrap(), b.id().unwrap());
        assert_eq!(manager.active_len(), 2);
        a.commit().unwrap();
        b.rollback().unwrap();
        manager.finish(&a).unwrap();
        manager.finish(&b).unwrap();
    }
}
