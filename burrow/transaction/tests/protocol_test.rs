use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use burrow_common::types::VirtualPageId;
use burrow_lock::{DataLockMode, GlobalLockManager, LockError};
use burrow_transaction::{
    CompletionSentinel, LogDevice, LogOperation, MemoryLogDevice, PageParticipant, Transaction,
    TransactionError, TransactionManager, TransactionOptions, TransactionOutcome,
    TransactionScope, TxnResult, current_transaction_id,
};

const TICK: Duration = Duration::from_millis(100);
const LONG: Duration = Duration::from_secs(5);

/// Test participant that records every callback it receives.
#[derive(Default)]
struct ProbePage {
    identity: VirtualPageId,
    fail_prepare: bool,
    prepared: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
    completed: AtomicUsize,
}

impl ProbePage {
    fn new(identity: VirtualPageId) -> Arc<Self> {
        Arc::new(Self {
            identity,
            ..Self::default()
        })
    }

    fn failing(identity: VirtualPageId) -> Arc<Self> {
        Arc::new(Self {
            identity,
            fail_prepare: true,
            ..Self::default()
        })
    }
}

impl PageParticipant for ProbePage {
    fn page_identity(&self) -> VirtualPageId {
        self.identity
    }

    fn prepare(&self, sentinel: &CompletionSentinel) -> TxnResult<()> {
        if self.fail_prepare {
            return Err(TransactionError::Protocol("page flush failed".into()));
        }
        self.prepared.fetch_add(1, Ordering::SeqCst);
        sentinel.prepared();
        Ok(())
    }

    fn commit(&self, sentinel: &CompletionSentinel) -> TxnResult<()> {
        self.committed.fetch_add(1, Ordering::SeqCst);
        sentinel.done();
        Ok(())
    }

    fn rollback(&self, sentinel: &CompletionSentinel) -> TxnResult<()> {
        self.rolled_back.fetch_add(1, Ordering::SeqCst);
        sentinel.done();
        Ok(())
    }

    fn complete(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
    }
}

fn manager_with_log() -> (TransactionManager, Arc<MemoryLogDevice>) {
    let device = Arc::new(MemoryLogDevice::new());
    let manager = TransactionManager::new(
        Arc::new(GlobalLockManager::default()),
        Some(Arc::clone(&device) as Arc<dyn LogDevice>),
    );
    (manager, device)
}

#[test]
fn commit_brackets_the_work_with_begin_and_commit_markers() {
    let (manager, device) = manager_with_log();
    let txn = manager.begin(TransactionOptions::default()).unwrap();
    let id = txn.id().unwrap();

    let page = ProbePage::new(10);
    txn.enlist(Arc::clone(&page) as Arc<dyn PageParticipant>)
        .unwrap();
    assert_eq!(
        txn.commit().unwrap(),
        Some(TransactionOutcome::Committed)
    );
    manager.finish(&txn).unwrap();

    let ops: Vec<LogOperation> = device.entries().iter().map(|entry| entry.op).collect();
    assert_eq!(
        ops,
        vec![
            LogOperation::BeginTransaction,
            LogOperation::CommitTransaction
        ]
    );
    assert_eq!(device.last_entry_for(id).unwrap().op, LogOperation::CommitTransaction);
    assert!(device.rolled_back().is_empty());
    assert_eq!(page.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(page.committed.load(Ordering::SeqCst), 1);
    assert_eq!(page.completed.load(Ordering::SeqCst), 1);
}

#[test]
fn prepare_failure_rolls_the_whole_transaction_back() {
    let (manager, device) = manager_with_log();
    let txn = manager.begin(TransactionOptions::default()).unwrap();
    let id = txn.id().unwrap();

    let first = ProbePage::new(1);
    let second = ProbePage::new(2);
    let broken = ProbePage::failing(3);
    for page in [&first, &second] {
        txn.enlist(Arc::clone(page) as Arc<dyn PageParticipant>)
            .unwrap();
    }
    txn.enlist(Arc::clone(&broken) as Arc<dyn PageParticipant>)
        .unwrap();

    // The caller sees a clean completion; the outcome is the only signal.
    assert_eq!(
        txn.commit().unwrap(),
        Some(TransactionOutcome::RolledBack)
    );
    manager.finish(&txn).unwrap();

    // Nothing was committed, the ready pages were rolled back, everyone
    // was notified.
    for page in [&first, &second, &broken] {
        assert_eq!(page.committed.load(Ordering::SeqCst), 0);
        assert_eq!(page.completed.load(Ordering::SeqCst), 1);
    }
    assert_eq!(first.rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(second.rolled_back.load(Ordering::SeqCst), 1);

    // The end-of-transaction marker records a rollback, not a commit.
    assert_eq!(
        device.last_entry_for(id).unwrap().op,
        LogOperation::RollbackTransaction
    );
}

#[test]
fn explicit_rollback_physically_undoes_logged_entries() {
    let (manager, device) = manager_with_log();
    let txn = manager.begin(TransactionOptions::default()).unwrap();
    let id = txn.id().unwrap();

    let page = ProbePage::new(7);
    txn.enlist(Arc::clone(&page) as Arc<dyn PageParticipant>)
        .unwrap();
    assert_eq!(
        txn.rollback().unwrap(),
        Some(TransactionOutcome::RolledBack)
    );
    manager.finish(&txn).unwrap();

    assert_eq!(page.rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(page.completed.load(Ordering::SeqCst), 1);
    // The begin marker was undone by the device; the rollback marker
    // remains as the end record.
    let undone: Vec<LogOperation> = device.rolled_back().iter().map(|entry| entry.op).collect();
    assert_eq!(undone, vec![LogOperation::BeginTransaction]);
    assert_eq!(
        device.last_entry_for(id).unwrap().op,
        LogOperation::RollbackTransaction
    );
}

#[test]
fn nested_rollback_forces_the_outer_commit_to_roll_back() {
    let (manager, device) = manager_with_log();
    let txn = manager.begin(TransactionOptions::default()).unwrap();
    let id = txn.id().unwrap();
    let page = ProbePage::new(4);
    txn.enlist(Arc::clone(&page) as Arc<dyn PageParticipant>)
        .unwrap();

    txn.begin_nested().unwrap();
    assert_eq!(txn.rollback().unwrap(), None);
    assert_eq!(
        txn.commit().unwrap(),
        Some(TransactionOutcome::RolledBack)
    );
    manager.finish(&txn).unwrap();

    assert_eq!(page.committed.load(Ordering::SeqCst), 0);
    assert_eq!(page.rolled_back.load(Ordering::SeqCst), 1);
    assert_eq!(
        device.last_entry_for(id).unwrap().op,
        LogOperation::RollbackTransaction
    );
}

#[test]
fn locks_are_released_whatever_the_outcome() {
    let lock_manager = Arc::new(GlobalLockManager::default());
    let manager = TransactionManager::new(Arc::clone(&lock_manager), None);

    let committer = manager.begin(TransactionOptions::default()).unwrap();
    committer
        .locks()
        .unwrap()
        .lock_page(1, 5, 10, DataLockMode::Exclusive, LONG)
        .unwrap();

    // A second transaction cannot take the page while the first holds it.
    let contender = manager.begin(TransactionOptions::default()).unwrap();
    let denied = contender
        .locks()
        .unwrap()
        .lock_page(1, 5, 10, DataLockMode::Exclusive, TICK);
    assert!(matches!(
        denied,
        Err(LockError::Timeout(_))
    ));

    committer.commit().unwrap();
    manager.finish(&committer).unwrap();

    // Commit released everything; the contender gets the page at once.
    contender
        .locks()
        .unwrap()
        .lock_page(1, 5, 10, DataLockMode::Exclusive, TICK)
        .unwrap();
    contender.rollback().unwrap();
    manager.finish(&contender).unwrap();

    assert_eq!(lock_manager.live_data_locks(), 0);
    assert_eq!(lock_manager.live_object_locks(), 0);
    assert_eq!(lock_manager.live_database_locks(), 0);
}

#[test]
fn ambient_scope_carries_the_transaction_id() {
    let (manager, _device) = manager_with_log();
    let txn = manager.begin(TransactionOptions::default()).unwrap();
    let id = txn.id().unwrap();

    assert_eq!(current_transaction_id(), None);
    {
        let _scope = TransactionScope::enter(id);
        assert_eq!(current_transaction_id(), Some(id));

        // A lock taken on behalf of the ambient transaction.
        let ambient = current_transaction_id().unwrap();
        manager
            .lock_manager()
            .lock_data(ambient, 1, 5, 10, DataLockMode::Shared, LONG)
            .unwrap();
        manager.lock_manager().unlock_data(ambient, 1, 5, 10).unwrap();
    }
    assert_eq!(current_transaction_id(), None);

    txn.commit().unwrap();
    manager.finish(&txn).unwrap();
}

#[test]
fn transactions_without_a_log_device_still_complete() {
    let lock_manager = Arc::new(GlobalLockManager::default());
    let txn = Transaction::new(lock_manager, None, TransactionOptions::default());
    let page = ProbePage::new(3);
    txn.enlist(Arc::clone(&page) as Arc<dyn PageParticipant>)
        .unwrap();

    assert_eq!(
        txn.commit().unwrap(),
        Some(TransactionOutcome::Committed)
    );
    assert_eq!(page.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(page.committed.load(Ordering::SeqCst), 1);
}
