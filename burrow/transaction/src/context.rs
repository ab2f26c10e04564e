//! Ambient transaction context.
//!
//! Lock acquisitions need to know which transaction the calling code is
//! working on behalf of without threading the id through every signature.
//! The context is a thread-local stack of transaction ids: entering a
//! [`TransactionScope`] pushes, dropping it pops, so nested scopes restore
//! the outer transaction on every exit path.

use std::cell::RefCell;

use burrow_common::types::TransactionId;

thread_local! {
    static CURRENT: RefCell<Vec<TransactionId>> = const { RefCell::new(Vec::new()) };
}

/// The transaction id the current call chain is working under, if any.
pub fn current_transaction_id() -> Option<TransactionId> {
    CURRENT.with(|stack| stack.borrow().last().copied())
}

/// Scope guard that makes `txn` the current transaction until dropped.
#[must_use = "dropping the scope immediately restores the previous transaction"]
pub struct TransactionScope {
    txn: TransactionId,
}

impl TransactionScope {
    pub fn enter(txn: TransactionId) -> Self {
        CURRENT.with(|stack| stack.borrow_mut().push(txn));
        Self { txn }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.txn
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        CURRENT.with(|stack| {
            let popped = stack.borrow_mut().pop();
            debug_assert_eq!(popped, Some(self.txn), "scopes must unwind in LIFO order");
        });
    }
}
