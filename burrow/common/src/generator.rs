//! Transaction id generation.
//!
//! Ids are normally handed out by the log device so they stay consistent
//! with the on-disk log; embedders without a log draw from the process-wide
//! generator here instead. Ids start at 1 and are never reused within a
//! process lifetime.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::types::TransactionId;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction id space exhausted at {0}")]
pub struct IdSpaceExhausted(pub TransactionId);

/// Monotonic transaction id source.
pub struct TransactionIdGenerator {
    counter: AtomicU32,
}

impl TransactionIdGenerator {
    pub fn new() -> Self {
        Self::with_start(1)
    }

    pub fn with_start(start: TransactionId) -> Self {
        Self {
            counter: AtomicU32::new(start),
        }
    }

    /// Generate the next transaction id.
    pub fn next(&self) -> Result<TransactionId, IdSpaceExhausted> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == TransactionId::MAX {
                return Err(IdSpaceExhausted(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(cur),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Raise the counter past `id` if it is not already beyond it. Used
    /// after log replay so fresh ids never collide with recovered ones.
    pub fn update_if_greater(&self, id: TransactionId) -> Result<(), IdSpaceExhausted> {
        if id == TransactionId::MAX {
            return Err(IdSpaceExhausted(id));
        }
        self.counter.fetch_max(id + 1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for TransactionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_TRANSACTION_ID_GENERATOR: OnceLock<Arc<TransactionIdGenerator>> = OnceLock::new();

/// Get the process-wide transaction id generator.
pub fn global_transaction_id_generator() -> Arc<TransactionIdGenerator> {
    GLOBAL_TRANSACTION_ID_GENERATOR
        .get_or_init(|| Arc::new(TransactionIdGenerator::new()))
        .clone()
}

/// Initialize the process-wide generator with a specific starting value.
/// Only callable before the first use.
pub fn init_global_transaction_id_generator(start: TransactionId) -> Result<(), &'static str> {
    GLOBAL_TRANSACTION_ID_GENERATOR
        .set(Arc::new(TransactionIdGenerator::with_start(start)))
        .map_err(|_| "global transaction id generator already initialized")
}
