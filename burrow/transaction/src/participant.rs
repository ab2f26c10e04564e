//! Two-phase-commit callback interface for enlisted page participants.
//!
//! A participant (typically a modified page) resolves its half of each
//! protocol phase through a [`CompletionSentinel`]: `prepared()` during the
//! prepare phase, `done()` when a commit or rollback callback finishes, and
//! `force_rollback()` to veto the whole transaction. The coordinator waits
//! on the sentinel with a bounded timeout; an unresolved sentinel counts as
//! a veto.

use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_common::types::VirtualPageId;
use parking_lot::{Condvar, Mutex};

use crate::error::TxnResult;

/// How a participant resolved one protocol phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelOutcome {
    /// The phase callback finished its work.
    Done,
    /// The participant is ready to commit.
    Prepared,
    /// The participant vetoes the commit; the transaction must roll back.
    ForceRollback,
}

struct SentinelInner {
    outcome: Mutex<Option<SentinelOutcome>>,
    cond: Condvar,
}

/// One phase's handshake between the coordinator and a participant.
///
/// Cloning shares the handshake, so a participant may hand the sentinel to
/// a background flush and resolve it later. Only the first resolution
/// counts.
#[derive(Clone)]
pub struct CompletionSentinel {
    inner: Arc<SentinelInner>,
}

impl Default for CompletionSentinel {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionSentinel {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SentinelInner {
                outcome: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn done(&self) {
        self.resolve(SentinelOutcome::Done);
    }

    pub fn prepared(&self) {
        self.resolve(SentinelOutcome::Prepared);
    }

    pub fn force_rollback(&self) {
        self.resolve(SentinelOutcome::ForceRollback);
    }

    fn resolve(&self, outcome: SentinelOutcome) {
        let mut slot = self.inner.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.inner.cond.notify_all();
        }
    }

    /// Wait for the participant's resolution, up to `timeout`. `None` means
    /// the sentinel was never resolved.
    pub(crate) fn wait(&self, timeout: Duration) -> Option<SentinelOutcome> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.inner.outcome.lock();
        while slot.is_none() {
            if self.inner.cond.wait_until(&mut slot, deadline).timed_out() {
                break;
            }
        }
        *slot
    }
}

/// An object enlisted in a transaction to receive two-phase callbacks.
pub trait PageParticipant: Send + Sync {
    /// Identity of the underlying physical page. Enlistments that share an
    /// identity are committed only once.
    fn page_identity(&self) -> VirtualPageId;

    /// Phase one: flush or validate pending work and resolve the sentinel
    /// with `prepared()` (ready) or `force_rollback()` (veto).
    fn prepare(&self, sentinel: &CompletionSentinel) -> TxnResult<()>;

    /// Phase two: make the prepared work durable and resolve with `done()`.
    fn commit(&self, sentinel: &CompletionSentinel) -> TxnResult<()>;

    /// Undo pending work and resolve with `done()`.
    fn rollback(&self, sentinel: &CompletionSentinel) -> TxnResult<()>;

    /// Called exactly once per enlistment after the protocol finishes,
    /// whatever the outcome.
    fn complete(&self);
}
