//! The transaction object and its two-phase completion protocol.
//!
//! A transaction counts nested begins, enlists page participants, and on
//! the outermost commit runs prepare/commit across them, writing begin and
//! end markers through the log device. Participant failures never surface
//! to the caller; they flip the transaction to rollback, and the returned
//! [`TransactionOutcome`] is the only externally visible signal. Lock
//! release always happens in the same final pass, whatever the outcome.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use burrow_common::global_transaction_id_generator;
use burrow_common::types::TransactionId;
use burrow_lock::{GlobalLockManager, TransactionLockOwnerBlock};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{TransactionError, TxnResult};
use crate::participant::{CompletionSentinel, PageParticipant, SentinelOutcome};
use crate::wal::{LogDevice, LogEntry, LogOperation};

/// How long the rollback path waits for each participant before moving on.
pub const ROLLBACK_WAIT: Duration = Duration::from_secs(5);

/// Default budget for lock grants and the prepare/commit phases.
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Isolation level for transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
    Snapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Preparing,
    Committing,
    RollingBack,
    Completed,
}

/// The externally visible result of the completion protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub timeout: Duration,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::default(),
            timeout: DEFAULT_TRANSACTION_TIMEOUT,
        }
    }
}

struct TxnCore {
    state: TransactionState,
    /// Nesting depth; construction counts as the first begin.
    depth: u32,
    /// Set by any rollback; forces the eventual outer commit to roll back.
    poisoned: bool,
    begin_logged: bool,
    participants: Vec<Arc<dyn PageParticipant>>,
    log_entries: Vec<LogEntry>,
}

pub struct Transaction {
    lock_manager: Arc<GlobalLockManager>,
    log_device: Option<Arc<dyn LogDevice>>,
    isolation: IsolationLevel,
    timeout: Duration,
    /// Assigned lazily: by the log device on first enlistment, or by the
    /// global generator when there is no device.
    id: OnceLock<TransactionId>,
    locks: OnceLock<TransactionLockOwnerBlock>,
    core: Mutex<TxnCore>,
}

impl Transaction {
    pub fn new(
        lock_manager: Arc<GlobalLockManager>,
        log_device: Option<Arc<dyn LogDevice>>,
        options: TransactionOptions,
    ) -> Self {
        Self {
            lock_manager,
            log_device,
            isolation: options.isolation,
            timeout: options.timeout,
            id: OnceLock::new(),
            locks: OnceLock::new(),
            core: Mutex::new(TxnCore {
                state: TransactionState::Active,
                depth: 1,
                poisoned: false,
                begin_logged: false,
                participants: Vec::new(),
                log_entries: Vec::new(),
            }),
        }
    }

    /// The transaction id, resolving it on first use.
    pub fn id(&self) -> TxnResult<TransactionId> {
        if let Some(id) = self.id.get() {
            return Ok(*id);
        }
        let candidate = match &self.log_device {
            Some(device) => device.next_transaction_id()?,
            None => global_transaction_id_generator().next()?,
        };
        Ok(*self.id.get_or_init(|| candidate))
    }

    /// The id if one has been assigned yet.
    pub fn assigned_id(&self) -> Option<TransactionId> {
        self.id.get().copied()
    }

    /// The transaction's lock bookkeeping, created on first use.
    pub fn locks(&self) -> TxnResult<&TransactionLockOwnerBlock> {
        if let Some(locks) = self.locks.get() {
            return Ok(locks);
        }
        let id = self.id()?;
        Ok(self.locks.get_or_init(|| {
            TransactionLockOwnerBlock::new(Arc::clone(&self.lock_manager), id)
        }))
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> TransactionState {
        self.core.lock().state
    }

    pub fn depth(&self) -> u32 {
        self.core.lock().depth
    }

    /// Open a nested level; it must be matched by a commit or rollback
    /// before the real completion protocol runs.
    pub fn begin_nested(&self) -> TxnResult<()> {
        let mut core = self.core.lock();
        match core.state {
            TransactionState::Completed => Err(TransactionError::AlreadyCompleted),
            TransactionState::Active => {
                core.depth += 1;
                Ok(())
            }
            _ => Err(TransactionError::Protocol(
                "cannot nest while the completion protocol is running".into(),
            )),
        }
    }

    /// Enlist a participant in the two-phase protocol. Writes the begin
    /// marker on the first enlistment when a log device is attached.
    pub fn enlist(&self, participant: Arc<dyn PageParticipant>) -> TxnResult<()> {
        let id = self.id()?;
        let mut core = self.core.lock();
        match core.state {
            TransactionState::Completed => return Err(TransactionError::AlreadyCompleted),
            TransactionState::Active => {}
            _ => {
                return Err(TransactionError::Protocol(
                    "cannot enlist while the completion protocol is running".into(),
                ));
            }
        }
        if let Some(device) = &self.log_device {
            if !core.begin_logged {
                let entry = LogEntry::new(id, LogOperation::BeginTransaction);
                device.write_entry(entry)?;
                core.log_entries.push(entry);
                core.begin_logged = true;
            }
        }
        core.participants.push(participant);
        Ok(())
    }

    /// Close one nesting level; `None` means outer levels remain. At the
    /// outermost level the two-phase protocol runs, unless nothing was
    /// logged or enlisted, in which case only locks are released.
    pub fn commit(&self) -> TxnResult<Option<TransactionOutcome>> {
        let (participants, entries, begin_logged, poisoned) = {
            let mut core = self.core.lock();
            match core.state {
                TransactionState::Completed => return Err(TransactionError::AlreadyCompleted),
                TransactionState::Active => {}
                _ => {
                    return Err(TransactionError::Protocol(
                        "completion protocol already in progress".into(),
                    ));
                }
            }
            core.depth -= 1;
            if core.depth > 0 {
                debug!("nested commit is a no-op at depth {}", core.depth);
                return Ok(None);
            }
            core.state = TransactionState::Preparing;
            (
                std::mem::take(&mut core.participants),
                core.log_entries.clone(),
                core.begin_logged,
                core.poisoned,
            )
        };

        if poisoned {
            debug!("commit poisoned by an earlier nested rollback; rolling back");
            return self
                .run_rollback(&participants, &entries, begin_logged)
                .map(Some);
        }

        if !begin_logged && participants.is_empty() {
            // Nothing logged, nothing enlisted: only locks to drop.
            self.finish(&participants);
            return Ok(Some(TransactionOutcome::Committed));
        }

        // Phase one: prepare every enlistment, collecting the ready set.
        // Any failure or veto flips the whole transaction to rollback.
        let mut ready: Vec<Arc<dyn PageParticipant>> = Vec::new();
        let mut flip = false;
        for participant in &participants {
            let sentinel = CompletionSentinel::new();
            match participant.prepare(&sentinel) {
                Ok(()) => match sentinel.wait(self.timeout) {
                    Some(SentinelOutcome::Prepared) | Some(SentinelOutcome::Done) => {
                        ready.push(Arc::clone(participant));
                    }
                    Some(SentinelOutcome::ForceRollback) => {
                        debug!("page {} vetoed the commit", participant.page_identity());
                        flip = true;
                    }
                    None => {
                        warn!(
                            "page {} did not resolve prepare within {:?}",
                            participant.page_identity(),
                            self.timeout
                        );
                        flip = true;
                    }
                },
                Err(err) => {
                    warn!("page {} prepare failed: {err}", participant.page_identity());
                    flip = true;
                }
            }
        }
        if flip {
            self.set_state(TransactionState::RollingBack);
            self.rollback_participants(&ready);
            let end = self.write_end_record(begin_logged, TransactionOutcome::RolledBack);
            self.undo_logged_entries(&entries);
            self.finish(&participants);
            end?;
            return Ok(Some(TransactionOutcome::RolledBack));
        }

        // Phase two: commit each prepared page once, deduplicated by the
        // underlying physical page identity.
        self.set_state(TransactionState::Committing);
        let mut seen = HashSet::new();
        let mut told_to_commit: Vec<Arc<dyn PageParticipant>> = Vec::new();
        let mut failed = false;
        for participant in &ready {
            if !seen.insert(participant.page_identity()) {
                continue;
            }
            told_to_commit.push(Arc::clone(participant));
            let sentinel = CompletionSentinel::new();
            match participant.commit(&sentinel) {
                Ok(()) => match sentinel.wait(self.timeout) {
                    Some(SentinelOutcome::Done) | Some(SentinelOutcome::Prepared) => {}
                    Some(SentinelOutcome::ForceRollback) | None => {
                        warn!(
                            "page {} failed to confirm its commit",
                            participant.page_identity()
                        );
                        failed = true;
                        break;
                    }
                },
                Err(err) => {
                    warn!("page {} commit failed: {err}", participant.page_identity());
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            self.set_state(TransactionState::RollingBack);
            self.rollback_participants(&told_to_commit);
            let end = self.write_end_record(begin_logged, TransactionOutcome::RolledBack);
            self.undo_logged_entries(&entries);
            self.finish(&participants);
            end?;
            return Ok(Some(TransactionOutcome::RolledBack));
        }

        let end = self.write_end_record(begin_logged, TransactionOutcome::Committed);
        self.finish(&participants);
        end?;
        Ok(Some(TransactionOutcome::Committed))
    }

    /// Close one nesting level, rolling back. A nested rollback only
    /// records the poison flag; the outermost call runs the real protocol.
    pub fn rollback(&self) -> TxnResult<Option<TransactionOutcome>> {
        let (participants, entries, begin_logged) = {
            let mut core = self.core.lock();
            match core.state {
                TransactionState::Completed => return Err(TransactionError::AlreadyCompleted),
                TransactionState::Active => {}
                _ => {
                    return Err(TransactionError::Protocol(
                        "completion protocol already in progress".into(),
                    ));
                }
            }
            core.poisoned = true;
            core.depth -= 1;
            if core.depth > 0 {
                debug!(
                    "nested rollback recorded at depth {}; outer commit will roll back",
                    core.depth
                );
                return Ok(None);
            }
            core.state = TransactionState::RollingBack;
            (
                std::mem::take(&mut core.participants),
                core.log_entries.clone(),
                core.begin_logged,
            )
        };
        self.run_rollback(&participants, &entries, begin_logged)
            .map(Some)
    }

    fn run_rollback(
        &self,
        participants: &[Arc<dyn PageParticipant>],
        entries: &[LogEntry],
        begin_logged: bool,
    ) -> TxnResult<TransactionOutcome> {
        self.set_state(TransactionState::RollingBack);
        self.rollback_participants(participants);
        let end = self.write_end_record(begin_logged, TransactionOutcome::RolledBack);
        self.undo_logged_entries(entries);
        self.finish(participants);
        end?;
        Ok(TransactionOutcome::RolledBack)
    }

    /// Fan rollback out to `participants` with a bounded wait each; errors
    /// and unresolved sentinels are logged, never propagated.
    fn rollback_participants(&self, participants: &[Arc<dyn PageParticipant>]) {
        for participant in participants {
            let sentinel = CompletionSentinel::new();
            match participant.rollback(&sentinel) {
                Ok(()) => {
                    if sentinel.wait(ROLLBACK_WAIT).is_none() {
                        warn!(
                            "page {} did not resolve rollback within {ROLLBACK_WAIT:?}",
                            participant.page_identity()
                        );
                    }
                }
                Err(err) => {
                    warn!(
                        "page {} rollback failed: {err}",
                        participant.page_identity()
                    );
                }
            }
        }
    }

    /// Append the end-of-transaction marker, but only if a begin marker was
    /// written.
    fn write_end_record(&self, begin_logged: bool, outcome: TransactionOutcome) -> TxnResult<()> {
        if !begin_logged {
            return Ok(());
        }
        let Some(device) = &self.log_device else {
            return Ok(());
        };
        let op = match outcome {
            TransactionOutcome::Committed => LogOperation::CommitTransaction,
            TransactionOutcome::RolledBack => LogOperation::RollbackTransaction,
        };
        device.write_entry(LogEntry::new(self.id()?, op))
    }

    /// Ask the device to physically undo the transaction's buffered
    /// entries.
    fn undo_logged_entries(&self, entries: &[LogEntry]) {
        if entries.is_empty() {
            return;
        }
        if let Some(device) = &self.log_device {
            if let Err(err) = device.rollback_transaction(entries) {
                warn!("log rollback failed: {err}");
            }
        }
    }

    /// Final pass, common to every outcome: notify every enlistment,
    /// release all locks, clear the entry buffer, and mark completed.
    fn finish(&self, participants: &[Arc<dyn PageParticipant>]) {
        for participant in participants {
            participant.complete();
        }
        if let Some(locks) = self.locks.get() {
            locks.release_all();
        }
        let mut core = self.core.lock();
        core.log_entries.clear();
        core.state = TransactionState::Completed;
    }

    fn set_state(&self, state: TransactionState) {
        self.core.lock().state = state;
    }
}

impl Drop for Transaction {
    /// Safety net: a transaction dropped without explicit completion is
    /// rolled back.
    fn drop(&mut self) {
        let incomplete = {
            let mut core = self.core.lock();
            if core.state == TransactionState::Completed {
                false
            } else {
                core.state = TransactionState::Active;
                core.depth = 1;
                true
            }
        };
        if incomplete {
            warn!(
                "transaction {:?} dropped without commit or rollback; rolling back",
                self.id.get()
            );
            if let Err(err) = self.rollback() {
                warn!("implicit rollback failed: {err}");
            }
        }
    }
}
