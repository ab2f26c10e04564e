//! Per-resource lock state machine.
//!
//! One [`ResourceLockState`] tracks the currently granted modes, the FIFO
//! queue of blocked requests, and the single out-of-band pending-exclusive
//! upgrade slot for one lock resource. Mutations (acquire/release) are
//! serialized through the write half of an internal [`RwLock`]; queries run
//! on the read half, concurrently with each other but never with a
//! mutation. Waiters never sleep while holding the state lock: each parked
//! request owns its own wait slot (mutex + condvar) which the reevaluation
//! pass completes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_common::types::TransactionId;
use log::{debug, trace};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{LockError, LockResult};
use crate::mode::LockMode;

/// What happened to a release request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The transaction's active entry was removed.
    Released,
    /// The transaction's active entry was downgraded (or re-asserted) in
    /// place.
    Downgraded,
    /// The transaction held nothing; the release was ignored.
    NotHeld,
}

enum WaitState {
    Waiting,
    Granted,
    Abandoned,
}

/// A parked acquire request. `prior` records the mode the transaction held
/// when the request was posted so a grant that races the deadline can be
/// undone exactly.
struct WaitSlot<M: LockMode> {
    txn: TransactionId,
    mode: M,
    prior: Option<M>,
    sync: Mutex<WaitState>,
    cond: Condvar,
}

impl<M: LockMode> WaitSlot<M> {
    fn new(txn: TransactionId, mode: M, prior: Option<M>) -> Arc<Self> {
        Arc::new(Self {
            txn,
            mode,
            prior,
            sync: Mutex::new(WaitState::Waiting),
            cond: Condvar::new(),
        })
    }

    /// Called with the grant tables locked for writing.
    fn grant(&self) {
        *self.sync.lock() = WaitState::Granted;
        self.cond.notify_one();
    }
}

enum Posted<M: LockMode> {
    /// Granted (or recognized as a no-op) without waiting.
    Immediate,
    /// Parked; the caller must wait on the slot.
    Parked(Arc<WaitSlot<M>>),
}

struct GrantTables<M: LockMode> {
    /// At most one granted mode per transaction.
    granted: HashMap<TransactionId, M>,
    /// Aggregate granted mode: max ordinal across active holders.
    aggregate: M,
    /// Blocked requests, served in arrival order.
    pending: VecDeque<Arc<WaitSlot<M>>>,
    /// The single in-place upgrade to the exclusive-equivalent mode,
    /// checked before the FIFO queue on every state change.
    pending_exclusive: Option<Arc<WaitSlot<M>>>,
}

impl<M: LockMode> GrantTables<M> {
    fn new() -> Self {
        Self {
            granted: HashMap::new(),
            aggregate: M::NONE,
            pending: VecDeque::new(),
            pending_exclusive: None,
        }
    }

    fn is_sole_holder(&self, txn: TransactionId) -> bool {
        self.granted.len() == 1 && self.granted.contains_key(&txn)
    }

    fn recompute(&mut self) {
        self.aggregate = self.granted.values().copied().max().unwrap_or(M::NONE);
    }

    /// Max granted mode across every holder except `txn`. Used when deciding
    /// whether a queued upgrade from an existing holder can be granted.
    fn aggregate_without(&self, txn: TransactionId) -> M {
        self.granted
            .iter()
            .filter(|(holder, _)| **holder != txn)
            .map(|(_, mode)| *mode)
            .max()
            .unwrap_or(M::NONE)
    }

    fn post(&mut self, txn: TransactionId, mode: M) -> LockResult<Posted<M>> {
        let held = self.granted.get(&txn).copied();
        let upgrade_or_new = held.is_none_or(|h| mode > h);

        // 1. Empty resource, or compatible with the aggregate with nothing
        //    queued ahead: grant immediately.
        if self.granted.is_empty()
            || (upgrade_or_new
                && mode.is_compatible_with(self.aggregate)
                && self.pending.is_empty()
                && self.pending_exclusive.is_none())
        {
            self.granted.insert(txn, mode);
            self.recompute();
            trace!("granted {mode:?} to txn {txn} immediately");
            return Ok(Posted::Immediate);
        }

        // 2. Sole-holder upgrade to the exclusive-equivalent mode goes
        //    through the dedicated pending slot.
        if mode == M::EXCLUSIVE && self.is_sole_holder(txn) {
            let current = held.unwrap_or(M::NONE);
            if !current.can_enter_exclusive() {
                return Err(LockError::Protocol(format!(
                    "txn {txn} cannot upgrade {current:?} to {mode:?} in place"
                )));
            }
            if self.pending_exclusive.is_some() {
                return Err(LockError::Invariant(
                    "a pending exclusive upgrade is already registered".into(),
                ));
            }
            let slot = WaitSlot::new(txn, mode, held);
            self.pending_exclusive = Some(Arc::clone(&slot));
            trace!("txn {txn} parked as pending exclusive upgrade");
            return Ok(Posted::Parked(slot));
        }

        // 3. A downgrade (or re-request) of an already-held mode is a no-op;
        //    the active entry is left untouched.
        if let Some(h) = held {
            if mode <= h {
                trace!("txn {txn} already holds {h:?}, request for {mode:?} is a no-op");
                return Ok(Posted::Immediate);
            }
        }

        // 4. The sole holder may upgrade in place when nothing is queued.
        if held.is_some()
            && self.is_sole_holder(txn)
            && self.pending.is_empty()
            && self.pending_exclusive.is_none()
        {
            self.granted.insert(txn, mode);
            self.recompute();
            trace!("txn {txn} upgraded to {mode:?} in place");
            return Ok(Posted::Immediate);
        }

        // 5. FIFO wait.
        let slot = WaitSlot::new(txn, mode, held);
        self.pending.push_back(Arc::clone(&slot));
        trace!("txn {txn} queued for {mode:?}");
        Ok(Posted::Parked(slot))
    }

    /// Re-run grant decisions after any mutation: the pending-exclusive slot
    /// first, then the FIFO queue, draining while the head stays compatible
    /// with the other holders.
    fn reevaluate(&mut self) {
        if let Some(slot) = self.pending_exclusive.take() {
            if self.is_sole_holder(slot.txn) {
                self.granted.insert(slot.txn, slot.mode);
                self.recompute();
                slot.grant();
            } else {
                self.pending_exclusive = Some(slot);
            }
        }

        loop {
            let head_grantable = match self.pending.front() {
                Some(front) => {
                    self.granted.is_empty()
                        || front
                            .mode
                            .is_compatible_with(self.aggregate_without(front.txn))
                }
                None => false,
            };
            if !head_grantable {
                break;
            }
            if let Some(slot) = self.pending.pop_front() {
                self.granted.insert(slot.txn, slot.mode);
                self.recompute();
                slot.grant();
            }
        }
    }

    /// Remove a parked request that timed out before it was granted.
    fn detach(&mut self, slot: &Arc<WaitSlot<M>>) {
        if let Some(pe) = &self.pending_exclusive {
            if Arc::ptr_eq(pe, slot) {
                self.pending_exclusive = None;
                return;
            }
        }
        self.pending.retain(|s| !Arc::ptr_eq(s, slot));
    }

    /// Undo a grant that raced the caller's deadline, restoring the entry
    /// the transaction held when the request was posted.
    fn undo_grant(&mut self, slot: &WaitSlot<M>) {
        match slot.prior {
            Some(prior) => {
                self.granted.insert(slot.txn, prior);
            }
            None => {
                self.granted.remove(&slot.txn);
            }
        }
        self.recompute();
        self.reevaluate();
    }
}

/// The lock state machine for one resource.
pub struct ResourceLockState<M: LockMode> {
    tables: RwLock<GrantTables<M>>,
}

impl<M: LockMode> Default for ResourceLockState<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: LockMode> ResourceLockState<M> {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(GrantTables::new()),
        }
    }

    /// Acquire `mode` for `txn`, blocking up to `timeout`.
    ///
    /// On timeout the request is withdrawn and the resource is left exactly
    /// as if it had never been posted; a grant that races the deadline is
    /// undone before the error is returned.
    pub fn acquire(&self, txn: TransactionId, mode: M, timeout: Duration) -> LockResult<()> {
        if mode == M::NONE {
            return Err(LockError::Protocol(format!(
                "cannot acquire the {mode:?} mode; use release instead"
            )));
        }

        let slot = {
            let mut tables = self.tables.write();
            match tables.post(txn, mode)? {
                Posted::Immediate => return Ok(()),
                Posted::Parked(slot) => {
                    // A sole-holder upgrade may become grantable right away.
                    tables.reevaluate();
                    slot
                }
            }
        };

        let deadline = Instant::now() + timeout;
        {
            let mut state = slot.sync.lock();
            loop {
                match *state {
                    WaitState::Granted => return Ok(()),
                    WaitState::Abandoned => {
                        return Err(LockError::Invariant(
                            "wait slot abandoned while its owner was still waiting".into(),
                        ));
                    }
                    WaitState::Waiting => {
                        if slot.cond.wait_until(&mut state, deadline).timed_out() {
                            break;
                        }
                    }
                }
            }
        }

        self.expire(&slot, timeout)
    }

    /// Withdraw a request whose deadline elapsed.
    fn expire(&self, slot: &Arc<WaitSlot<M>>, timeout: Duration) -> LockResult<()> {
        let mut tables = self.tables.write();
        let mut state = slot.sync.lock();
        match *state {
            WaitState::Granted => {
                // Granted after the deadline: the caller must observe the
                // request as never granted.
                drop(state);
                tables.undo_grant(slot);
                Err(LockError::Timeout(timeout))
            }
            WaitState::Waiting => {
                *state = WaitState::Abandoned;
                drop(state);
                tables.detach(slot);
                Err(LockError::Timeout(timeout))
            }
            WaitState::Abandoned => Err(LockError::Invariant(
                "pending lock request expired twice".into(),
            )),
        }
    }

    /// Release down to `new_mode`. Releasing to [`LockMode::NONE`] removes
    /// the transaction from the active holders; any other target must be a
    /// downgrade of the held mode. Releasing while holding nothing is a
    /// logged no-op.
    pub fn release(&self, txn: TransactionId, new_mode: M) -> LockResult<ReleaseOutcome> {
        let mut tables = self.tables.write();
        let held = match tables.granted.get(&txn).copied() {
            Some(held) => held,
            None => {
                debug!("release to {new_mode:?} ignored: txn {txn} holds no lock");
                return Ok(ReleaseOutcome::NotHeld);
            }
        };

        let outcome = if new_mode == M::NONE {
            tables.granted.remove(&txn);
            ReleaseOutcome::Released
        } else if new_mode > held {
            return Err(LockError::Protocol(format!(
                "txn {txn} cannot release {held:?} up to {new_mode:?}"
            )));
        } else {
            tables.granted.insert(txn, new_mode);
            ReleaseOutcome::Downgraded
        };

        tables.recompute();
        tables.reevaluate();
        Ok(outcome)
    }

    /// Whether `txn` currently holds `mode` or a stronger one.
    pub fn holds_at_least(&self, txn: TransactionId, mode: M) -> bool {
        self.tables
            .read()
            .granted
            .get(&txn)
            .is_some_and(|held| *held >= mode)
    }

    /// The mode currently granted to `txn`, or [`LockMode::NONE`].
    pub fn mode_of(&self, txn: TransactionId) -> M {
        self.tables
            .read()
            .granted
            .get(&txn)
            .copied()
            .unwrap_or(M::NONE)
    }

    /// Aggregate granted mode: the max ordinal across active holders.
    pub fn current_mode(&self) -> M {
        self.tables.read().aggregate
    }

    pub fn active_count(&self) -> usize {
        self.tables.read().granted.len()
    }

    /// Consistent snapshot of every (transaction, granted mode) pair.
    pub fn granted_snapshot(&self) -> Vec<(TransactionId, M)> {
        self.tables
            .read()
            .granted
            .iter()
            .map(|(txn, mode)| (*txn, *mode))
            .collect()
    }

    /// True when nothing is granted and nothing is waiting. A resource must
    /// be idle before its registry slot can be retired.
    pub fn is_idle(&self) -> bool {
        let tables = self.tables.read();
        tables.granted.is_empty() && tables.pending.is_empty() && tables.pending_exclusive.is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::mode::{DataLockMode, ObjectLockMode};

    const TICK: Duration = Duration::from_millis(100);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn grant_and_release_round_trip() {
        let state = ResourceLockState::<DataLockMode>::new();
        state.acquire(1, DataLockMode::Exclusive, LONG).unwrap();
        assert_eq!(state.current_mode(), DataLockMode::Exclusive);
        assert_eq!(state.active_count(), 1);

        let outcome = state.release(1, DataLockMode::None).unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);
        assert_eq!(state.current_mode(), DataLockMode::None);
        assert_eq!(state.active_count(), 0);
        assert!(state.is_idle());
    }

    #[test]
    fn shared_holders_coexist() {
        let state = ResourceLockState::<DataLockMode>::new();
        state.acquire(1, DataLockMode::Shared, LONG).unwrap();
        state.acquire(2, DataLockMode::Shared, LONG).unwrap();
        state.acquire(3, DataLockMode::Update, LONG).unwrap();
        assert_eq!(state.active_count(), 3);
        assert_eq!(state.current_mode(), DataLockMode::Update);
    }

    #[test]
    fn exclusive_blocks_until_timeout() {
        let state = Arc::new(ResourceLockState::<DataLockMode>::new());
        state.acquire(1, DataLockMode::Shared, LONG).unwrap();

        let contender = Arc::clone(&state);
        let handle = thread::spawn(move || {
            let started = Instant::now();
            let result = contender.acquire(2, DataLockMode::Exclusive, TICK);
            (result, started.elapsed())
        });
        let (result, elapsed) = handle.join().unwrap();
        assert!(matches!(result, Err(LockError::Timeout(_))));
        assert!(elapsed >= TICK);

        // The loser left no trace; the winner still holds Shared.
        assert!(state.holds_at_least(1, DataLockMode::Shared));
        assert_eq!(state.active_count(), 1);
        assert_eq!(state.mode_of(2), DataLockMode::None);
    }

    #[test]
    fn fifo_grant_after_release() {
        let state = Arc::new(ResourceLockState::<DataLockMode>::new());
        state.acquire(1, DataLockMode::Exclusive, LONG).unwrap();

        let waiter = Arc::clone(&state);
        let handle = thread::spawn(move || waiter.acquire(2, DataLockMode::Shared, LONG));
        // Give the waiter time to park.
        thread::sleep(Duration::from_millis(50));
        assert_eq!(state.mode_of(2), DataLockMode::None);

        state.release(1, DataLockMode::None).unwrap();
        handle.join().unwrap().unwrap();
        assert!(state.holds_at_least(2, DataLockMode::Shared));
    }

    #[test]
    fn downgrade_request_is_noop() {
        let state = ResourceLockState::<DataLockMode>::new();
        state.acquire(1, DataLockMode::Update, LONG).unwrap();
        // Requesting a weaker mode leaves the active entry untouched.
        state.acquire(1, DataLockMode::Shared, LONG).unwrap();
        assert_eq!(state.mode_of(1), DataLockMode::Update);
    }

    #[test]
    fn sole_holder_upgrades_in_place() {
        let state = ResourceLockState::<DataLockMode>::new();
        state.acquire(1, DataLockMode::Shared, LONG).unwrap();
        state.acquire(1, DataLockMode::Update, LONG).unwrap();
        assert_eq!(state.mode_of(1), DataLockMode::Update);

        // Update may enter exclusive while sole holder.
        state.acquire(1, DataLockMode::Exclusive, TICK).unwrap();
        assert_eq!(state.mode_of(1), DataLockMode::Exclusive);
        assert_eq!(state.active_count(), 1);
    }

    #[test]
    fn forbidden_exclusive_entry_is_protocol_error() {
        let state = ResourceLockState::<ObjectLockMode>::new();
        state.acquire(1, ObjectLockMode::IntentShared, LONG).unwrap();
        let err = state
            .acquire(1, ObjectLockMode::Exclusive, TICK)
            .unwrap_err();
        assert!(matches!(err, LockError::Protocol(_)));
        assert_eq!(state.mode_of(1), ObjectLockMode::IntentShared);
    }

    #[test]
    fn pending_exclusive_waits_for_other_holders() {
        let state = Arc::new(ResourceLockState::<DataLockMode>::new());
        state.acquire(1, DataLockMode::Shared, LONG).unwrap();
        state.acquire(2, DataLockMode::Shared, LONG).unwrap();

        let upgrader = Arc::clone(&state);
        let handle = thread::spawn(move || upgrader.acquire(1, DataLockMode::Exclusive, LONG));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(state.mode_of(1), DataLockMode::Shared);

        state.release(2, DataLockMode::None).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(state.mode_of(1), DataLockMode::Exclusive);
    }

    #[test]
    fn release_not_held_is_ignored() {
        let state = ResourceLockState::<DataLockMode>::new();
        let outcome = state.release(9, DataLockMode::None).unwrap();
        assert_eq!(outcome, ReleaseOutcome::NotHeld);
        // Twice in a row stays a no-op.
        let outcome = state.release(9, DataLockMode::None).unwrap();
        assert_eq!(outcome, ReleaseOutcome::NotHeld);
    }

    #[test]
    fn release_cannot_upgrade() {
        let state = ResourceLockState::<DataLockMode>::new();
        state.acquire(1, DataLockMode::Shared, LONG).unwrap();
        let err = state.release(1, DataLockMode::Exclusive).unwrap_err();
        assert!(matches!(err, LockError::Protocol(_)));
        assert_eq!(state.mode_of(1), DataLockMode::Shared);
    }

    #[test]
    fn downgrade_release_keeps_holder_active() {
        let state = ResourceLockState::<DataLockMode>::new();
        state.acquire(1, DataLockMode::Exclusive, LONG).unwrap();
        let outcome = state.release(1, DataLockMode::Shared).unwrap();
        assert_eq!(outcome, ReleaseOutcome::Downgraded);
        assert_eq!(state.mode_of(1), DataLockMode::Shared);

        // Another reader can now join.
        state.acquire(2, DataLockMode::Shared, TICK).unwrap();
        assert_eq!(state.active_count(), 2);
    }

    #[test]
    fn granted_modes_stay_pairwise_compatible() {
        let state = Arc::new(ResourceLockState::<DataLockMode>::new());
        let mut handles = Vec::new();
        for txn in 0..8u32 {
            let state = Arc::clone(&state);
            handles.push(thread::spawn(move || {
                let mode = if txn % 2 == 0 {
                    DataLockMode::Shared
                } else {
                    DataLockMode::Exclusive
                };
                if state.acquire(txn, mode, LONG).is_ok() {
                    thread::sleep(Duration::from_millis(5));
                    let granted = state.granted_snapshot();
                    for (i, (_, a)) in granted.iter().enumerate() {
                        for (_, b) in granted.iter().skip(i + 1) {
                            assert!(a.is_compatible_with(*b), "incompatible grants {a:?}/{b:?}");
                        }
                    }
                    state.release(txn, DataLockMode::None).unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(state.is_idle());
    }
}
