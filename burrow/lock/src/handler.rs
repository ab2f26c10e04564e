//! Per-granularity lock registries.
//!
//! A [`LockHandler`] owns every live lock resource of one granularity in a
//! slot arena indexed by `u32` handles. The key map, the arena, and the
//! bounded free list are guarded by a single fast mutex that is only held
//! for map operations, never while a lock grant is awaited. Reference
//! counts are plain atomics shared into each [`LockRef`]; only the final
//! release takes the handler mutex to retire the slot.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use burrow_common::types::TransactionId;
use log::error;
use parking_lot::Mutex;

use crate::error::LockResult;
use crate::mode::{DatabaseLockMode, DataLockMode, LockMode, ObjectLockMode, RootLockMode,
    SchemaLockMode};
use crate::state::{ReleaseOutcome, ResourceLockState};

/// Default number of retired slots kept for reuse.
pub const DEFAULT_FREE_POOL_CAPACITY: usize = 100;

pub type DatabaseLockRef = LockRef<DatabaseLockMode>;
pub type RootLockRef = LockRef<RootLockMode>;
pub type ObjectLockRef = LockRef<ObjectLockMode>;
pub type SchemaLockRef = LockRef<SchemaLockMode>;
pub type DataLockRef = LockRef<DataLockMode>;

/// Add-ref'd handle to the parent lock one level up the hierarchy.
///
/// Parent links only ever point upward (data/schema → object → database,
/// root → database), so the reference graph is acyclic by construction.
#[derive(Clone)]
pub enum ParentHandle {
    Database(DatabaseLockRef),
    Root(RootLockRef),
    Object(ObjectLockRef),
}

impl ParentHandle {
    /// Whether both handles refer to the same live lock resource.
    pub fn same_resource_as(&self, other: &ParentHandle) -> bool {
        match (self, other) {
            (Self::Database(a), Self::Database(b)) => a.same_resource(b),
            (Self::Root(a), Self::Root(b)) => a.same_resource(b),
            (Self::Object(a), Self::Object(b)) => a.same_resource(b),
            _ => false,
        }
    }
}

struct LockSlot<M: LockMode> {
    key: String,
    /// True while the slot sits on the free list awaiting reuse.
    vacant: bool,
    refs: Arc<AtomicUsize>,
    state: Arc<ResourceLockState<M>>,
    parent: Option<ParentHandle>,
}

impl<M: LockMode> LockSlot<M> {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_owned(),
            vacant: false,
            refs: Arc::new(AtomicUsize::new(1)),
            state: Arc::new(ResourceLockState::new()),
            parent: None,
        }
    }
}

struct HandlerInner<M: LockMode> {
    active: HashMap<String, u32>,
    slots: HashMap<u32, LockSlot<M>>,
    free: Vec<u32>,
    next_index: u32,
}

/// Registry of all live lock resources of one granularity.
pub struct LockHandler<M: LockMode> {
    name: &'static str,
    inner: Mutex<HandlerInner<M>>,
    free_pool_capacity: usize,
}

impl<M: LockMode> LockHandler<M> {
    pub fn new(name: &'static str, free_pool_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            name,
            inner: Mutex::new(HandlerInner {
                active: HashMap::new(),
                slots: HashMap::new(),
                free: Vec::new(),
                next_index: 0,
            }),
            free_pool_capacity,
        })
    }

    /// Resolve `key` to its live lock resource, creating (or recycling) a
    /// slot if needed. The returned handle owns one reference.
    pub fn get_or_create(self: &Arc<Self>, key: &str) -> LockRef<M> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(&index) = inner.active.get(key) {
            let slot = &inner.slots[&index];
            slot.refs.fetch_add(1, Ordering::AcqRel);
            return LockRef {
                handler: Arc::clone(self),
                index,
                refs: Arc::clone(&slot.refs),
                state: Arc::clone(&slot.state),
            };
        }

        let mut reused = None;
        while let Some(index) = inner.free.pop() {
            if let Some(slot) = inner.slots.get_mut(&index) {
                slot.key = key.to_owned();
                slot.vacant = false;
                slot.refs.store(1, Ordering::Release);
                reused = Some(index);
                break;
            }
        }
        let index = match reused {
            Some(index) => index,
            None => {
                let index = inner.next_index;
                inner.next_index += 1;
                inner.slots.insert(index, LockSlot::new(key));
                index
            }
        };
        inner.active.insert(key.to_owned(), index);
        let slot = &inner.slots[&index];
        LockRef {
            handler: Arc::clone(self),
            index,
            refs: Arc::clone(&slot.refs),
            state: Arc::clone(&slot.state),
        }
    }

    /// Number of live (keyed) lock resources.
    pub fn active_len(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Number of retired slots waiting on the free list.
    pub fn pooled_len(&self) -> usize {
        self.inner.lock().free.len()
    }

    fn parent_of(&self, index: u32) -> Option<ParentHandle> {
        let guard = self.inner.lock();
        guard.slots.get(&index).and_then(|slot| slot.parent.clone())
    }

    /// Store `parent` unless a parent is already wired. Returns the rejected
    /// handle so the caller can drop it outside the handler mutex; the
    /// parent link, once set, is stable for the life of the slot.
    fn set_parent_if_empty(&self, index: u32, parent: ParentHandle) -> Option<ParentHandle> {
        let mut guard = self.inner.lock();
        match guard.slots.get_mut(&index) {
            Some(slot) if slot.parent.is_none() => {
                slot.parent = Some(parent);
                None
            }
            _ => Some(parent),
        }
    }

    fn has_parent(&self, index: u32) -> bool {
        let guard = self.inner.lock();
        guard
            .slots
            .get(&index)
            .is_some_and(|slot| slot.parent.is_some())
    }

    /// Final-release path: evict the key, detach the parent link, and either
    /// pool or drop the slot. Skips out if a concurrent `get_or_create`
    /// resurrected the entry.
    fn retire(&self, index: u32) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(slot) = inner.slots.get_mut(&index) else {
            return;
        };
        if slot.vacant || slot.refs.load(Ordering::Acquire) != 0 {
            return;
        }
        if !slot.state.is_idle() {
            // Refcount zero with live requests means a lock/unlock imbalance
            // somewhere above us.
            error!(
                "{} lock {:?} retired with active or pending requests",
                self.name, slot.key
            );
            debug_assert!(false, "lock retired with active or pending requests");
        }
        inner.active.remove(&slot.key);
        let parent = slot.parent.take();
        slot.vacant = true;
        if inner.free.len() < self.free_pool_capacity {
            slot.key.clear();
            inner.free.push(index);
        } else {
            inner.slots.remove(&index);
        }
        drop(guard);
        // The parent reference cascades outside our own mutex; the chain
        // only ever walks upward, so lock order stays child → parent.
        drop(parent);
    }
}

/// Reference-counted handle to one lock resource.
///
/// `Clone` takes an additional reference, `Drop` releases it; the final
/// drop retires the registry slot. A granted lock holds its own reference
/// (taken by [`LockRef::lock`], released by [`LockRef::unlock`]), so a
/// resource with an active request can never reach refcount zero.
pub struct LockRef<M: LockMode> {
    handler: Arc<LockHandler<M>>,
    index: u32,
    refs: Arc<AtomicUsize>,
    state: Arc<ResourceLockState<M>>,
}

impl<M: LockMode> LockRef<M> {
    /// Acquire `mode` for `txn`, blocking up to `timeout`.
    pub fn lock(&self, txn: TransactionId, mode: M, timeout: Duration) -> LockResult<()> {
        let was_held = self.state.mode_of(txn) != M::NONE;
        self.state.acquire(txn, mode, timeout)?;
        if !was_held {
            self.refs.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Release down to `new_mode`; releasing to [`LockMode::NONE`] drops the
    /// hold reference taken by [`LockRef::lock`].
    pub fn unlock(&self, txn: TransactionId, new_mode: M) -> LockResult<()> {
        let outcome = self.state.release(txn, new_mode)?;
        if outcome == ReleaseOutcome::Released {
            self.release_ref();
        }
        Ok(())
    }

    pub fn holds_at_least(&self, txn: TransactionId, mode: M) -> bool {
        self.state.holds_at_least(txn, mode)
    }

    pub fn mode_of(&self, txn: TransactionId) -> M {
        self.state.mode_of(txn)
    }

    pub fn current_mode(&self) -> M {
        self.state.current_mode()
    }

    /// Whether both handles refer to the same live lock resource.
    pub fn same_resource(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    pub fn parent(&self) -> Option<ParentHandle> {
        self.handler.parent_of(self.index)
    }

    pub fn has_parent(&self) -> bool {
        self.handler.has_parent(self.index)
    }

    /// Wire the parent link if it is not wired yet; a raced duplicate is
    /// released immediately.
    pub fn set_parent(&self, parent: ParentHandle) {
        let rejected = self.handler.set_parent_if_empty(self.index, parent);
        drop(rejected);
    }

    /// Current reference count, for diagnostics and tests.
    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    fn release_ref(&self) {
        if self.refs.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.handler.retire(self.index);
        }
    }
}

impl<M: LockMode> Clone for LockRef<M> {
    fn clone(&self) -> Self {
        self.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            handler: Arc::clone(&self.handler),
            index: self.index,
            refs: Arc::clone(&self.refs),
            state: Arc::clone(&self.state),
        }
    }
}

impl<M: LockMode> Drop for LockRef<M> {
    fn drop(&mut self) {
        self.release_ref();
    }
}
