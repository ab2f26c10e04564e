//! Per-transaction, per-owner lock bookkeeping and escalation.
//!
//! A [`LockOwnerBlock`] tracks every item lock (data page or distribution
//! extent) one transaction holds beneath one owner resource, keeps the
//! owner's intent lock at the right level, and escalates to a full owner
//! lock once the per-category item count crosses the threshold. The three
//! category maps are disjoint: an item key appears in at most one of them
//! at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use burrow_common::types::{DatabaseId, ObjectId, TransactionId, VirtualPageId};
use log::{debug, warn};
use smallvec::SmallVec;

use crate::error::{LockError, LockResult};
use crate::handler::{DataLockRef, ObjectLockRef};
use crate::manager::GlobalLockManager;
use crate::mode::{DataLockMode, ObjectLockMode};

/// Default number of item locks one transaction may track per category
/// before escalation is attempted.
pub const DEFAULT_MAX_ITEM_LOCKS: usize = 100;

/// Escalation tunables.
#[derive(Debug, Clone, Copy)]
pub struct OwnerBlockConfig {
    /// Item locks tracked per category before escalation is attempted.
    pub max_item_locks: usize,
}

impl Default for OwnerBlockConfig {
    fn default() -> Self {
        Self {
            max_item_locks: DEFAULT_MAX_ITEM_LOCKS,
        }
    }
}

/// The owner resource a block is scoped to: either a real object or the
/// synthetic owner covering one distribution page's extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerScope {
    Object {
        database: DatabaseId,
        object: ObjectId,
    },
    Distribution {
        database: DatabaseId,
        virtual_page: VirtualPageId,
    },
}

impl OwnerScope {
    fn owner_lock(&self, manager: &GlobalLockManager) -> ObjectLockRef {
        match *self {
            Self::Object { database, object } => manager.object_lock(database, object),
            Self::Distribution {
                database,
                virtual_page,
            } => manager.distribution_owner_lock(database, virtual_page),
        }
    }

    fn item_lock(&self, manager: &GlobalLockManager, item: u64) -> DataLockRef {
        match *self {
            Self::Object { database, object } => manager.data_lock(database, object, item),
            Self::Distribution {
                database,
                virtual_page,
                // Extent items are zero-extended u32 indices.
            } => manager.extent_lock(database, virtual_page, item as u32),
        }
    }
}

/// How one item key is covered.
///
/// `Tracked` owns the individually-held item lock. `Escalated` records a
/// key whose coverage comes from the owner-level lock, so per-key unlock
/// bookkeeping and the owner counter stay exact after escalation.
enum ItemEntry {
    Tracked(DataLockRef),
    Escalated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Read,
    Update,
    Write,
}

/// Escalation state machine for one (transaction, owner) pair.
pub struct LockOwnerBlock {
    manager: Arc<GlobalLockManager>,
    txn: TransactionId,
    scope: OwnerScope,
    owner: ObjectLockRef,
    max_item_locks: usize,
    read: HashMap<u64, ItemEntry>,
    update: HashMap<u64, ItemEntry>,
    write: HashMap<u64, ItemEntry>,
    /// Owner-level locks consumed: one per recorded item key, released one
    /// per `unlock_item`.
    owner_count: usize,
}

impl LockOwnerBlock {
    pub fn new(
        manager: Arc<GlobalLockManager>,
        txn: TransactionId,
        scope: OwnerScope,
        config: OwnerBlockConfig,
    ) -> Self {
        let owner = scope.owner_lock(&manager);
        Self {
            manager,
            txn,
            scope,
            owner,
            max_item_locks: config.max_item_locks,
            read: HashMap::new(),
            update: HashMap::new(),
            write: HashMap::new(),
            owner_count: 0,
        }
    }

    pub fn scope(&self) -> OwnerScope {
        self.scope
    }

    /// Owner-level lock mode currently held by this transaction.
    pub fn owner_mode(&self) -> ObjectLockMode {
        self.owner.mode_of(self.txn)
    }

    pub fn owner_count(&self) -> usize {
        self.owner_count
    }

    /// Number of individually-held (non-escalated) item locks.
    pub fn tracked_items(&self) -> usize {
        [&self.read, &self.update, &self.write]
            .iter()
            .map(|map| {
                map.values()
                    .filter(|entry| matches!(entry, ItemEntry::Tracked(_)))
                    .count()
            })
            .sum()
    }

    /// Acquire an item lock beneath the owner, maintaining intent locks and
    /// escalation state.
    pub fn lock_item(&mut self, item: u64, mode: DataLockMode, timeout: Duration) -> LockResult<()> {
        match mode {
            DataLockMode::Shared => self.lock_item_shared(item, timeout),
            DataLockMode::Update => self.lock_item_update(item, timeout),
            DataLockMode::Exclusive => self.lock_item_exclusive(item, timeout),
            DataLockMode::None => Err(LockError::Protocol(
                "cannot acquire an item lock in the None mode".into(),
            )),
        }
    }

    fn lock_item_shared(&mut self, item: u64, timeout: Duration) -> LockResult<()> {
        if self.contains(item) {
            return Ok(());
        }
        // A full owner lock already covers reads of every item beneath it;
        // record the key so unlock bookkeeping stays exact.
        if self.owner_covers_shared() {
            self.read.insert(item, ItemEntry::Escalated);
            self.owner_count += 1;
            return Ok(());
        }

        self.ensure_shared_intent(timeout)?;
        let lock = self.scope.item_lock(&self.manager, item);
        lock.lock(self.txn, DataLockMode::Shared, timeout)?;
        self.read.insert(item, ItemEntry::Tracked(lock));
        self.owner_count += 1;

        if self.read.len() > self.max_item_locks {
            self.try_escalate(Category::Read, timeout);
        }
        Ok(())
    }

    fn lock_item_update(&mut self, item: u64, timeout: Duration) -> LockResult<()> {
        if self.write.contains_key(&item) || self.update.contains_key(&item) {
            return Ok(());
        }

        // Upgrade a shared entry for the same key in place.
        if let Some(entry) = self.read.remove(&item) {
            let upgraded = self.upgrade_entry(item, entry, DataLockMode::Update, timeout);
            return match upgraded {
                Ok(entry) => {
                    self.update.insert(item, entry);
                    Ok(())
                }
                Err((entry, err)) => {
                    self.read.insert(item, entry);
                    Err(err)
                }
            };
        }

        if self.owner_mode() == ObjectLockMode::Exclusive {
            self.update.insert(item, ItemEntry::Escalated);
            self.owner_count += 1;
            return Ok(());
        }

        self.ensure_exclusive_intent(timeout)?;
        let lock = self.scope.item_lock(&self.manager, item);
        lock.lock(self.txn, DataLockMode::Update, timeout)?;
        self.update.insert(item, ItemEntry::Tracked(lock));
        self.owner_count += 1;

        if self.update.len() > self.max_item_locks {
            self.try_escalate(Category::Update, timeout);
        }
        Ok(())
    }

    fn lock_item_exclusive(&mut self, item: u64, timeout: Duration) -> LockResult<()> {
        if self.write.contains_key(&item) {
            return Ok(());
        }

        // Upgrade an update or shared entry for the same key in place.
        if let Some(entry) = self.update.remove(&item) {
            let upgraded = self.upgrade_entry(item, entry, DataLockMode::Exclusive, timeout);
            return match upgraded {
                Ok(entry) => {
                    self.write.insert(item, entry);
                    Ok(())
                }
                Err((entry, err)) => {
                    self.update.insert(item, entry);
                    Err(err)
                }
            };
        }
        if let Some(entry) = self.read.remove(&item) {
            let upgraded = self.upgrade_entry(item, entry, DataLockMode::Exclusive, timeout);
            return match upgraded {
                Ok(entry) => {
                    self.write.insert(item, entry);
                    Ok(())
                }
                Err((entry, err)) => {
                    self.read.insert(item, entry);
                    Err(err)
                }
            };
        }

        if self.owner_mode() == ObjectLockMode::Exclusive {
            self.write.insert(item, ItemEntry::Escalated);
            self.owner_count += 1;
            return Ok(());
        }

        self.ensure_exclusive_intent(timeout)?;
        let lock = self.scope.item_lock(&self.manager, item);
        lock.lock(self.txn, DataLockMode::Exclusive, timeout)?;
        self.write.insert(item, ItemEntry::Tracked(lock));
        self.owner_count += 1;

        if self.write.len() > self.max_item_locks {
            self.try_escalate(Category::Write, timeout);
        }
        Ok(())
    }

    /// Raise an existing entry to `target` without re-counting it. On
    /// failure the entry is handed back so the caller can restore it.
    fn upgrade_entry(
        &mut self,
        item: u64,
        entry: ItemEntry,
        target: DataLockMode,
        timeout: Duration,
    ) -> Result<ItemEntry, (ItemEntry, LockError)> {
        if let Err(err) = self.ensure_exclusive_intent(timeout) {
            return Err((entry, err));
        }
        match entry {
            ItemEntry::Tracked(lock) => match lock.lock(self.txn, target, timeout) {
                Ok(()) => Ok(ItemEntry::Tracked(lock)),
                Err(err) => Err((ItemEntry::Tracked(lock), err)),
            },
            ItemEntry::Escalated => {
                // The owner-level lock covered reads only; writing the item
                // needs its own lock.
                let lock = self.scope.item_lock(&self.manager, item);
                match lock.lock(self.txn, target, timeout) {
                    Ok(()) => Ok(ItemEntry::Tracked(lock)),
                    Err(err) => Err((ItemEntry::Escalated, err)),
                }
            }
        }
    }

    /// Release the lock tracked for `item`, trying the write, update, and
    /// read maps in that priority order. Returns whether a tracked key was
    /// found; unlocking an untracked key is a logged no-op.
    pub fn unlock_item(&mut self, item: u64) -> LockResult<bool> {
        let txn = self.txn;
        for map in [&mut self.write, &mut self.update, &mut self.read] {
            if let Some(entry) = map.remove(&item) {
                if let ItemEntry::Tracked(lock) = entry {
                    lock.unlock(txn, DataLockMode::None)?;
                }
                self.owner_count -= 1;
                return Ok(true);
            }
        }
        debug!("unlock for untracked item {item} ignored");
        Ok(false)
    }

    /// Release the owner-level lock, unless outstanding item locks still
    /// justify holding it; in that case the unlock is deferred until the
    /// owner counter drains to zero.
    pub fn unlock_owner(&mut self) -> LockResult<()> {
        if self.owner_count > 0 {
            debug!(
                "owner unlock deferred for {:?}: {} item locks outstanding",
                self.scope, self.owner_count
            );
            return Ok(());
        }
        if self.owner_mode() != ObjectLockMode::None {
            self.owner.unlock(self.txn, ObjectLockMode::None)?;
        }
        Ok(())
    }

    /// Release every item lock (write, then update, then read) and then the
    /// owner lock. Individual failures are logged and do not stop the pass.
    pub fn release_all(&mut self) -> LockResult<()> {
        let txn = self.txn;
        let mut released = 0usize;
        for map in [&mut self.write, &mut self.update, &mut self.read] {
            for (item, entry) in map.drain() {
                if let ItemEntry::Tracked(lock) = entry {
                    if let Err(err) = lock.unlock(txn, DataLockMode::None) {
                        warn!("item {item} unlock failed during release: {err}");
                    }
                }
                released += 1;
            }
        }
        self.owner_count = self.owner_count.saturating_sub(released);
        self.unlock_owner()
    }

    fn contains(&self, item: u64) -> bool {
        self.read.contains_key(&item)
            || self.update.contains_key(&item)
            || self.write.contains_key(&item)
    }

    fn owner_covers_shared(&self) -> bool {
        matches!(
            self.owner_mode(),
            ObjectLockMode::Shared | ObjectLockMode::SharedIntentExclusive | ObjectLockMode::Exclusive
        )
    }

    /// Shared items need at least IntentShared at the owner.
    fn ensure_shared_intent(&mut self, timeout: Duration) -> LockResult<()> {
        if self.owner_mode() == ObjectLockMode::None {
            self.owner
                .lock(self.txn, ObjectLockMode::IntentShared, timeout)?;
        }
        Ok(())
    }

    /// Update/exclusive items need IntentExclusive, upgraded to
    /// SharedIntentExclusive when the owner Shared lock is already held.
    fn ensure_exclusive_intent(&mut self, timeout: Duration) -> LockResult<()> {
        match self.owner_mode() {
            ObjectLockMode::IntentExclusive
            | ObjectLockMode::SharedIntentExclusive
            | ObjectLockMode::Exclusive => Ok(()),
            ObjectLockMode::Shared => {
                self.owner
                    .lock(self.txn, ObjectLockMode::SharedIntentExclusive, timeout)
            }
            ObjectLockMode::None | ObjectLockMode::IntentShared => self
                .owner
                .lock(self.txn, ObjectLockMode::IntentExclusive, timeout),
        }
    }

    /// Opportunistic escalation: try to take the covering owner lock and, on
    /// success, drop every individually-held item lock of the category.
    /// Failure only forfeits the optimization and is swallowed.
    fn try_escalate(&mut self, category: Category, timeout: Duration) {
        let target = match category {
            Category::Read => ObjectLockMode::Shared,
            Category::Update | Category::Write => ObjectLockMode::Exclusive,
        };
        if let Err(err) = self.owner.lock(self.txn, target, timeout) {
            debug!(
                "escalation to {target:?} on {:?} skipped: {err}",
                self.scope
            );
            return;
        }

        let txn = self.txn;
        let map = match category {
            Category::Read => &mut self.read,
            Category::Update => &mut self.update,
            Category::Write => &mut self.write,
        };
        let mut dropped: SmallVec<[DataLockRef; 8]> = SmallVec::new();
        for entry in map.values_mut() {
            if let ItemEntry::Tracked(lock) = std::mem::replace(entry, ItemEntry::Escalated) {
                dropped.push(lock);
            }
        }
        for lock in dropped {
            if let Err(err) = lock.unlock(txn, DataLockMode::None) {
                warn!("item unlock during escalation failed: {err}");
            }
        }
        debug!(
            "escalated {} {category:?} item locks on {:?} to owner {target:?}",
            map.len(),
            self.scope
        );
    }
}
