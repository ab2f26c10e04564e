//! Per-transaction aggregate of every lock the transaction holds.
//!
//! The [`TransactionLockOwnerBlock`] is the single entry point the commit
//! and rollback paths use to drop everything a transaction acquired: item
//! and owner locks via the per-owner [`LockOwnerBlock`]s, then schema,
//! root, and database locks, in child-first order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use burrow_common::types::{
    DatabaseId, ExtentIndex, FileGroupId, LogicalPageId, ObjectId, TransactionId, VirtualPageId,
};
use log::{debug, warn};
use parking_lot::Mutex;

use crate::error::LockResult;
use crate::handler::{DatabaseLockRef, RootLockRef, SchemaLockRef};
use crate::manager::GlobalLockManager;
use crate::mode::{DataLockMode, DatabaseLockMode, RootLockMode, SchemaLockMode};
use crate::owner::{LockOwnerBlock, OwnerBlockConfig, OwnerScope};

pub struct TransactionLockOwnerBlock {
    manager: Arc<GlobalLockManager>,
    txn: TransactionId,
    config: OwnerBlockConfig,
    owner_blocks: Mutex<HashMap<OwnerScope, LockOwnerBlock>>,
    root_locks: Mutex<HashMap<(DatabaseId, FileGroupId), RootLockRef>>,
    schema_locks: Mutex<HashMap<(DatabaseId, ObjectId), SchemaLockRef>>,
    database_locks: Mutex<HashMap<DatabaseId, DatabaseLockRef>>,
}

impl TransactionLockOwnerBlock {
    pub fn new(manager: Arc<GlobalLockManager>, txn: TransactionId) -> Self {
        Self::with_config(manager, txn, OwnerBlockConfig::default())
    }

    pub fn with_config(
        manager: Arc<GlobalLockManager>,
        txn: TransactionId,
        config: OwnerBlockConfig,
    ) -> Self {
        Self {
            manager,
            txn,
            config,
            owner_blocks: Mutex::new(HashMap::new()),
            root_locks: Mutex::new(HashMap::new()),
            schema_locks: Mutex::new(HashMap::new()),
            database_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.txn
    }

    // ---- Coarse-grained locks ----

    pub fn lock_database(
        &self,
        db: DatabaseId,
        mode: DatabaseLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        let mut locks = self.database_locks.lock();
        let lock = locks
            .entry(db)
            .or_insert_with(|| self.manager.database_lock(db));
        lock.lock(self.txn, mode, timeout)
    }

    pub fn unlock_database(&self, db: DatabaseId) -> LockResult<()> {
        match self.database_locks.lock().remove(&db) {
            Some(lock) => lock.unlock(self.txn, DatabaseLockMode::None),
            None => {
                debug!("database {db} unlock ignored: txn {} holds none", self.txn);
                Ok(())
            }
        }
    }

    pub fn lock_root(
        &self,
        db: DatabaseId,
        file_group: FileGroupId,
        mode: RootLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        let mut locks = self.root_locks.lock();
        let lock = locks
            .entry((db, file_group))
            .or_insert_with(|| self.manager.root_lock(db, file_group));
        lock.lock(self.txn, mode, timeout)
    }

    pub fn unlock_root(&self, db: DatabaseId, file_group: FileGroupId) -> LockResult<()> {
        match self.root_locks.lock().remove(&(db, file_group)) {
            Some(lock) => lock.unlock(self.txn, RootLockMode::None),
            None => {
                debug!(
                    "root {db}/{file_group} unlock ignored: txn {} holds none",
                    self.txn
                );
                Ok(())
            }
        }
    }

    pub fn lock_schema(
        &self,
        db: DatabaseId,
        object: ObjectId,
        mode: SchemaLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        let mut locks = self.schema_locks.lock();
        let lock = locks
            .entry((db, object))
            .or_insert_with(|| self.manager.schema_lock(db, object));
        lock.lock(self.txn, mode, timeout)
    }

    pub fn unlock_schema(&self, db: DatabaseId, object: ObjectId) -> LockResult<()> {
        match self.schema_locks.lock().remove(&(db, object)) {
            Some(lock) => lock.unlock(self.txn, SchemaLockMode::None),
            None => {
                debug!(
                    "schema {db}/{object} unlock ignored: txn {} holds none",
                    self.txn
                );
                Ok(())
            }
        }
    }

    // ---- Item locks through owner blocks ----

    pub fn lock_page(
        &self,
        db: DatabaseId,
        object: ObjectId,
        page: LogicalPageId,
        mode: DataLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.with_owner_block(OwnerScope::Object { database: db, object }, |block| {
            block.lock_item(page, mode, timeout)
        })
    }

    pub fn unlock_page(
        &self,
        db: DatabaseId,
        object: ObjectId,
        page: LogicalPageId,
    ) -> LockResult<bool> {
        self.with_owner_block(OwnerScope::Object { database: db, object }, |block| {
            block.unlock_item(page)
        })
    }

    pub fn lock_extent(
        &self,
        db: DatabaseId,
        virtual_page: VirtualPageId,
        extent: ExtentIndex,
        mode: DataLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        let scope = OwnerScope::Distribution {
            database: db,
            virtual_page,
        };
        self.with_owner_block(scope, |block| {
            block.lock_item(u64::from(extent), mode, timeout)
        })
    }

    pub fn unlock_extent(
        &self,
        db: DatabaseId,
        virtual_page: VirtualPageId,
        extent: ExtentIndex,
    ) -> LockResult<bool> {
        let scope = OwnerScope::Distribution {
            database: db,
            virtual_page,
        };
        self.with_owner_block(scope, |block| block.unlock_item(u64::from(extent)))
    }

    /// Release one owner's lock if its item counter has drained; deferred
    /// otherwise.
    pub fn unlock_owner(&self, scope: OwnerScope) -> LockResult<()> {
        self.with_owner_block(scope, |block| block.unlock_owner())
    }

    /// Run `f` against the owner block for `scope`, creating it on first
    /// use.
    pub fn with_owner_block<R>(
        &self,
        scope: OwnerScope,
        f: impl FnOnce(&mut LockOwnerBlock) -> R,
    ) -> R {
        let mut blocks = self.owner_blocks.lock();
        let block = blocks.entry(scope).or_insert_with(|| {
            LockOwnerBlock::new(Arc::clone(&self.manager), self.txn, scope, self.config)
        });
        f(block)
    }

    /// Release everything the transaction holds, child-first: item and
    /// owner locks, then schema, root, and database locks. Individual
    /// failures are logged; the pass always completes.
    pub fn release_all(&self) {
        let txn = self.txn;
        for (scope, mut block) in self.owner_blocks.lock().drain() {
            if let Err(err) = block.release_all() {
                warn!("txn {txn}: owner block {scope:?} release failed: {err}");
            }
        }
        for ((db, object), lock) in self.schema_locks.lock().drain() {
            if let Err(err) = lock.unlock(txn, SchemaLockMode::None) {
                warn!("txn {txn}: schema {db}/{object} unlock failed: {err}");
            }
        }
        for ((db, file_group), lock) in self.root_locks.lock().drain() {
            if let Err(err) = lock.unlock(txn, RootLockMode::None) {
                warn!("txn {txn}: root {db}/{file_group} unlock failed: {err}");
            }
        }
        for (db, lock) in self.database_locks.lock().drain() {
            if let Err(err) = lock.unlock(txn, DatabaseLockMode::None) {
                warn!("txn {txn}: database {db} unlock failed: {err}");
            }
        }
    }
}
