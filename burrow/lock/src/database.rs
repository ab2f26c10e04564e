//! Per-database façade over the global lock manager.

use std::sync::Arc;
use std::time::Duration;

use burrow_common::types::{
    DatabaseId, ExtentIndex, FileGroupId, LogicalPageId, ObjectId, TransactionId, VirtualPageId,
};

use crate::error::LockResult;
use crate::handler::{DataLockRef, DatabaseLockRef, ObjectLockRef, RootLockRef, SchemaLockRef};
use crate::manager::GlobalLockManager;
use crate::mode::{DataLockMode, DatabaseLockMode, ObjectLockMode, RootLockMode, SchemaLockMode};

/// Fixes the database-id dimension of every lock operation. Page-level
/// callers inside one database go through this façade rather than the
/// global manager.
pub struct DatabaseLockManager {
    global: Arc<GlobalLockManager>,
    db: DatabaseId,
}

impl DatabaseLockManager {
    pub fn new(global: Arc<GlobalLockManager>, db: DatabaseId) -> Self {
        Self { global, db }
    }

    pub fn database_id(&self) -> DatabaseId {
        self.db
    }

    pub fn global(&self) -> &Arc<GlobalLockManager> {
        &self.global
    }

    // ---- Resolution ----

    pub fn database_lock(&self) -> DatabaseLockRef {
        self.global.database_lock(self.db)
    }

    pub fn root_lock(&self, file_group: FileGroupId) -> RootLockRef {
        self.global.root_lock(self.db, file_group)
    }

    pub fn object_lock(&self, object: ObjectId) -> ObjectLockRef {
        self.global.object_lock(self.db, object)
    }

    pub fn schema_lock(&self, object: ObjectId) -> SchemaLockRef {
        self.global.schema_lock(self.db, object)
    }

    pub fn data_lock(&self, object: ObjectId, page: LogicalPageId) -> DataLockRef {
        self.global.data_lock(self.db, object, page)
    }

    pub fn extent_lock(&self, virtual_page: VirtualPageId, extent: ExtentIndex) -> DataLockRef {
        self.global.extent_lock(self.db, virtual_page, extent)
    }

    // ---- Lock/unlock ----

    pub fn lock_database(
        &self,
        txn: TransactionId,
        mode: DatabaseLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.global.lock_database(txn, self.db, mode, timeout)
    }

    pub fn unlock_database(&self, txn: TransactionId) -> LockResult<()> {
        self.global.unlock_database(txn, self.db)
    }

    pub fn lock_root(
        &self,
        txn: TransactionId,
        file_group: FileGroupId,
        mode: RootLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.global.lock_root(txn, self.db, file_group, mode, timeout)
    }

    pub fn unlock_root(&self, txn: TransactionId, file_group: FileGroupId) -> LockResult<()> {
        self.global.unlock_root(txn, self.db, file_group)
    }

    pub fn lock_object(
        &self,
        txn: TransactionId,
        object: ObjectId,
        mode: ObjectLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.global.lock_object(txn, self.db, object, mode, timeout)
    }

    pub fn unlock_object(&self, txn: TransactionId, object: ObjectId) -> LockResult<()> {
        self.global.unlock_object(txn, self.db, object)
    }

    pub fn lock_schema(
        &self,
        txn: TransactionId,
        object: ObjectId,
        mode: SchemaLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.global.lock_schema(txn, self.db, object, mode, timeout)
    }

    pub fn unlock_schema(&self, txn: TransactionId, object: ObjectId) -> LockResult<()> {
        self.global.unlock_schema(txn, self.db, object)
    }

    pub fn lock_data(
        &self,
        txn: TransactionId,
        object: ObjectId,
        page: LogicalPageId,
        mode: DataLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.global
            .lock_data(txn, self.db, object, page, mode, timeout)
    }

    pub fn unlock_data(
        &self,
        txn: TransactionId,
        object: ObjectId,
        page: LogicalPageId,
    ) -> LockResult<()> {
        self.global.unlock_data(txn, self.db, object, page)
    }

    pub fn lock_extent(
        &self,
        txn: TransactionId,
        virtual_page: VirtualPageId,
        extent: ExtentIndex,
        mode: DataLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.global
            .lock_extent(txn, self.db, virtual_page, extent, mode, timeout)
    }

    pub fn unlock_extent(
        &self,
        txn: TransactionId,
        virtual_page: VirtualPageId,
        extent: ExtentIndex,
    ) -> LockResult<()> {
        self.global.unlock_extent(txn, self.db, virtual_page, extent)
    }

    /// Latch an index page or distribution header for reading.
    pub fn latch_shared(&self, page: VirtualPageId, timeout: Duration) -> LockResult<()> {
        self.global.latches().latch_shared(page, timeout)
    }

    /// Latch an index page or distribution header for writing.
    pub fn latch_exclusive(&self, page: VirtualPageId, timeout: Duration) -> LockResult<()> {
        self.global.latches().latch_exclusive(page, timeout)
    }

    pub fn unlatch_shared(&self, page: VirtualPageId) -> LockResult<()> {
        self.global.latches().unlatch_shared(page)
    }

    pub fn unlatch_exclusive(&self, page: VirtualPageId) -> LockResult<()> {
        self.global.latches().unlatch_exclusive(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn facade_forwards_to_the_global_manager() {
        let global = Arc::new(GlobalLockManager::default());
        let db = DatabaseLockManager::new(Arc::clone(&global), 3);

        db.lock_object(1, 7, ObjectLockMode::IntentShared, LONG)
            .unwrap();
        let via_global = global.object_lock(3, 7);
        assert!(via_global.holds_at_least(1, ObjectLockMode::IntentShared));
        drop(via_global);

        db.unlock_object(1, 7).unwrap();
        assert_eq!(global.live_object_locks(), 0);
    }

    #[test]
    fn facades_for_different_databases_do_not_alias() {
        let global = Arc::new(GlobalLockManager::default());
        let db3 = DatabaseLockManager::new(Arc::clone(&global), 3);
        let db4 = DatabaseLockManager::new(Arc::clone(&global), 4);

        let a = db3.object_lock(7);
        let b = db4.object_lock(7);
        assert!(!a.same_resource(&b));
    }
}
