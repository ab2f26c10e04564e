//! Engine-wide lock manager.
//!
//! The [`GlobalLockManager`] owns one [`LockHandler`] per granularity level
//! plus the resource-latch registry, and is the only place that builds
//! composite resource keys and wires parent links. Every key embeds the
//! full ancestor id chain so two different parents can never alias to the
//! same child resource.

use std::sync::Arc;
use std::time::Duration;

use burrow_common::types::{
    DatabaseId, ExtentIndex, FileGroupId, LogicalPageId, ObjectId, TransactionId, VirtualPageId,
};

use crate::error::LockResult;
use crate::handler::{
    DEFAULT_FREE_POOL_CAPACITY, DataLockRef, DatabaseLockRef, LockHandler, ObjectLockRef,
    ParentHandle, RootLockRef, SchemaLockRef,
};
use crate::mode::{DataLockMode, DatabaseLockMode, ObjectLockMode, RootLockMode, SchemaLockMode};
use crate::rlatch::ResourceLatchManager;

/// Tunables for the lock registries.
#[derive(Debug, Clone, Copy)]
pub struct LockManagerConfig {
    /// Retired registry slots kept for reuse, per granularity.
    pub free_pool_capacity: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            free_pool_capacity: DEFAULT_FREE_POOL_CAPACITY,
        }
    }
}

/// Deterministic composite keys, one prefix per granularity. Fixed-width
/// hex keeps keys totally ordered within a level.
mod keys {
    use super::*;

    pub fn database(db: DatabaseId) -> String {
        format!("DBL:{db:04X}")
    }

    pub fn root(db: DatabaseId, file_group: FileGroupId) -> String {
        format!("RTL:{db:04X}:{file_group:02X}")
    }

    pub fn object(db: DatabaseId, object: ObjectId) -> String {
        format!("OBL:{db:04X}:{object:08X}")
    }

    pub fn distribution_owner(db: DatabaseId, virtual_page: VirtualPageId) -> String {
        format!("DST:{db:04X}:{virtual_page:016X}")
    }

    pub fn schema(db: DatabaseId, object: ObjectId) -> String {
        format!("SCL:{db:04X}:{object:08X}")
    }

    pub fn data(db: DatabaseId, object: ObjectId, page: LogicalPageId) -> String {
        format!("DTL:{db:04X}:{object:08X}:{page:016X}")
    }

    pub fn extent(db: DatabaseId, virtual_page: VirtualPageId, extent: ExtentIndex) -> String {
        format!("EXT:{db:04X}:{virtual_page:016X}:{extent:08X}")
    }
}

/// Owns the per-granularity registries and resolves the lock hierarchy.
pub struct GlobalLockManager {
    databases: Arc<LockHandler<DatabaseLockMode>>,
    roots: Arc<LockHandler<RootLockMode>>,
    objects: Arc<LockHandler<ObjectLockMode>>,
    schemas: Arc<LockHandler<SchemaLockMode>>,
    data: Arc<LockHandler<DataLockMode>>,
    latches: ResourceLatchManager,
}

impl Default for GlobalLockManager {
    fn default() -> Self {
        Self::new(LockManagerConfig::default())
    }
}

impl GlobalLockManager {
    pub fn new(config: LockManagerConfig) -> Self {
        let capacity = config.free_pool_capacity;
        Self {
            databases: LockHandler::new("database", capacity),
            roots: LockHandler::new("root", capacity),
            objects: LockHandler::new("object", capacity),
            schemas: LockHandler::new("schema", capacity),
            data: LockHandler::new("data", capacity),
            latches: ResourceLatchManager::new(),
        }
    }

    // ---- Resolution ----

    /// Resolve the database-level lock for `db`.
    pub fn database_lock(&self, db: DatabaseId) -> DatabaseLockRef {
        self.databases.get_or_create(&keys::database(db))
    }

    /// Resolve the file-group root lock, wiring its database parent.
    pub fn root_lock(&self, db: DatabaseId, file_group: FileGroupId) -> RootLockRef {
        let root = self.roots.get_or_create(&keys::root(db, file_group));
        if !root.has_parent() {
            root.set_parent(ParentHandle::Database(self.database_lock(db)));
        }
        root
    }

    /// Resolve the object lock, wiring its database parent.
    pub fn object_lock(&self, db: DatabaseId, object: ObjectId) -> ObjectLockRef {
        let lock = self.objects.get_or_create(&keys::object(db, object));
        if !lock.has_parent() {
            lock.set_parent(ParentHandle::Database(self.database_lock(db)));
        }
        lock
    }

    /// Resolve the owner lock that covers one distribution page's extents,
    /// wiring its database parent.
    pub fn distribution_owner_lock(
        &self,
        db: DatabaseId,
        virtual_page: VirtualPageId,
    ) -> ObjectLockRef {
        let lock = self
            .objects
            .get_or_create(&keys::distribution_owner(db, virtual_page));
        if !lock.has_parent() {
            lock.set_parent(ParentHandle::Database(self.database_lock(db)));
        }
        lock
    }

    /// Resolve the schema lock for `object`, wiring its object parent.
    pub fn schema_lock(&self, db: DatabaseId, object: ObjectId) -> SchemaLockRef {
        let lock = self.schemas.get_or_create(&keys::schema(db, object));
        if !lock.has_parent() {
            lock.set_parent(ParentHandle::Object(self.object_lock(db, object)));
        }
        lock
    }

    /// Resolve the data-page lock, wiring its object parent.
    pub fn data_lock(&self, db: DatabaseId, object: ObjectId, page: LogicalPageId) -> DataLockRef {
        let lock = self.data.get_or_create(&keys::data(db, object, page));
        if !lock.has_parent() {
            lock.set_parent(ParentHandle::Object(self.object_lock(db, object)));
        }
        lock
    }

    /// Resolve a distribution extent lock, wiring its distribution-owner
    /// parent.
    pub fn extent_lock(
        &self,
        db: DatabaseId,
        virtual_page: VirtualPageId,
        extent: ExtentIndex,
    ) -> DataLockRef {
        let lock = self
            .data
            .get_or_create(&keys::extent(db, virtual_page, extent));
        if !lock.has_parent() {
            lock.set_parent(ParentHandle::Object(
                self.distribution_owner_lock(db, virtual_page),
            ));
        }
        lock
    }

    // ---- High-level lock/unlock helpers ----
    //
    // Each helper resolves the resource, performs the operation, and lets
    // the handle drop release the resolution reference on every path.

    pub fn lock_database(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        mode: DatabaseLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.database_lock(db).lock(txn, mode, timeout)
    }

    pub fn unlock_database(&self, txn: TransactionId, db: DatabaseId) -> LockResult<()> {
        self.database_lock(db).unlock(txn, DatabaseLockMode::None)
    }

    pub fn lock_root(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        file_group: FileGroupId,
        mode: RootLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.root_lock(db, file_group).lock(txn, mode, timeout)
    }

    pub fn unlock_root(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        file_group: FileGroupId,
    ) -> LockResult<()> {
        self.root_lock(db, file_group)
            .unlock(txn, RootLockMode::None)
    }

    pub fn lock_object(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        object: ObjectId,
        mode: ObjectLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.object_lock(db, object).lock(txn, mode, timeout)
    }

    pub fn unlock_object(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        object: ObjectId,
    ) -> LockResult<()> {
        self.object_lock(db, object)
            .unlock(txn, ObjectLockMode::None)
    }

    pub fn lock_schema(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        object: ObjectId,
        mode: SchemaLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.schema_lock(db, object).lock(txn, mode, timeout)
    }

    pub fn unlock_schema(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        object: ObjectId,
    ) -> LockResult<()> {
        self.schema_lock(db, object)
            .unlock(txn, SchemaLockMode::None)
    }

    pub fn lock_data(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        object: ObjectId,
        page: LogicalPageId,
        mode: DataLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.data_lock(db, object, page).lock(txn, mode, timeout)
    }

    pub fn unlock_data(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        object: ObjectId,
        page: LogicalPageId,
    ) -> LockResult<()> {
        self.data_lock(db, object, page)
            .unlock(txn, DataLockMode::None)
    }

    pub fn lock_extent(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        virtual_page: VirtualPageId,
        extent: ExtentIndex,
        mode: DataLockMode,
        timeout: Duration,
    ) -> LockResult<()> {
        self.extent_lock(db, virtual_page, extent)
            .lock(txn, mode, timeout)
    }

    pub fn unlock_extent(
        &self,
        txn: TransactionId,
        db: DatabaseId,
        virtual_page: VirtualPageId,
        extent: ExtentIndex,
    ) -> LockResult<()> {
        self.extent_lock(db, virtual_page, extent)
            .unlock(txn, DataLockMode::None)
    }

    /// Timeout-bounded latches for index pages and distribution headers;
    /// not part of the transaction lock hierarchy.
    pub fn latches(&self) -> &ResourceLatchManager {
        &self.latches
    }

    // ---- Diagnostics ----

    pub fn live_database_locks(&self) -> usize {
        self.databases.active_len()
    }

    pub fn live_object_locks(&self) -> usize {
        self.objects.active_len()
    }

    pub fn live_data_locks(&self) -> usize {
        self.data.active_len()
    }
}
