//! Multi-granularity hierarchical lock manager for the burrow storage
//! engine.
//!
//! Locks form a hierarchy (database → file-group root / object → schema /
//! data page, distribution owner → extent) built from reference-counted
//! resources resolved through per-granularity registries. Per-transaction
//! [`owner::LockOwnerBlock`]s maintain intent locks and escalate item locks
//! to a covering owner lock once a threshold is crossed, bounding lock
//! table growth. Deadlocks are broken by acquire timeouts only; there is no
//! wait-for graph.

pub mod database;
pub mod error;
pub mod handler;
pub mod manager;
pub mod mode;
pub mod owner;
pub mod rlatch;
pub mod state;
pub mod txn_locks;

pub use database::DatabaseLockManager;
pub use error::{LockError, LockResult};
pub use handler::{
    DataLockRef, DatabaseLockRef, LockHandler, LockRef, ObjectLockRef, ParentHandle, RootLockRef,
    SchemaLockRef,
};
pub use manager::{GlobalLockManager, LockManagerConfig};
pub use mode::{
    DataLockMode, DatabaseLockMode, LockMode, ObjectLockMode, RootLockMode, SchemaLockMode,
};
pub use owner::{LockOwnerBlock, OwnerBlockConfig, OwnerScope};
pub use rlatch::ResourceLatchManager;
pub use state::ResourceLockState;
pub use txn_locks::TransactionLockOwnerBlock;
