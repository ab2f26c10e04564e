//! Shared identifier types for the burrow storage engine.
//!
//! Every layer of the engine (lock manager, transaction protocol, page
//! buffer) agrees on the identifier widths defined here, so they live in
//! their own dependency-light crate.

pub mod generator;
pub mod types;

pub use generator::{
    IdSpaceExhausted, TransactionIdGenerator, global_transaction_id_generator,
    init_global_transaction_id_generator,
};
pub use types::{
    DatabaseId, ExtentIndex, FileGroupId, LogicalPageId, ObjectId, TransactionId, VirtualPageId,
};
