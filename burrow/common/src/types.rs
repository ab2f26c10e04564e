/// Internal identifier associated with a database (engine-wide unique).
pub type DatabaseId = u16;

/// Internal identifier associated with a file group within a database.
pub type FileGroupId = u8;

/// Internal identifier associated with an object (table, index) within a
/// database.
pub type ObjectId = u32;

/// Logical page number within an object.
pub type LogicalPageId = u64;

/// Virtual page number within a database; stable across file-group moves.
pub type VirtualPageId = u64;

/// Index of a distribution extent beneath a distribution page.
pub type ExtentIndex = u32;

/// Internal identifier associated with a transaction (engine-wide unique).
///
/// Transaction ids are assigned lazily, either by the log device or by the
/// global generator, and never reused within a process lifetime.
pub type TransactionId = u32;
