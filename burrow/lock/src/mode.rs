//! Lock modes for every granularity of the lock hierarchy.
//!
//! Each granularity level has its own mode enum. Declaration order is
//! significant: the derived [`Ord`] is the escalation order, so a request
//! for a mode with a lower ordinal than the one already held is a
//! downgrade. Compatibility is a symmetric matrix per enum.

use std::fmt;

/// Behavior shared by every per-granularity mode enum.
///
/// The lock state machine is generic over this trait; the per-level tables
/// below are the only place where locking policy is encoded.
pub trait LockMode: Copy + Eq + Ord + fmt::Debug + Send + Sync + 'static {
    /// The "unlocked" floor mode. Compatible with everything; releasing to
    /// this mode removes the transaction from the active holders.
    const NONE: Self;

    /// The exclusive-equivalent top mode for this granularity.
    const EXCLUSIVE: Self;

    /// Symmetric compatibility matrix: can `self` and `other` be granted to
    /// two different transactions at the same time?
    fn is_compatible_with(self, other: Self) -> bool;

    /// Whether a transaction that holds `self` as the sole holder may
    /// request the exclusive-equivalent mode as an in-place upgrade.
    fn can_enter_exclusive(self) -> bool;
}

/// Database-level lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DatabaseLockMode {
    None,
    Shared,
    Update,
    Exclusive,
}

/// File-group root lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum RootLockMode {
    None,
    Shared,
    Update,
    Exclusive,
}

/// Data-page and distribution-extent lock modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DataLockMode {
    None,
    Shared,
    Update,
    Exclusive,
}

/// Shared/Update/Exclusive levels all use the same tables: readers share,
/// a single updater may coexist with readers, writers exclude everyone.
/// `Shared` and `Update` may both convert to `Exclusive` in place when the
/// requester is the sole holder.
macro_rules! shared_update_exclusive_mode {
    ($name:ident) => {
        impl LockMode for $name {
            const NONE: Self = Self::None;
            const EXCLUSIVE: Self = Self::Exclusive;

            fn is_compatible_with(self, other: Self) -> bool {
                use $name::*;
                match (self, other) {
                    (None, _) | (_, None) => true,
                    (Shared, Shared) | (Shared, Update) | (Update, Shared) => true,
                    _ => false,
                }
            }

            fn can_enter_exclusive(self) -> bool {
                matches!(self, Self::Shared | Self::Update)
            }
        }
    };
}

shared_update_exclusive_mode!(DatabaseLockMode);
shared_update_exclusive_mode!(RootLockMode);
shared_update_exclusive_mode!(DataLockMode);

/// Object-level lock modes, including the intent modes that make conflicts
/// beneath an object detectable without visiting every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ObjectLockMode {
    None,
    IntentShared,
    Shared,
    IntentExclusive,
    SharedIntentExclusive,
    Exclusive,
}

impl LockMode for ObjectLockMode {
    const NONE: Self = Self::None;
    const EXCLUSIVE: Self = Self::Exclusive;

    fn is_compatible_with(self, other: Self) -> bool {
        use ObjectLockMode::*;
        match (self, other) {
            (None, _) | (_, None) => true,
            (IntentShared, Exclusive) | (Exclusive, IntentShared) => false,
            (IntentShared, _) | (_, IntentShared) => true,
            (Shared, Shared) => true,
            (IntentExclusive, IntentExclusive) => true,
            _ => false,
        }
    }

    fn can_enter_exclusive(self) -> bool {
        matches!(self, Self::IntentExclusive | Self::SharedIntentExclusive)
    }
}

/// Schema lock modes. `SchemaStability` is the read-side guarantee that the
/// schema will not change underneath a plan; `BulkUpdate` allows concurrent
/// bulk loads; `SchemaModification` excludes everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SchemaLockMode {
    None,
    SchemaStability,
    BulkUpdate,
    SchemaModification,
}

impl LockMode for SchemaLockMode {
    const NONE: Self = Self::None;
    const EXCLUSIVE: Self = Self::SchemaModification;

    fn is_compatible_with(self, other: Self) -> bool {
        use SchemaLockMode::*;
        match (self, other) {
            (None, _) | (_, None) => true,
            (SchemaModification, _) | (_, SchemaModification) => false,
            // SchemaStability/BulkUpdate coexist in any combination.
            _ => true,
        }
    }

    fn can_enter_exclusive(self) -> bool {
        matches!(self, Self::BulkUpdate)
    }
}
