use std::sync::Arc;
use std::time::Duration;

use burrow_lock::{
    DataLockMode, GlobalLockManager, ObjectLockMode, OwnerBlockConfig, OwnerScope,
    TransactionLockOwnerBlock,
};
use serial_test::serial;

const LONG: Duration = Duration::from_secs(5);

fn locks_with_threshold(
    manager: &Arc<GlobalLockManager>,
    txn: u32,
    max_item_locks: usize,
) -> TransactionLockOwnerBlock {
    TransactionLockOwnerBlock::with_config(
        Arc::clone(manager),
        txn,
        OwnerBlockConfig { max_item_locks },
    )
}

#[test]
fn threshold_crossing_collapses_to_one_owner_lock() {
    let manager = Arc::new(GlobalLockManager::default());
    let locks = locks_with_threshold(&manager, 1, 10);

    // Eleven distinct pages under one object: one more than the threshold.
    for page in 0..11u64 {
        locks
            .lock_page(1, 5, page, DataLockMode::Shared, LONG)
            .unwrap();
    }

    let scope = OwnerScope::Object {
        database: 1,
        object: 5,
    };
    locks.with_owner_block(scope, |block| {
        assert_eq!(block.owner_mode(), ObjectLockMode::Shared);
        assert_eq!(block.tracked_items(), 0);
        assert_eq!(block.owner_count(), 11);
    });
    // Every individual page lock is gone from the registry.
    assert_eq!(manager.live_data_locks(), 0);

    // Unlocking an escalated key still decrements the counter.
    assert!(locks.unlock_page(1, 5, 7).unwrap());
    locks.with_owner_block(scope, |block| assert_eq!(block.owner_count(), 10));

    locks.release_all();
    drop(locks);
    assert_eq!(manager.live_object_locks(), 0);
    assert_eq!(manager.live_database_locks(), 0);
}

#[test]
fn owner_lock_is_eventually_released_once_counter_drains() {
    let manager = Arc::new(GlobalLockManager::default());
    let locks = locks_with_threshold(&manager, 1, 100);
    let scope = OwnerScope::Object {
        database: 1,
        object: 5,
    };

    locks
        .lock_page(1, 5, 10, DataLockMode::Shared, LONG)
        .unwrap();
    locks
        .lock_page(1, 5, 11, DataLockMode::Shared, LONG)
        .unwrap();

    // With items outstanding the owner unlock is deferred.
    locks.unlock_owner(scope).unwrap();
    locks.with_owner_block(scope, |block| {
        assert_eq!(block.owner_mode(), ObjectLockMode::IntentShared);
    });

    assert!(locks.unlock_page(1, 5, 10).unwrap());
    assert!(locks.unlock_page(1, 5, 11).unwrap());

    // Counter drained: the same call now releases the owner lock.
    locks.unlock_owner(scope).unwrap();
    locks.with_owner_block(scope, |block| {
        assert_eq!(block.owner_mode(), ObjectLockMode::None);
    });
    drop(locks);
    assert_eq!(manager.live_object_locks(), 0);
}

#[test]
#[serial]
fn escalation_contention_degrades_gracefully() {
    let manager = Arc::new(GlobalLockManager::default());

    // T2 holds IntentExclusive on the owner, blocking a full Shared lock.
    let other = locks_with_threshold(&manager, 2, 100);
    other
        .lock_page(1, 5, 999, DataLockMode::Exclusive, LONG)
        .unwrap();

    let locks = locks_with_threshold(&manager, 1, 2);
    for page in 0..3u64 {
        locks
            .lock_page(1, 5, page, DataLockMode::Shared, Duration::from_millis(100))
            .unwrap();
    }
    let scope = OwnerScope::Object {
        database: 1,
        object: 5,
    };
    // Escalation was attempted and swallowed; item locks remain tracked.
    locks.with_owner_block(scope, |block| {
        assert_eq!(block.owner_mode(), ObjectLockMode::IntentShared);
        assert_eq!(block.tracked_items(), 3);
    });

    locks.release_all();
    other.release_all();
    drop(locks);
    drop(other);
    assert_eq!(manager.live_data_locks(), 0);
    assert_eq!(manager.live_object_locks(), 0);
}

#[test]
fn extent_locks_escalate_under_their_distribution_owner() {
    let manager = Arc::new(GlobalLockManager::default());
    let locks = locks_with_threshold(&manager, 1, 4);

    for extent in 0..5u32 {
        locks
            .lock_extent(1, 900, extent, DataLockMode::Update, LONG)
            .unwrap();
    }
    let scope = OwnerScope::Distribution {
        database: 1,
        virtual_page: 900,
    };
    locks.with_owner_block(scope, |block| {
        assert_eq!(block.owner_mode(), ObjectLockMode::Exclusive);
        assert_eq!(block.tracked_items(), 0);
        assert_eq!(block.owner_count(), 5);
    });
    assert_eq!(manager.live_data_locks(), 0);

    locks.release_all();
    drop(locks);
    assert_eq!(manager.live_object_locks(), 0);
}
