//! Keyed many-reader/single-writer latches.
//!
//! Index pages and distribution headers need short mutual exclusion but no
//! escalation and no place in the transaction lock hierarchy, so they use
//! these timeout-bounded latches instead of full lock resources. Latches
//! are keyed by virtual page id and evicted from the registry as soon as
//! they fall idle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use burrow_common::types::VirtualPageId;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::{LockError, LockResult};

#[derive(Default)]
struct LatchCore {
    readers: usize,
    writer: bool,
    waiters: usize,
    /// Set under the core mutex when the latch is removed from the
    /// registry; late arrivals that resolved the stale entry must retry.
    evicted: bool,
}

struct ResourceLatch {
    core: Mutex<LatchCore>,
    cond: Condvar,
}

impl ResourceLatch {
    fn new() -> Self {
        Self {
            core: Mutex::new(LatchCore::default()),
            cond: Condvar::new(),
        }
    }
}

/// Registry of per-page latches.
#[derive(Default)]
pub struct ResourceLatchManager {
    latches: DashMap<VirtualPageId, Arc<ResourceLatch>>,
}

impl ResourceLatchManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the shared side of the latch for `page`, blocking up to
    /// `timeout` while a writer holds it.
    pub fn latch_shared(&self, page: VirtualPageId, timeout: Duration) -> LockResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let latch = self.entry(page);
            let mut core = latch.core.lock();
            if core.evicted {
                continue;
            }
            core.waiters += 1;
            while core.writer {
                if latch.cond.wait_until(&mut core, deadline).timed_out() && core.writer {
                    core.waiters -= 1;
                    drop(core);
                    self.evict_if_idle(page);
                    return Err(LockError::Timeout(timeout));
                }
            }
            core.waiters -= 1;
            core.readers += 1;
            return Ok(());
        }
    }

    /// Take the exclusive side of the latch for `page`, blocking up to
    /// `timeout` while readers or a writer hold it.
    pub fn latch_exclusive(&self, page: VirtualPageId, timeout: Duration) -> LockResult<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let latch = self.entry(page);
            let mut core = latch.core.lock();
            if core.evicted {
                continue;
            }
            core.waiters += 1;
            while core.writer || core.readers > 0 {
                if latch.cond.wait_until(&mut core, deadline).timed_out()
                    && (core.writer || core.readers > 0)
                {
                    core.waiters -= 1;
                    drop(core);
                    self.evict_if_idle(page);
                    return Err(LockError::Timeout(timeout));
                }
            }
            core.waiters -= 1;
            core.writer = true;
            return Ok(());
        }
    }

    pub fn unlatch_shared(&self, page: VirtualPageId) -> LockResult<()> {
        let latch = self.lookup(page)?;
        {
            let mut core = latch.core.lock();
            if core.readers == 0 {
                return Err(LockError::Protocol(format!(
                    "shared latch on page {page} is not held"
                )));
            }
            core.readers -= 1;
            latch.cond.notify_all();
        }
        self.evict_if_idle(page);
        Ok(())
    }

    pub fn unlatch_exclusive(&self, page: VirtualPageId) -> LockResult<()> {
        let latch = self.lookup(page)?;
        {
            let mut core = latch.core.lock();
            if !core.writer {
                return Err(LockError::Protocol(format!(
                    "exclusive latch on page {page} is not held"
                )));
            }
            core.writer = false;
            latch.cond.notify_all();
        }
        self.evict_if_idle(page);
        Ok(())
    }

    /// Number of latches currently registered.
    pub fn len(&self) -> usize {
        self.latches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latches.is_empty()
    }

    fn entry(&self, page: VirtualPageId) -> Arc<ResourceLatch> {
        Arc::clone(
            self.latches
                .entry(page)
                .or_insert_with(|| Arc::new(ResourceLatch::new()))
                .value(),
        )
    }

    fn lookup(&self, page: VirtualPageId) -> LockResult<Arc<ResourceLatch>> {
        self.latches
            .get(&page)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LockError::Protocol(format!("latch on page {page} is not held")))
    }

    fn evict_if_idle(&self, page: VirtualPageId) {
        self.latches.remove_if(&page, |_, latch| {
            let mut core = latch.core.lock();
            let idle = core.readers == 0 && !core.writer && core.waiters == 0;
            if idle {
                core.evicted = true;
            }
            idle
        });
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const TICK: Duration = Duration::from_millis(100);
    const LONG: Duration = Duration::from_secs(5);

    #[test]
    fn readers_share_the_latch() {
        let latches = ResourceLatchManager::new();
        latches.latch_shared(10, LONG).unwrap();
        latches.latch_shared(10, LONG).unwrap();
        latches.unlatch_shared(10).unwrap();
        latches.unlatch_shared(10).unwrap();
        assert!(latches.is_empty());
    }

    #[test]
    fn writer_excludes_readers() {
        let latches = Arc::new(ResourceLatchManager::new());
        latches.latch_exclusive(10, LONG).unwrap();

        let contender = Arc::clone(&latches);
        let handle = thread::spawn(move || contender.latch_shared(10, TICK));
        assert!(matches!(
            handle.join().unwrap(),
            Err(LockError::Timeout(_))
        ));

        latches.unlatch_exclusive(10).unwrap();
        assert!(latches.is_empty());
    }

    #[test]
    fn writer_waits_for_readers_to_drain() {
        let latches = Arc::new(ResourceLatchManager::new());
        latches.latch_shared(10, LONG).unwrap();

        let writer = Arc::clone(&latches);
        let handle = thread::spawn(move || {
            writer.latch_exclusive(10, LONG).unwrap();
            writer.unlatch_exclusive(10).unwrap();
        });
        thread::sleep(Duration::from_millis(50));
        latches.unlatch_shared(10).unwrap();
        handle.join().unwrap();
        assert!(latches.is_empty());
    }

    #[test]
    fn unlatch_without_latch_is_protocol_error() {
        let latches = ResourceLatchManager::new();
        assert!(matches!(
            latches.unlatch_shared(42),
            Err(LockError::Protocol(_))
        ));
    }

    #[test]
    fn different_pages_do_not_contend() {
        let latches = ResourceLatchManager::new();
        latches.latch_exclusive(1, LONG).unwrap();
        latches.latch_exclusive(2, TICK).unwrap();
        latches.unlatch_exclusive(1).unwrap();
        latches.unlatch_exclusive(2).unwrap();
        assert!(latches.is_empty());
    }
}
