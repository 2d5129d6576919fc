//! Keyed mutual exclusion.
//!
//! Two implementations behind one trait:
//!
//! - [`LocalLock`]: in-process keyed mutex. No cross-process effect.
//! - [`StoreLock`]: cross-process lock over a [`SharedStore`] using
//!   set-if-absent with a TTL safety net. The store offers no blocking
//!   wait, so acquisition polls with an exponentially doubling delay.
//!
//! Contention is never surfaced as an error, only as elapsed latency.

use crate::store::SharedStoreRef;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// TTL on distributed lock slots; reclaims locks from crashed holders.
const LOCK_TTL: Duration = Duration::from_secs(5 * 60);
/// First poll delay on contention.
const INITIAL_POLL_DELAY: Duration = Duration::from_millis(1);
/// Poll delay cap.
const MAX_POLL_DELAY: Duration = Duration::from_secs(1);

/// Keyed mutual exclusion.
#[async_trait]
pub trait KeyedLock: Send + Sync {
    /// Block until the lock for `key` is held, then return its guard.
    async fn acquire(&self, key: &str) -> Result<LockGuard>;
}

/// An acquired lock. Released exactly once: explicitly via
/// [`release`](LockGuard::release), or on drop.
#[must_use = "dropping the guard releases the lock"]
pub struct LockGuard {
    inner: GuardInner,
}

enum GuardInner {
    Local(#[allow(dead_code)] tokio::sync::OwnedMutexGuard<()>),
    Store {
        store: SharedStoreRef,
        key: String,
        owner: u64,
        released: bool,
    },
}

impl LockGuard {
    /// Release the lock, waiting for the store write to land.
    ///
    /// For store-backed locks the slot is deleted only if it still holds
    /// this guard's owner id, so a release after TTL expiry and
    /// re-acquisition by another owner is a no-op.
    pub async fn release(mut self) -> Result<()> {
        if let GuardInner::Store {
            store,
            key,
            owner,
            released,
        } = &mut self.inner
        {
            *released = true;
            let removed = store.del_if_eq(key, *owner).await?;
            if !removed {
                debug!(key, "lock slot already expired or taken over");
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let GuardInner::Store {
            store,
            key,
            owner,
            released,
        } = &mut self.inner
        {
            if *released {
                return;
            }
            // Fire-and-forget: a late or lost release is harmless, the
            // owner-id check and the TTL both cover it.
            let store = store.clone();
            let key = std::mem::take(key);
            let owner = *owner;
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move {
                        if let Err(e) = store.del_if_eq(&key, owner).await {
                            warn!(key, error = %e, "failed to release lock slot");
                        }
                    });
                }
                Err(_) => warn!(key, "lock guard dropped outside a runtime; slot left to TTL"),
            }
        }
    }
}

// ============================================================================
// In-process lock
// ============================================================================

/// In-process keyed mutex.
#[derive(Default)]
pub struct LocalLock {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyedLock for LocalLock {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let slot = {
            let mut slots = self.slots.lock();
            slots.entry(key.to_string()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        Ok(LockGuard {
            inner: GuardInner::Local(guard),
        })
    }
}

// ============================================================================
// Store-backed lock
// ============================================================================

/// Cross-process lock polling a [`SharedStore`] slot keyed `lock:<key>`.
///
/// The slot value is this process's owner identity, so only the process
/// that took the lock can clear it.
pub struct StoreLock {
    store: SharedStoreRef,
    owner: u64,
    ttl: Duration,
}

impl StoreLock {
    pub fn new(store: SharedStoreRef, owner: u64) -> Self {
        Self {
            store,
            owner,
            ttl: LOCK_TTL,
        }
    }

    /// Override the slot TTL (tests, short-lived critical sections).
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl KeyedLock for StoreLock {
    async fn acquire(&self, key: &str) -> Result<LockGuard> {
        let key = format!("lock:{key}");
        let mut delay = INITIAL_POLL_DELAY;

        while !self.store.set_nx(&key, self.owner, self.ttl).await? {
            sleep(delay).await;
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }

        Ok(LockGuard {
            inner: GuardInner::Store {
                store: self.store.clone(),
                key,
                owner: self.owner,
                released: false,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn assert_exclusive(lock: Arc<dyn KeyedLock>) {
        let holders = Arc::new(AtomicUsize::new(0));
        let max_holders = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            let holders = holders.clone();
            let max_holders = max_holders.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    let guard = lock.acquire("k").await.unwrap();
                    let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                    max_holders.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_micros(200)).await;
                    holders.fetch_sub(1, Ordering::SeqCst);
                    guard.release().await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(max_holders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn local_lock_is_exclusive() {
        assert_exclusive(Arc::new(LocalLock::new())).await;
    }

    #[tokio::test]
    async fn local_lock_keys_are_independent() {
        let lock = LocalLock::new();
        let _a = lock.acquire("a").await.unwrap();
        // Must not block on a different key.
        let b = tokio::time::timeout(Duration::from_secs(1), lock.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn store_lock_is_exclusive() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        assert_exclusive(Arc::new(StoreLock::new(store, 1))).await;
    }

    #[tokio::test]
    async fn store_lock_contenders_share_the_store() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let a = StoreLock::new(store.clone(), 1);
        let b = StoreLock::new(store.clone(), 2);

        let guard = a.acquire("k").await.unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), b.acquire("k")).await;
        assert!(blocked.is_err(), "second owner must poll, not acquire");

        guard.release().await.unwrap();
        let guard_b = tokio::time::timeout(Duration::from_secs(5), b.acquire("k"))
            .await
            .expect("acquire after release")
            .unwrap();
        guard_b.release().await.unwrap();
    }

    #[tokio::test]
    async fn stale_release_does_not_clobber_new_owner() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let a = StoreLock::new(store.clone(), 1).with_ttl(Duration::from_millis(20));
        let b = StoreLock::new(store.clone(), 2);

        let stale = a.acquire("k").await.unwrap();

        // TTL expires while owner 1 still thinks it holds the lock; owner 2
        // legitimately re-acquires the slot.
        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = b.acquire("k").await.unwrap();

        // Owner 1's release must not remove owner 2's slot.
        stale.release().await.unwrap();
        assert_eq!(store.get_u64("lock:k").await.unwrap(), Some(2));

        fresh.release().await.unwrap();
        assert_eq!(store.get_u64("lock:k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn dropped_guard_eventually_releases() {
        let store: SharedStoreRef = Arc::new(MemoryStore::new());
        let lock = StoreLock::new(store.clone(), 1);

        drop(lock.acquire("k").await.unwrap());

        // Release happens on a spawned task; poll for it.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while store.get_u64("lock:k").await.unwrap().is_some() {
            assert!(tokio::time::Instant::now() < deadline, "slot never released");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
