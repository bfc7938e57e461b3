//! Keyed Locks
//!
//! Async mutual exclusion per string key (packet digest or destination
//! path). Entries are weak, so keys nobody holds are dropped from the map.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Prune dead entries once the registry grows past this many keys
const PRUNE_THRESHOLD: usize = 256;

/// Registry of per-key async mutexes
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: Arc<Mutex<HashMap<String, Weak<AsyncMutex<()>>>>>,
}

/// Held lock for one key; released on drop
#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl KeyGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until `key` is free and take it
    pub async fn lock(&self, key: &str) -> KeyGuard {
        let mutex = self.entry(key);
        KeyGuard {
            key: key.to_string(),
            _guard: mutex.lock_owned().await,
        }
    }

    /// Take `key` only if nobody holds it
    pub fn try_lock(&self, key: &str) -> Option<KeyGuard> {
        let mutex = self.entry(key);
        mutex.try_lock_owned().ok().map(|guard| KeyGuard {
            key: key.to_string(),
            _guard: guard,
        })
    }

    /// Number of keys currently tracked
    pub fn tracked(&self) -> usize {
        self.inner
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock();

        if let Some(existing) = map.get(key).and_then(Weak::upgrade) {
            return existing;
        }

        if map.len() >= PRUNE_THRESHOLD {
            map.retain(|_, weak| weak.strong_count() > 0);
        }

        let mutex = Arc::new(AsyncMutex::new(()));
        map.insert(key.to_string(), Arc::downgrade(&mutex));
        mutex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_excludes() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("abc").await;
        assert_eq!(guard.key(), "abc");

        assert!(locks.try_lock("abc").is_none());
        assert!(locks.try_lock("other").is_some());

        drop(guard);
        assert!(locks.try_lock("abc").is_some());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("k").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock("k").await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_released_keys_are_not_tracked() {
        let locks = KeyedLocks::new();
        {
            let _a = locks.lock("a").await;
            let _b = locks.lock("b").await;
            assert_eq!(locks.tracked(), 2);
        }
        assert_eq!(locks.tracked(), 0);
    }
}
