//! In-memory multi-key lock with leases.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ratelimit::{DistributedLock, LockError, LockHandle};

/// Acquisition behaviour for [`MemoryLock`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// How long to keep retrying before giving up, in milliseconds
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Base delay between attempts, in milliseconds
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Upper bound of random delay added to each retry, in milliseconds
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: default_acquire_timeout_ms(),
            retry_interval_ms: default_retry_interval_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

fn default_acquire_timeout_ms() -> u64 {
    2000
}

fn default_retry_interval_ms() -> u64 {
    10
}

fn default_retry_jitter_ms() -> u64 {
    5
}

#[derive(Debug, Clone, Copy)]
struct Holder {
    token: Uuid,
    expires_at: Instant,
}

/// A lock table held in process memory.
///
/// Acquisition is all-or-nothing across the requested keys. Each key is
/// leased: once `expires_at` passes, the key is free again even if its
/// holder never released it.
#[derive(Debug, Default)]
pub struct MemoryLock {
    holders: Mutex<HashMap<String, Holder>>,
    config: LockConfig,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LockConfig) -> Self {
        Self {
            holders: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Number of keys currently held under an unexpired lease.
    pub fn held_keys(&self) -> usize {
        let now = Instant::now();
        self.holders.lock().values().filter(|h| h.expires_at > now).count()
    }

    fn try_acquire(&self, keys: &[String], lease: Duration) -> Option<LockHandle> {
        let now = Instant::now();
        let mut holders = self.holders.lock();

        let busy = keys
            .iter()
            .any(|key| holders.get(key).is_some_and(|h| h.expires_at > now));
        if busy {
            return None;
        }

        let handle = LockHandle::new(keys.to_vec(), lease);
        let holder = Holder {
            token: handle.token,
            expires_at: now + lease,
        };
        for key in keys {
            holders.insert(key.clone(), holder);
        }
        Some(handle)
    }

    fn retry_delay(&self) -> Duration {
        let jitter = if self.config.retry_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.retry_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(self.config.retry_interval_ms + jitter)
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, keys: &[String], lease: Duration) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let timeout = Duration::from_millis(self.config.acquire_timeout_ms);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if let Some(handle) = self.try_acquire(keys, lease) {
                trace!(token = %handle.token, keys = keys.len(), attempts = attempts, "Lock acquired");
                return Ok(handle);
            }

            let waited = started.elapsed();
            if waited >= timeout {
                debug!(keys = keys.len(), attempts = attempts, "Lock acquisition timed out");
                return Err(LockError::Timeout {
                    keys: keys.len(),
                    waited,
                });
            }

            let delay = self.retry_delay().min(timeout - waited);
            tokio::time::sleep(delay).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let mut holders = self.holders.lock();
        for key in &handle.keys {
            if holders.get(key).is_some_and(|h| h.token == handle.token) {
                holders.remove(key);
            }
        }
        trace!(token = %handle.token, "Lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn fast_config() -> LockConfig {
        LockConfig {
            acquire_timeout_ms: 50,
            retry_interval_ms: 5,
            retry_jitter_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let lock = MemoryLock::new();
        let handle = lock.acquire(&keys(&["a", "b"]), Duration::from_secs(5)).await.unwrap();
        assert_eq!(lock.held_keys(), 2);

        lock.release(handle).await.unwrap();
        assert_eq!(lock.held_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_keys_time_out() {
        let lock = MemoryLock::with_config(fast_config());
        let _held = lock.acquire(&keys(&["a", "b"]), Duration::from_secs(5)).await.unwrap();

        let err = lock.acquire(&keys(&["b", "c"]), Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, LockError::Timeout { keys: 2, .. }));

        // Acquisition is all-or-nothing: "c" was not taken.
        assert_eq!(lock.held_keys(), 2);
    }

    #[tokio::test]
    async fn test_disjoint_keys_do_not_contend() {
        let lock = MemoryLock::with_config(fast_config());
        let _a = lock.acquire(&keys(&["a"]), Duration::from_secs(5)).await.unwrap();
        let _b = lock.acquire(&keys(&["b"]), Duration::from_secs(5)).await.unwrap();
        assert_eq!(lock.held_keys(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_frees_keys() {
        let lock = MemoryLock::with_config(fast_config());
        let stale = lock.acquire(&keys(&["a"]), Duration::from_millis(100)).await.unwrap();

        tokio::time::advance(Duration::from_millis(150)).await;
        let fresh = lock.acquire(&keys(&["a"]), Duration::from_secs(5)).await.unwrap();

        // A stale holder cannot release the new holder's lease.
        lock.release(stale).await.unwrap();
        assert_eq!(lock.held_keys(), 1);

        lock.release(fresh).await.unwrap();
        assert_eq!(lock.held_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_acquires_after_release() {
        let lock = Arc::new(MemoryLock::new());
        let held = lock.acquire(&keys(&["a"]), Duration::from_secs(5)).await.unwrap();

        let waiter = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.acquire(&keys(&["a"]), Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        lock.release(held).await.unwrap();

        let handle = waiter.await.unwrap().unwrap();
        assert_eq!(handle.keys, keys(&["a"]));
    }
}
