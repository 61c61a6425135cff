//! Scoped lock and concurrency-slot ownership.
//!
//! Both guards release on every exit path. The normal path awaits the
//! release; if a guard is dropped while still holding its resource (job
//! panic, caller cancellation) the release is spawned onto the current
//! runtime instead.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::backend::{CounterStore, DistributedLock, LockError, LockHandle};
use crate::error::{JobgateError, Result};

/// A held lock that is released exactly once.
pub struct HeldLock {
    lock: Arc<dyn DistributedLock>,
    handle: Option<LockHandle>,
}

impl HeldLock {
    /// Acquire the lock over `keys` for at most `lease`.
    pub async fn acquire(
        lock: Arc<dyn DistributedLock>,
        keys: &[String],
        lease: Duration,
    ) -> std::result::Result<Self, LockError> {
        let handle = lock.acquire(keys, lease).await?;
        Ok(Self {
            lock,
            handle: Some(handle),
        })
    }

    /// Release the lock now.
    pub async fn release(mut self) -> std::result::Result<(), LockError> {
        let Some(handle) = self.handle.clone() else {
            return Ok(());
        };
        let result = self.lock.release(handle).await;
        self.handle = None;
        result
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else { return };
        let lock = self.lock.clone();
        spawn_cleanup("lock release", async move {
            lock.release(handle).await.map_err(JobgateError::from)
        });
    }
}

/// Lease periods a slot release keeps retrying the lock before it falls
/// back to decrementing without it.
const RELEASE_LEASE_PERIODS: u32 = 3;
/// First pause between release lock attempts; doubles up to one lease.
const RELEASE_BACKOFF_MIN: Duration = Duration::from_millis(10);

/// Concurrency slots taken by an admitted call.
///
/// Armed before the increments are written, so once created the slots are
/// given back whether the job succeeds, fails, panics or is cancelled.
/// Keys whose increment never landed are dropped with [`SlotRelease::forget`].
///
/// A guard dropped while its runtime is shutting down has nowhere to spawn
/// the release: its slots stay counted and only an error log records it.
pub struct SlotRelease {
    inner: Option<SlotReleaseTask>,
}

struct SlotReleaseTask {
    store: Arc<dyn CounterStore>,
    lock: Arc<dyn DistributedLock>,
    lock_keys: Vec<String>,
    slot_keys: Vec<String>,
    lease: Duration,
}

impl SlotRelease {
    pub fn new(
        store: Arc<dyn CounterStore>,
        lock: Arc<dyn DistributedLock>,
        lock_keys: Vec<String>,
        slot_keys: Vec<String>,
        lease: Duration,
    ) -> Self {
        Self {
            inner: Some(SlotReleaseTask {
                store,
                lock,
                lock_keys,
                slot_keys,
                lease,
            }),
        }
    }

    /// Slot counters this guard will decrement.
    pub fn slot_keys(&self) -> &[String] {
        self.inner.as_ref().map(|t| t.slot_keys.as_slice()).unwrap_or(&[])
    }

    /// Stop tracking a slot whose increment was never written.
    pub fn forget(&mut self, key: &str) {
        if let Some(task) = self.inner.as_mut() {
            task.slot_keys.retain(|k| k != key);
        }
    }

    /// Give the slots back and wait for it to finish.
    ///
    /// The release runs on its own task, so abandoning this future does not
    /// interrupt it.
    pub async fn release(mut self) -> Result<()> {
        let Some(task) = self.inner.take() else {
            return Ok(());
        };
        if task.slot_keys.is_empty() {
            return Ok(());
        }
        match tokio::spawn(task.run()).await {
            Ok(result) => result,
            Err(e) => Err(JobgateError::Lock(LockError::Unavailable(format!(
                "slot release task failed: {}",
                e
            )))),
        }
    }
}

impl Drop for SlotRelease {
    fn drop(&mut self) {
        match self.inner.take() {
            Some(task) if !task.slot_keys.is_empty() => {
                spawn_cleanup("concurrency slot release", task.run());
            }
            _ => {}
        }
    }
}

impl SlotReleaseTask {
    async fn run(self) -> Result<()> {
        let held = self.acquire_for_release().await;

        let mut first_error = None;
        for key in &self.slot_keys {
            match self.store.decrement(key).await {
                Ok(value) => debug!(key = %key, value = value, "Released concurrency slot"),
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to release concurrency slot");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(held) = held {
            if let Err(e) = held.release().await {
                warn!(error = %e, "Failed to release lock after slot release; lease expiry will free it");
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Keep retrying the lock with backoff for a few lease periods.
    ///
    /// Returns `None` once that runs out. Decrements are atomic per key, so
    /// the slots are still given back without the lock.
    async fn acquire_for_release(&self) -> Option<HeldLock> {
        let deadline = Instant::now() + self.lease * RELEASE_LEASE_PERIODS;
        let mut backoff = RELEASE_BACKOFF_MIN;
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            match HeldLock::acquire(self.lock.clone(), &self.lock_keys, self.lease).await {
                Ok(held) => return Some(held),
                Err(e) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            attempts = attempts,
                            error = %e,
                            "Releasing concurrency slots without the lock"
                        );
                        return None;
                    }
                    debug!(attempts = attempts, error = %e, "Retrying lock for slot release");
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff = (backoff * 2).min(self.lease.max(RELEASE_BACKOFF_MIN));
                }
            }
        }
    }
}

/// Run a cleanup future on the current runtime without waiting for it.
fn spawn_cleanup<F>(what: &'static str, cleanup: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            debug!(what = what, "Spawning deferred cleanup");
            runtime.spawn(async move {
                if let Err(e) = cleanup.await {
                    error!(what = what, error = %e, "Deferred cleanup failed");
                }
            });
        }
        Err(_) => {
            error!(what = what, "No runtime available for deferred cleanup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{LockConfig, MemoryCounterStore, MemoryLock};

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_held_lock_explicit_release() {
        let lock = Arc::new(MemoryLock::new());
        let held = HeldLock::acquire(lock.clone(), &keys(&["a"]), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(lock.held_keys(), 1);

        held.release().await.unwrap();
        assert_eq!(lock.held_keys(), 0);
    }

    #[tokio::test]
    async fn test_held_lock_released_on_drop() {
        let lock = Arc::new(MemoryLock::new());
        let held = HeldLock::acquire(lock.clone(), &keys(&["a"]), Duration::from_secs(5))
            .await
            .unwrap();
        drop(held);

        // The deferred release runs on the runtime; reacquiring waits for it.
        let again = lock.acquire(&keys(&["a"]), Duration::from_secs(5)).await.unwrap();
        lock.release(again).await.unwrap();
        assert_eq!(lock.held_keys(), 0);
    }

    #[tokio::test]
    async fn test_slot_release_decrements() {
        let store = Arc::new(MemoryCounterStore::new());
        let lock = Arc::new(MemoryLock::new());
        store.set("slot", 2).await.unwrap();

        let guard = SlotRelease::new(
            store.clone(),
            lock.clone(),
            keys(&["slot"]),
            keys(&["slot"]),
            Duration::from_secs(5),
        );
        assert_eq!(guard.slot_keys(), &["slot".to_string()]);

        guard.release().await.unwrap();
        assert_eq!(store.get("slot").await.unwrap(), Some(1));
        assert_eq!(lock.held_keys(), 0);
    }

    #[tokio::test]
    async fn test_slot_release_on_drop() {
        let store = Arc::new(MemoryCounterStore::new());
        let lock = Arc::new(MemoryLock::new());
        store.set("slot", 1).await.unwrap();

        drop(SlotRelease::new(
            store.clone(),
            lock.clone(),
            keys(&["slot"]),
            keys(&["slot"]),
            Duration::from_secs(5),
        ));

        for _ in 0..100 {
            if store.get("slot").await.unwrap() == Some(0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.get("slot").await.unwrap(), Some(0));
    }

    fn impatient_lock() -> Arc<MemoryLock> {
        Arc::new(MemoryLock::with_config(LockConfig {
            acquire_timeout_ms: 50,
            retry_interval_ms: 5,
            retry_jitter_ms: 0,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_release_outlasts_busy_lock() {
        let store = Arc::new(MemoryCounterStore::new());
        let lock = impatient_lock();
        store.set("slot", 1).await.unwrap();

        // Another holder keeps the key past the acquire timeout.
        let _other = lock.acquire(&keys(&["slot-lock"]), Duration::from_millis(400)).await.unwrap();

        let guard = SlotRelease::new(
            store.clone(),
            lock.clone(),
            keys(&["slot-lock"]),
            keys(&["slot"]),
            Duration::from_secs(1),
        );
        guard.release().await.unwrap();

        assert_eq!(store.get("slot").await.unwrap(), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_release_falls_back_without_lock() {
        let store = Arc::new(MemoryCounterStore::new());
        let lock = impatient_lock();
        store.set("slot", 1).await.unwrap();

        let _stuck = lock.acquire(&keys(&["slot-lock"]), Duration::from_secs(3600)).await.unwrap();

        let guard = SlotRelease::new(
            store.clone(),
            lock.clone(),
            keys(&["slot-lock"]),
            keys(&["slot"]),
            Duration::from_millis(200),
        );
        guard.release().await.unwrap();

        assert_eq!(store.get("slot").await.unwrap(), Some(0));
        assert_eq!(lock.held_keys(), 1);
    }

    #[tokio::test]
    async fn test_forgotten_slot_is_not_decremented() {
        let store = Arc::new(MemoryCounterStore::new());
        let lock = Arc::new(MemoryLock::new());
        store.set("kept", 1).await.unwrap();
        store.set("unwritten", 1).await.unwrap();

        let mut guard = SlotRelease::new(
            store.clone(),
            lock.clone(),
            keys(&["kept", "unwritten"]),
            keys(&["kept", "unwritten"]),
            Duration::from_secs(5),
        );
        guard.forget("unwritten");
        assert_eq!(guard.slot_keys(), &["kept".to_string()]);

        guard.release().await.unwrap();
        assert_eq!(store.get("kept").await.unwrap(), Some(0));
        assert_eq!(store.get("unwritten").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_empty_slot_release_skips_lock() {
        let store = Arc::new(MemoryCounterStore::new());
        let lock = impatient_lock();
        let _held = lock.acquire(&keys(&["a"]), Duration::from_secs(3600)).await.unwrap();

        let guard = SlotRelease::new(store, lock.clone(), keys(&["a"]), Vec::new(), Duration::from_secs(5));
        guard.release().await.unwrap();
        assert_eq!(lock.held_keys(), 1);
    }

    #[test]
    fn test_drop_without_runtime_keeps_slot() {
        let store = Arc::new(MemoryCounterStore::new());
        let lock = Arc::new(MemoryLock::new());

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(store.set("slot", 1)).unwrap();
        drop(runtime);

        // No runtime to spawn onto: the drop must not panic, and the slot stays.
        drop(SlotRelease::new(
            store.clone(),
            lock,
            keys(&["slot"]),
            keys(&["slot"]),
            Duration::from_secs(5),
        ));

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        assert_eq!(runtime.block_on(store.get("slot")).unwrap(), Some(1));
    }
}
