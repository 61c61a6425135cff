//! In-memory counter store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use crate::ratelimit::{CounterStore, StoreError, Ttl};

#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    value: u64,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A counter store held in process memory.
///
/// Expiry is measured with `tokio::time::Instant`, so tests running on a
/// paused runtime can advance through windows instantly.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, CounterEntry>,
    offline: AtomicBool,
    reject_writes: AtomicBool,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every operation fails while offline.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Simulate a degraded store that serves reads but fails writes.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.counters.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every counter.
    pub fn clear(&self) {
        self.counters.clear();
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<(), StoreError> {
        self.ensure_online()?;
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store rejects writes".to_string()));
        }
        Ok(())
    }

    /// Read an entry, evicting it first if it has expired.
    fn live_entry(&self, key: &str) -> Option<CounterEntry> {
        let now = Instant::now();
        self.counters.remove_if(key, |_, entry| entry.is_expired(now));
        self.counters.get(key).map(|entry| *entry)
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.ensure_online()?;
        Ok(self.live_entry(key).map(|entry| entry.value))
    }

    async fn set(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.counters.insert(
            key.to_string(),
            CounterEntry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_expiry(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_writable()?;
        self.counters.insert(
            key.to_string(),
            CounterEntry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_preserving_expiry(&self, key: &str, value: u64, window: Duration) -> Result<(), StoreError> {
        self.ensure_writable()?;
        let now = Instant::now();
        let fresh = Some(now + window);
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.expires_at.is_none() || entry.is_expired(now) {
                    entry.expires_at = fresh;
                }
                entry.value = value;
            }
            Entry::Vacant(vacant) => {
                vacant.insert(CounterEntry {
                    value,
                    expires_at: fresh,
                });
            }
        }
        Ok(())
    }

    async fn decrement(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_writable()?;
        let now = Instant::now();
        match self.counters.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.remove();
                    return Ok(0);
                }
                let entry = occupied.get_mut();
                entry.value = entry.value.saturating_sub(1);
                Ok(entry.value)
            }
            Entry::Vacant(_) => Ok(0),
        }
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Ttl, StoreError> {
        self.ensure_online()?;
        let now = Instant::now();
        Ok(match self.live_entry(key) {
            None => Ttl::Absent,
            Some(CounterEntry { expires_at: None, .. }) => Ttl::Persistent,
            Some(CounterEntry {
                expires_at: Some(at), ..
            }) => Ttl::Expires(at.saturating_duration_since(now)),
        })
    }
}
