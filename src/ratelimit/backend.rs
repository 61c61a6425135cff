//! Contracts for the shared collaborators: the counter store and the
//! cross-process lock.
//!
//! Both are implemented outside the limiter. Any number of processes that
//! point at the same store and lock service share limits.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),
    #[error("Counter '{key}' holds a non-integer value: {value}")]
    InvalidValue { key: String, value: String },
}

/// Errors raised by a distributed lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} acquiring lock on {keys} keys")]
    Timeout { keys: usize, waited: Duration },
    #[error("Lock service unavailable: {0}")]
    Unavailable(String),
}

/// Remaining lifetime of a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// The counter does not exist
    Absent,
    /// The counter exists and never expires
    Persistent,
    /// The counter expires after this long
    Expires(Duration),
}

impl Ttl {
    /// Remaining time, with absent and persistent counters reported as zero.
    pub fn remaining(&self) -> Duration {
        match self {
            Ttl::Expires(d) => *d,
            Ttl::Absent | Ttl::Persistent => Duration::ZERO,
        }
    }
}

/// Single-key counter operations. Each call must be atomic for its key.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Read a counter; absent counters read as `None`.
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError>;

    /// Write a counter with no expiry.
    async fn set(&self, key: &str, value: u64) -> Result<(), StoreError>;

    /// Write a counter and start its expiry.
    async fn set_with_expiry(&self, key: &str, value: u64, ttl: Duration) -> Result<(), StoreError>;

    /// Write a counter, keeping the expiry it already carries.
    ///
    /// A counter that is absent, expired or carries no expiry gets a fresh
    /// `window` instead, so a windowed counter can never become persistent.
    async fn set_preserving_expiry(&self, key: &str, value: u64, window: Duration) -> Result<(), StoreError>;

    /// Decrement a counter, never below zero, returning the new value.
    async fn decrement(&self, key: &str) -> Result<u64, StoreError>;

    /// Query the remaining lifetime of a counter.
    async fn remaining_ttl(&self, key: &str) -> Result<Ttl, StoreError>;
}

/// Proof of holding a lock over a set of keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    /// Unique token for this acquisition
    pub token: Uuid,
    /// The keys covered
    pub keys: Vec<String>,
    /// Lease after which the lock frees itself
    pub lease: Duration,
}

impl LockHandle {
    pub fn new(keys: Vec<String>, lease: Duration) -> Self {
        Self {
            token: Uuid::new_v4(),
            keys,
            lease,
        }
    }
}

/// Exclusive multi-key lock with a bounded lease.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Acquire every key or none of them.
    async fn acquire(&self, keys: &[String], lease: Duration) -> Result<LockHandle, LockError>;

    /// Release a previously acquired lock. Releasing an expired or
    /// superseded handle is a no-op.
    async fn release(&self, handle: LockHandle) -> Result<(), LockError>;
}
