//! Staged counter mutations.
//!
//! The evaluator never writes to the store. It stages one
//! [`StagedIncrement`] per admitted check, and the coordinator applies the
//! whole batch once every check has passed.

use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, warn};

use super::backend::{CounterStore, StoreError};

/// How a staged increment is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterMode {
    /// First hit in a window: write the value and start the window's expiry
    FreshWindow(Duration),
    /// Later hit in the same window: write the value, keep the expiry.
    /// The window restarts if the counter lapsed since it was read.
    ContinueWindow(Duration),
    /// Concurrency slot: write the value with no expiry
    ConcurrencyBump,
}

impl CounterMode {
    /// Pick the mode for a windowed counter given its current value.
    pub fn for_window(current: u64, window: Duration) -> Self {
        if current == 0 {
            CounterMode::FreshWindow(window)
        } else {
            CounterMode::ContinueWindow(window)
        }
    }
}

/// A pending write for one counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedIncrement {
    pub key: String,
    pub mode: CounterMode,
    /// Value observed while the lock was held
    pub current: u64,
    pub amount: u64,
}

impl StagedIncrement {
    /// The value the counter holds once this increment lands.
    pub fn target(&self) -> u64 {
        self.current.saturating_add(self.amount)
    }

    /// Write this increment to the store.
    pub async fn apply(&self, store: &dyn CounterStore) -> Result<(), StoreError> {
        let value = self.target();
        match self.mode {
            CounterMode::FreshWindow(ttl) => store.set_with_expiry(&self.key, value, ttl).await,
            CounterMode::ContinueWindow(window) => {
                store.set_preserving_expiry(&self.key, value, window).await
            }
            CounterMode::ConcurrencyBump => store.set(&self.key, value).await,
        }
    }
}

/// The ordered increments staged during one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncrementBatch {
    increments: Vec<StagedIncrement>,
}

impl IncrementBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, increment: StagedIncrement) {
        self.increments.push(increment);
    }

    pub fn len(&self) -> usize {
        self.increments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.increments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StagedIncrement> {
        self.increments.iter()
    }

    /// Keys of the concurrency counters this batch bumps.
    pub fn concurrency_keys(&self) -> Vec<String> {
        self.increments
            .iter()
            .filter(|inc| inc.mode == CounterMode::ConcurrencyBump)
            .map(|inc| inc.key.clone())
            .collect()
    }

    /// Apply every increment concurrently.
    ///
    /// Writes are best-effort: a failed write is logged but does not fail
    /// the batch. Returns the keys whose write failed.
    pub async fn commit(&self, store: &dyn CounterStore) -> Vec<String> {
        let results = join_all(self.increments.iter().map(|inc| inc.apply(store))).await;

        let mut failed = Vec::new();
        for (inc, result) in self.increments.iter().zip(results) {
            match result {
                Ok(()) => debug!(key = %inc.key, value = inc.target(), mode = ?inc.mode, "Committed counter"),
                Err(e) => {
                    warn!(key = %inc.key, error = %e, "Failed to commit counter increment");
                    failed.push(inc.key.clone());
                }
            }
        }
        failed
    }
}
