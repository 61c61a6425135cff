//! Execution coordination across processes.
//!
//! A call goes through two short critical sections over the same key set:
//!
//! 1. lock, evaluate every limit, commit the staged increments, unlock;
//! 2. (after the job body, only if concurrency slots were taken) lock,
//!    give the slots back, unlock.
//!
//! The job body itself runs with no lock held, so jobs that share counters
//! still execute in parallel.

use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::backend::{CounterStore, DistributedLock};
use super::guard::{HeldLock, SlotRelease};
use super::identity::{lock_keys, LimitIdentity};
use super::limiter::{CallContext, Evaluation, LimitEvaluator};
use super::rejection::Rejection;
use super::rules::RuleSet;
use crate::config::LimiterConfig;
use crate::error::Result;

/// Outcome of an attempt: the job's output, or the reason it never ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission<T> {
    /// The job ran; its output is passed through unchanged
    Admitted(T),
    /// A limit was exhausted; the job did not run and no counter changed
    Rejected(Rejection),
}

impl<T> Admission<T> {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Admission::Admitted(_) => None,
            Admission::Rejected(r) => Some(r),
        }
    }

    /// Convert into a `Result`, treating a rejection as the error.
    pub fn into_result(self) -> std::result::Result<T, Rejection> {
        match self {
            Admission::Admitted(output) => Ok(output),
            Admission::Rejected(r) => Err(r),
        }
    }
}

/// A limiter whose counters live in a shared store.
///
/// Every process constructed with the same limiter id, store, lock
/// service and rules enforces one shared set of limits.
pub struct DistributedLimiter {
    config: LimiterConfig,
    rules: RwLock<Arc<RuleSet>>,
    store: Arc<dyn CounterStore>,
    lock: Arc<dyn DistributedLock>,
}

impl DistributedLimiter {
    /// Create a limiter, validating the rule set.
    pub fn new(
        config: LimiterConfig,
        rules: RuleSet,
        store: Arc<dyn CounterStore>,
        lock: Arc<dyn DistributedLock>,
    ) -> Result<Self> {
        rules.validate()?;
        info!(
            limiter = %config.id,
            lock_lease_ms = config.lock_lease_ms,
            "Limiter initialized"
        );
        Ok(Self {
            config,
            rules: RwLock::new(Arc::new(rules)),
            store,
            lock,
        })
    }

    pub fn limiter_id(&self) -> &str {
        &self.config.id
    }

    /// The rule set currently in force.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules.read().clone()
    }

    /// Replace the rule set. Calls already past evaluation keep the rules
    /// they were admitted under.
    pub fn set_rules(&self, rules: RuleSet) -> Result<()> {
        rules.validate()?;
        *self.rules.write() = Arc::new(rules);
        info!(limiter = %self.config.id, "Rule set updated");
        Ok(())
    }

    /// Read the current value of one counter, absent counters reading 0.
    pub async fn counter_value(&self, identity: &LimitIdentity) -> Result<u64> {
        Ok(self.store.get(&identity.counter_key()).await?.unwrap_or(0))
    }

    /// Run `job` if every configured limit admits it.
    ///
    /// Returns `Ok(Admission::Rejected)` when a limit is exhausted and
    /// `Err` when the lock or store could not be reached. The job is
    /// invoked at most once, and only on admission.
    #[instrument(skip(self, job), fields(limiter = %self.config.id))]
    pub async fn attempt<F, Fut, T>(
        &self,
        namespace: &str,
        key: &str,
        kind: Option<&str>,
        item_count: Option<u64>,
        job: F,
    ) -> Result<Admission<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.config.lock_lease();
        let keys = lock_keys(&self.config.id, namespace, key, kind);
        let call = CallContext {
            namespace,
            key,
            kind,
            item_count,
        };

        let held = HeldLock::acquire(self.lock.clone(), &keys, lease).await?;
        let rules = self.rules();
        let evaluation = LimitEvaluator::new(&self.config.id, &rules, self.store.as_ref())
            .evaluate(&call)
            .await;

        let batch = match evaluation {
            Ok(Evaluation::Admit(batch)) => batch,
            Ok(Evaluation::Reject(partial)) => {
                release_or_warn(held).await;
                let rejection = Rejection::build(&self.config.id, namespace, key, partial);
                debug!(
                    scope = %rejection.scope,
                    limit_type = %rejection.limit_type,
                    expires_in = ?rejection.expires_in,
                    "Job rejected"
                );
                return Ok(Admission::Rejected(rejection));
            }
            Err(e) => {
                release_or_warn(held).await;
                return Err(e.into());
            }
        };

        // Armed before the writes, so a call cancelled mid-commit still
        // gives back every slot it may have taken.
        let slot_keys = batch.concurrency_keys();
        let mut slots = (!slot_keys.is_empty()).then(|| {
            SlotRelease::new(
                self.store.clone(),
                self.lock.clone(),
                keys,
                slot_keys,
                lease,
            )
        });

        let failed = batch.commit(self.store.as_ref()).await;
        if !failed.is_empty() {
            warn!(failed = failed.len(), staged = batch.len(), "Some counter increments were not committed");
            if let Some(slots) = slots.as_mut() {
                for key in &failed {
                    slots.forget(key);
                }
            }
        }
        release_or_warn(held).await;

        debug!(staged = batch.len(), "Job admitted");
        let output = job().await;

        if let Some(slots) = slots {
            if let Err(e) = slots.release().await {
                error!(error = %e, "Failed to release concurrency slots");
            }
        }

        Ok(Admission::Admitted(output))
    }
}

async fn release_or_warn(held: HeldLock) {
    if let Err(e) = held.release().await {
        warn!(error = %e, "Failed to release lock; lease expiry will free it");
    }
}
