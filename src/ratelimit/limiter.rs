//! Limit evaluation.
//!
//! The rule matrix (scope x limit type x global/kind) is walked as a fixed
//! table of checks. For each configured cell the current counter is read
//! and compared against its ceiling. The first exhausted limit rejects the
//! call; otherwise every check stages an increment for the coordinator.

use tracing::{debug, trace};

use super::backend::{CounterStore, StoreError};
use super::counter::{CounterMode, IncrementBatch, StagedIncrement};
use super::identity::{LimitIdentity, LimitType, Scope};
use super::rejection::PartialRejection;
use super::rules::RuleSet;

/// Whether a check targets the global counter or the kind-specific one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Granularity {
    Global,
    Kind,
}

/// One row of the evaluation table.
#[derive(Debug, Clone, Copy)]
struct Check {
    limit_type: LimitType,
    granularity: Granularity,
    scope: Scope,
}

const fn check(limit_type: LimitType, granularity: Granularity, scope: Scope) -> Check {
    Check {
        limit_type,
        granularity,
        scope,
    }
}

/// Evaluation order: concurrency, then jobs, then items; within each type
/// namespace-global, key-global, namespace-kind, key-kind.
const CHECK_ORDER: [Check; 12] = [
    check(LimitType::MaxConcurrentJobs, Granularity::Global, Scope::Namespace),
    check(LimitType::MaxConcurrentJobs, Granularity::Global, Scope::Key),
    check(LimitType::MaxConcurrentJobs, Granularity::Kind, Scope::Namespace),
    check(LimitType::MaxConcurrentJobs, Granularity::Kind, Scope::Key),
    check(LimitType::MaxJobsPerTimespan, Granularity::Global, Scope::Namespace),
    check(LimitType::MaxJobsPerTimespan, Granularity::Global, Scope::Key),
    check(LimitType::MaxJobsPerTimespan, Granularity::Kind, Scope::Namespace),
    check(LimitType::MaxJobsPerTimespan, Granularity::Kind, Scope::Key),
    check(LimitType::MaxItemsPerTimespan, Granularity::Global, Scope::Namespace),
    check(LimitType::MaxItemsPerTimespan, Granularity::Global, Scope::Key),
    check(LimitType::MaxItemsPerTimespan, Granularity::Kind, Scope::Namespace),
    check(LimitType::MaxItemsPerTimespan, Granularity::Kind, Scope::Key),
];

/// The coordinates of a candidate call.
#[derive(Debug, Clone, Copy)]
pub struct CallContext<'a> {
    pub namespace: &'a str,
    pub key: &'a str,
    pub kind: Option<&'a str>,
    pub item_count: Option<u64>,
}

/// Outcome of evaluating a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Every check passed; these increments must be committed
    Admit(IncrementBatch),
    /// A limit is exhausted; nothing was staged for commit
    Reject(PartialRejection),
}

/// Decides admission for one call against a rule set.
///
/// The evaluator only reads from the store. It must run while the caller
/// holds the lock over [`super::identity::lock_keys`] for the call.
pub struct LimitEvaluator<'a> {
    limiter_id: &'a str,
    rules: &'a RuleSet,
    store: &'a dyn CounterStore,
}

impl<'a> LimitEvaluator<'a> {
    pub fn new(limiter_id: &'a str, rules: &'a RuleSet, store: &'a dyn CounterStore) -> Self {
        Self {
            limiter_id,
            rules,
            store,
        }
    }

    /// Evaluate every configured limit for the call, stopping at the first
    /// rejection.
    pub async fn evaluate(&self, call: &CallContext<'_>) -> Result<Evaluation, StoreError> {
        let mut batch = IncrementBatch::new();

        for row in CHECK_ORDER {
            let kind = match row.granularity {
                Granularity::Global => None,
                Granularity::Kind => match call.kind {
                    Some(kind) => Some(kind),
                    None => continue,
                },
            };

            let amount = match row.limit_type {
                LimitType::MaxItemsPerTimespan => match call.item_count {
                    Some(items) => items,
                    None => continue,
                },
                LimitType::MaxJobsPerTimespan | LimitType::MaxConcurrentJobs => 1,
            };

            let Some(threshold) = self.rules.threshold(row.scope, row.limit_type, kind) else {
                continue;
            };

            let identity = LimitIdentity::for_call(
                self.limiter_id,
                row.scope,
                row.limit_type,
                call.namespace,
                call.key,
                kind,
            );
            let counter_key = identity.counter_key();
            let current = self.store.get(&counter_key).await?.unwrap_or(0);

            trace!(
                key = %counter_key,
                current = current,
                amount = amount,
                limit = threshold.count,
                "Checking limit"
            );

            if current.saturating_add(amount) > threshold.count {
                let expires_in = match threshold.window {
                    Some(_) => Some(self.store.remaining_ttl(&counter_key).await?.remaining()),
                    None => None,
                };

                debug!(
                    key = %counter_key,
                    current = current,
                    limit = threshold.count,
                    expires_in = ?expires_in,
                    "Limit exceeded"
                );

                return Ok(Evaluation::Reject(PartialRejection {
                    scope: row.scope,
                    limit_type: row.limit_type,
                    kind: kind.map(str::to_string),
                    global: row.granularity == Granularity::Global,
                    expires_in,
                }));
            }

            let mode = match threshold.window {
                Some(window) => CounterMode::for_window(current, window),
                None => CounterMode::ConcurrencyBump,
            };
            batch.push(StagedIncrement {
                key: counter_key,
                mode,
                current,
                amount,
            });
        }

        debug!(staged = batch.len(), "Call admitted");
        Ok(Evaluation::Admit(batch))
    }
}
