//! Limit checking and counter lifecycle.

mod backend;
mod counter;
mod distributed;
mod guard;
mod identity;
mod limiter;
mod rejection;
mod rules;

pub use backend::{CounterStore, DistributedLock, LockError, LockHandle, StoreError, Ttl};
pub use counter::{CounterMode, IncrementBatch, StagedIncrement};
pub use distributed::{Admission, DistributedLimiter};
pub use guard::{HeldLock, SlotRelease};
pub use identity::{lock_keys, LimitIdentity, LimitType, Scope};
pub use limiter::{CallContext, Evaluation, LimitEvaluator};
pub use rejection::{PartialRejection, Rejection};
pub use rules::{ConcurrencyRules, RuleSet, ScopeRules, Threshold, TimespanLimit, TimespanRules};
