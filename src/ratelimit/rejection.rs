//! Rejection records.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::identity::{LimitType, Scope};

/// What the evaluator knows about a rejection: which limit tripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialRejection {
    pub scope: Scope,
    pub limit_type: LimitType,
    pub kind: Option<String>,
    /// Whether the global (rather than kind-specific) limit tripped
    pub global: bool,
    /// Remaining window for jobs/items limits, `None` for concurrency limits
    pub expires_in: Option<Duration>,
}

/// A call was refused because a limit is exhausted.
///
/// This is the expected, frequent outcome of a busy limiter. It is safe to
/// retry after `expires_in` (for windowed limits) or after some backoff
/// (for concurrency limits).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{limit_type} exceeded for {scope} '{namespace}' (key '{key}')")]
pub struct Rejection {
    pub limiter_id: String,
    pub scope: Scope,
    #[serde(rename = "type")]
    pub limit_type: LimitType,
    pub namespace: String,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub global: bool,
    /// Milliseconds until the tripped window resets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
}

impl Rejection {
    /// Attach the limiter identity and call coordinates to a partial rejection.
    pub fn build(limiter_id: &str, namespace: &str, key: &str, partial: PartialRejection) -> Self {
        Self {
            limiter_id: limiter_id.to_string(),
            scope: partial.scope,
            limit_type: partial.limit_type,
            namespace: namespace.to_string(),
            key: key.to_string(),
            kind: partial.kind,
            global: partial.global,
            expires_in: partial.expires_in.map(ceil_millis),
        }
    }

    /// Time until the tripped window resets, if the limit is windowed.
    pub fn retry_after(&self) -> Option<Duration> {
        self.expires_in.map(Duration::from_millis)
    }
}

/// Whole milliseconds, rounded up so waiting the reported time always
/// outlasts the window.
fn ceil_millis(d: Duration) -> u64 {
    d.as_nanos().div_ceil(1_000_000) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_attaches_identity() {
        let partial = PartialRejection {
            scope: Scope::Key,
            limit_type: LimitType::MaxJobsPerTimespan,
            kind: Some("email".to_string()),
            global: false,
            expires_in: Some(Duration::from_millis(1500)),
        };

        let rejection = Rejection::build("limiter", "api", "acct-1", partial);
        assert_eq!(rejection.limiter_id, "limiter");
        assert_eq!(rejection.namespace, "api");
        assert_eq!(rejection.key, "acct-1");
        assert_eq!(rejection.expires_in, Some(1500));
        assert_eq!(rejection.retry_after(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_serialized_shape() {
        let rejection = Rejection::build(
            "limiter",
            "api",
            "acct-1",
            PartialRejection {
                scope: Scope::Namespace,
                limit_type: LimitType::MaxConcurrentJobs,
                kind: None,
                global: true,
                expires_in: None,
            },
        );

        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["scope"], "namespace");
        assert_eq!(json["type"], "maxConcurrentJobs");
        assert_eq!(json["global"], true);
        assert!(json.get("expiresIn").is_none());
        assert!(json.get("kind").is_none());

        let back: Rejection = serde_json::from_value(json).unwrap();
        assert_eq!(back, rejection);
    }

    #[test]
    fn test_display() {
        let rejection = Rejection::build(
            "l",
            "api",
            "acct",
            PartialRejection {
                scope: Scope::Namespace,
                limit_type: LimitType::MaxJobsPerTimespan,
                kind: None,
                global: true,
                expires_in: Some(Duration::from_secs(1)),
            },
        );
        assert_eq!(
            rejection.to_string(),
            "maxJobsPerTimespan exceeded for namespace 'api' (key 'acct')"
        );
    }

    #[test]
    fn test_expires_in_rounds_up() {
        let partial = |expires_in| PartialRejection {
            scope: Scope::Key,
            limit_type: LimitType::MaxJobsPerTimespan,
            kind: None,
            global: true,
            expires_in: Some(expires_in),
        };

        let rejection = Rejection::build("l", "api", "acct", partial(Duration::from_micros(999_500)));
        assert_eq!(rejection.expires_in, Some(1000));
        assert!(rejection.retry_after().unwrap() >= Duration::from_micros(999_500));

        let rejection = Rejection::build("l", "api", "acct", partial(Duration::from_millis(250)));
        assert_eq!(rejection.expires_in, Some(250));

        let rejection = Rejection::build("l", "api", "acct", partial(Duration::ZERO));
        assert_eq!(rejection.expires_in, Some(0));
    }
}
