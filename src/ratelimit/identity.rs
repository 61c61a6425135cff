//! Limit identities and counter key derivation.
//!
//! Every counter in the shared store is addressed by a key derived from a
//! [`LimitIdentity`]. Derivation is deterministic and injective: the same
//! identity always yields the same key, and identities differing in any
//! field never collide. Independent processes rely on this to coordinate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix shared by every derived counter key.
const KEY_PREFIX: &str = "jobgate";
/// Component separator.
const SEPARATOR: char = '|';
/// Marker for an absent optional component.
const ABSENT: &str = "~";
/// Marker preceding a present optional component.
const PRESENT: char = '=';

/// The scope a counter family belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// One counter family shared by every key in the namespace
    Namespace,
    /// One counter family per key
    Key,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Namespace => "namespace",
            Scope::Key => "key",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "namespace" => Some(Scope::Namespace),
            "key" => Some(Scope::Key),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of limit a counter tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LimitType {
    MaxJobsPerTimespan,
    MaxItemsPerTimespan,
    MaxConcurrentJobs,
}

impl LimitType {
    pub const ALL: [LimitType; 3] = [
        LimitType::MaxConcurrentJobs,
        LimitType::MaxJobsPerTimespan,
        LimitType::MaxItemsPerTimespan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::MaxJobsPerTimespan => "maxJobsPerTimespan",
            LimitType::MaxItemsPerTimespan => "maxItemsPerTimespan",
            LimitType::MaxConcurrentJobs => "maxConcurrentJobs",
        }
    }

    /// Whether counters of this type expire with a window.
    pub fn is_windowed(&self) -> bool {
        !matches!(self, LimitType::MaxConcurrentJobs)
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "maxJobsPerTimespan" => Some(LimitType::MaxJobsPerTimespan),
            "maxItemsPerTimespan" => Some(LimitType::MaxItemsPerTimespan),
            "maxConcurrentJobs" => Some(LimitType::MaxConcurrentJobs),
            _ => None,
        }
    }
}

impl fmt::Display for LimitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tuple that uniquely locates a counter.
///
/// Namespace-scoped identities carry no key; key-scoped identities always do.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LimitIdentity {
    pub limiter_id: String,
    pub scope: Scope,
    pub limit_type: LimitType,
    pub namespace: String,
    pub key: Option<String>,
    pub kind: Option<String>,
}

impl LimitIdentity {
    /// Build the identity for one cell of the rule matrix for a call.
    pub fn for_call(
        limiter_id: &str,
        scope: Scope,
        limit_type: LimitType,
        namespace: &str,
        key: &str,
        kind: Option<&str>,
    ) -> Self {
        Self {
            limiter_id: limiter_id.to_string(),
            scope,
            limit_type,
            namespace: namespace.to_string(),
            key: match scope {
                Scope::Namespace => None,
                Scope::Key => Some(key.to_string()),
            },
            kind: kind.map(str::to_string),
        }
    }

    /// Derive the counter key.
    ///
    /// Format: `jobgate|{limiter}|{scope}|{type}|{namespace}|{key}|{kind}`,
    /// where free-form components are escaped and optional ones are encoded
    /// as `~` (absent) or `={value}` (present).
    pub fn counter_key(&self) -> String {
        let mut out = String::with_capacity(64);
        out.push_str(KEY_PREFIX);
        for part in [
            escape(&self.limiter_id),
            self.scope.as_str().to_string(),
            self.limit_type.as_str().to_string(),
            escape(&self.namespace),
            encode_optional(self.key.as_deref()),
            encode_optional(self.kind.as_deref()),
        ] {
            out.push(SEPARATOR);
            out.push_str(&part);
        }
        out
    }

    /// Parse a derived counter key back into its identity.
    pub fn from_counter_key(counter_key: &str) -> Option<Self> {
        let mut parts = counter_key.split(SEPARATOR);
        if parts.next()? != KEY_PREFIX {
            return None;
        }

        let limiter_id = unescape(parts.next()?)?;
        let scope = Scope::parse(parts.next()?)?;
        let limit_type = LimitType::parse(parts.next()?)?;
        let namespace = unescape(parts.next()?)?;
        let key = decode_optional(parts.next()?)?;
        let kind = decode_optional(parts.next()?)?;

        if parts.next().is_some() {
            return None;
        }
        // A namespace-scoped identity never carries a key.
        if (scope == Scope::Key) != key.is_some() {
            return None;
        }

        Some(Self {
            limiter_id,
            scope,
            limit_type,
            namespace,
            key,
            kind,
        })
    }
}

impl fmt::Display for LimitIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.counter_key())
    }
}

/// Every counter key a call could touch, whether or not a rule is configured
/// for it: 2 scopes x 3 limit types, doubled when the call carries a kind.
pub fn lock_keys(limiter_id: &str, namespace: &str, key: &str, kind: Option<&str>) -> Vec<String> {
    let kinds = match kind {
        Some(_) => vec![None, kind],
        None => vec![None],
    };

    let mut keys = Vec::with_capacity(12);
    for limit_type in LimitType::ALL {
        for &kind in &kinds {
            for scope in [Scope::Namespace, Scope::Key] {
                keys.push(
                    LimitIdentity::for_call(limiter_id, scope, limit_type, namespace, key, kind)
                        .counter_key(),
                );
            }
        }
    }
    keys
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find('%') {
        out.push_str(&rest[..idx]);
        let code = rest.get(idx + 1..idx + 3)?;
        match code {
            "25" => out.push('%'),
            "7C" => out.push('|'),
            _ => return None,
        }
        rest = &rest[idx + 3..];
    }
    out.push_str(rest);
    Some(out)
}

fn encode_optional(value: Option<&str>) -> String {
    match value {
        None => ABSENT.to_string(),
        Some(v) => format!("{}{}", PRESENT, escape(v)),
    }
}

/// `Some(None)` for an absent component, `None` for a malformed one.
fn decode_optional(s: &str) -> Option<Option<String>> {
    if s == ABSENT {
        return Some(None);
    }
    let value = s.strip_prefix(PRESENT)?;
    unescape(value).map(Some)
}
