//! Core types for setstore
//!
//! The setting model and the quota ceiling shared by the engine and tooling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Version reported by a table whose owner never set one.
pub const VERSION_UNDEFINED: i32 = -1;

/// Namespace that is never metered by the quota tracker.
pub const SYSTEM_NAMESPACE: &str = "android";

/// Default per-namespace ceiling for limited tables (bytes)
pub const MAX_BYTES_PER_NAMESPACE_LIMITED: usize = 20_000;

/// A single named setting.
///
/// Values handed out by the engine are copies; changing one has no
/// effect on the table it came from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    /// Unique key within the table
    pub name: String,
    /// Current value (`None` is distinct from the empty string)
    pub value: Option<String>,
    /// Owning package, used for quota accounting and purge
    pub namespace: Option<String>,
    /// Id assigned by the last successful mutation
    pub id: u64,
}

impl Setting {
    /// Create a setting with an already assigned id
    pub fn new(
        name: impl Into<String>,
        value: Option<String>,
        namespace: Option<String>,
        id: u64,
    ) -> Self {
        Self {
            name: name.into(),
            value,
            namespace,
            id,
        }
    }

    /// Length in bytes charged against the owner's quota
    #[must_use]
    pub fn value_len(&self) -> usize {
        self.value.as_deref().map_or(0, str::len)
    }

    /// Check if this setting belongs to the given namespace
    #[must_use]
    pub fn is_owned_by(&self, namespace: &str) -> bool {
        self.namespace.as_deref() == Some(namespace)
    }
}

/// Per-namespace byte ceiling
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaLimit {
    /// No tracking, no rejection
    Unlimited,
    /// Reject mutations that push a namespace above this many bytes
    Limited(usize),
}

impl QuotaLimit {
    /// The ceiling in bytes, if any
    #[must_use]
    pub const fn ceiling(self) -> Option<usize> {
        match self {
            Self::Unlimited => None,
            Self::Limited(limit) => Some(limit),
        }
    }

    /// Check if quota tracking is enabled at all
    #[must_use]
    pub const fn is_limited(self) -> bool {
        matches!(self, Self::Limited(_))
    }
}

impl Default for QuotaLimit {
    fn default() -> Self {
        Self::Unlimited
    }
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unlimited => write!(f, "unlimited"),
            Self::Limited(limit) => write!(f, "{limit}"),
        }
    }
}

impl FromStr for QuotaLimit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::Unlimited);
        }
        if s.eq_ignore_ascii_case("limited") {
            return Ok(Self::Limited(MAX_BYTES_PER_NAMESPACE_LIMITED));
        }
        s.parse::<usize>()
            .map(Self::Limited)
            .map_err(|_| format!("invalid quota '{s}': expected bytes, 'limited' or 'unlimited'"))
    }
}
