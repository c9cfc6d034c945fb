//! Per-namespace byte accounting
//!
//! Every value replacement is charged to the namespace making it. The
//! check and the commit are separate so a rejected mutation leaves both
//! the table and the running totals untouched.

use setstore_common::{Error, QuotaLimit, Result, SYSTEM_NAMESPACE, Setting};
use std::collections::HashMap;
use tracing::debug;

/// Pending usage update produced by a successful check
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "a charge does nothing until committed"]
pub struct Charge {
    namespace: String,
    total: usize,
}

/// Running byte totals per namespace
#[derive(Debug, Clone)]
pub struct QuotaTracker {
    limit: QuotaLimit,
    usage: HashMap<String, usize>,
}

impl QuotaTracker {
    /// Create a tracker with no recorded usage
    pub fn new(limit: QuotaLimit) -> Self {
        Self {
            limit,
            usage: HashMap::new(),
        }
    }

    /// Configured ceiling
    pub const fn limit(&self) -> QuotaLimit {
        self.limit
    }

    /// Bytes currently charged to `namespace`
    pub fn usage(&self, namespace: &str) -> Option<usize> {
        self.usage.get(namespace).copied()
    }

    /// Validate replacing a value of `old_len` bytes with `new_len` bytes.
    ///
    /// Returns `Ok(None)` when the namespace is not metered.
    pub fn check(
        &self,
        namespace: Option<&str>,
        old_len: usize,
        new_len: usize,
    ) -> Result<Option<Charge>> {
        let Some(limit) = self.limit.ceiling() else {
            return Ok(None);
        };
        let Some(namespace) = namespace.filter(|ns| *ns != SYSTEM_NAMESPACE) else {
            return Ok(None);
        };

        let current = self.usage.get(namespace).copied().unwrap_or(0);
        let total = (current + new_len).saturating_sub(old_len);

        if total > limit {
            return Err(Error::QuotaExceeded {
                namespace: namespace.to_string(),
                requested: total,
                limit,
            });
        }

        Ok(Some(Charge {
            namespace: namespace.to_string(),
            total,
        }))
    }

    /// Apply a charge returned by [`check`](Self::check)
    pub fn commit(&mut self, charge: Option<Charge>) {
        if let Some(Charge { namespace, total }) = charge {
            debug!("Namespace '{}' now uses {} bytes", namespace, total);
            self.usage.insert(namespace, total);
        }
    }

    /// Return `len` bytes to `namespace`. Never fails.
    pub fn release(&mut self, namespace: Option<&str>, len: usize) {
        if !self.limit.is_limited() {
            return;
        }
        let Some(namespace) = namespace.filter(|ns| *ns != SYSTEM_NAMESPACE) else {
            return;
        };
        if let Some(current) = self.usage.get_mut(namespace) {
            *current = current.saturating_sub(len);
        }
    }

    /// Account for settings loaded from disk without enforcing the ceiling
    pub fn seed<'a>(&mut self, settings: impl IntoIterator<Item = &'a Setting>) {
        if !self.limit.is_limited() {
            return;
        }
        for setting in settings {
            if let Some(namespace) = setting
                .namespace
                .as_deref()
                .filter(|ns| *ns != SYSTEM_NAMESPACE)
            {
                *self.usage.entry(namespace.to_string()).or_insert(0) += setting.value_len();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_rejects() {
        let mut quota = QuotaTracker::new(QuotaLimit::Unlimited);
        let charge = quota.check(Some("app"), 0, 1 << 20).unwrap();
        assert!(charge.is_none());
        quota.commit(charge);
        assert_eq!(quota.usage("app"), None);
    }

    #[test]
    fn test_rejects_over_limit() {
        let mut quota = QuotaTracker::new(QuotaLimit::Limited(100));
        let charge = quota.check(Some("app"), 0, 60).unwrap();
        quota.commit(charge);
        assert_eq!(quota.usage("app"), Some(60));

        let err = quota.check(Some("app"), 0, 60).unwrap_err();
        assert!(matches!(
            err,
            Error::QuotaExceeded { requested: 120, limit: 100, .. }
        ));
        assert_eq!(quota.usage("app"), Some(60));
    }

    #[test]
    fn test_replacement_uses_delta() {
        let mut quota = QuotaTracker::new(QuotaLimit::Limited(100));
        let charge = quota.check(Some("app"), 0, 90).unwrap();
        quota.commit(charge);

        // Shrinking and regrowing the same value stays within the limit.
        let charge = quota.check(Some("app"), 90, 95).unwrap();
        quota.commit(charge);
        assert_eq!(quota.usage("app"), Some(95));
    }

    #[test]
    fn test_total_floors_at_zero() {
        let mut quota = QuotaTracker::new(QuotaLimit::Limited(100));
        let charge = quota.check(Some("app"), 50, 0).unwrap();
        quota.commit(charge);
        assert_eq!(quota.usage("app"), Some(0));
    }

    #[test]
    fn test_system_and_absent_namespace_unmetered() {
        let quota = QuotaTracker::new(QuotaLimit::Limited(10));
        assert!(quota.check(Some(SYSTEM_NAMESPACE), 0, 1000).unwrap().is_none());
        assert!(quota.check(None, 0, 1000).unwrap().is_none());
    }

    #[test]
    fn test_release_and_seed() {
        let mut quota = QuotaTracker::new(QuotaLimit::Limited(100));
        let loaded = [
            Setting::new("a", Some("x".repeat(30)), Some("app".into()), 1),
            Setting::new("b", Some("y".repeat(20)), Some("app".into()), 2),
            Setting::new("c", Some("z".repeat(500)), Some(SYSTEM_NAMESPACE.into()), 3),
        ];
        quota.seed(&loaded);
        assert_eq!(quota.usage("app"), Some(50));
        assert_eq!(quota.usage(SYSTEM_NAMESPACE), None);

        quota.release(Some("app"), 30);
        assert_eq!(quota.usage("app"), Some(20));
        quota.release(Some("app"), 30);
        assert_eq!(quota.usage("app"), Some(0));
    }
}
