//! Authoritative in-memory settings table
//!
//! Holds the entries, the id counter, the quota totals and the dirty
//! bookkeeping the write scheduler works from. Every method expects the
//! shared lock to be held by the caller.

use crate::codec::DecodedState;
use crate::quota::QuotaTracker;
use setstore_common::{Error, QuotaLimit, Result, Setting, VERSION_UNDEFINED};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Point-in-time copy of the table handed to the writer
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Ordering key; later snapshots have larger generations
    pub generation: u64,
    /// Table version at snapshot time
    pub version: i32,
    /// Settings sorted by name
    pub settings: Vec<Setting>,
    /// First unwritten mutation covered by this snapshot
    pub dirty_since: Option<Instant>,
    /// Mutation count at snapshot time
    pub mutations: u64,
}

/// The settings table
#[derive(Debug)]
pub struct Table {
    version: i32,
    entries: HashMap<String, Setting>,
    next_id: u64,
    quota: QuotaTracker,
    dirty: bool,
    flush_pending: bool,
    last_dirty_at: Option<Instant>,
    generation: u64,
    mutations: u64,
}

impl Table {
    /// Create an empty table
    pub fn new(limit: QuotaLimit) -> Self {
        Self {
            version: VERSION_UNDEFINED,
            entries: HashMap::new(),
            next_id: 0,
            quota: QuotaTracker::new(limit),
            dirty: false,
            flush_pending: false,
            last_dirty_at: None,
            generation: 0,
            mutations: 0,
        }
    }

    /// Rebuild a table from a decoded state file
    pub fn restore(decoded: DecodedState, limit: QuotaLimit) -> Self {
        let mut quota = QuotaTracker::new(limit);
        quota.seed(decoded.settings.values());
        Self {
            version: decoded.version,
            entries: decoded.settings,
            next_id: decoded.next_id,
            quota,
            ..Self::new(limit)
        }
    }

    // ---- Queries ----

    pub const fn version(&self) -> i32 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<&Setting> {
        if name.is_empty() {
            return None;
        }
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Clones of every setting, sorted by name
    pub fn sorted(&self) -> Vec<Setting> {
        let mut settings: Vec<Setting> = self.entries.values().cloned().collect();
        settings.sort_by(|a, b| a.name.cmp(&b.name));
        settings
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Id the next mutation will receive
    pub const fn next_id(&self) -> u64 {
        self.next_id
    }

    pub const fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    // ---- Mutations ----

    /// Insert or replace a setting.
    ///
    /// Returns `Ok(false)` without touching anything when the stored value
    /// already equals `value`. Quota is checked before the entry changes.
    pub fn upsert(
        &mut self,
        name: &str,
        value: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<bool> {
        if name.is_empty() {
            return Err(Error::invalid_argument("setting name must not be empty"));
        }

        let old_len = match self.entries.get(name) {
            Some(existing) if existing.value.as_deref() == value => return Ok(false),
            Some(existing) => existing.value_len(),
            None => 0,
        };

        let charge = self
            .quota
            .check(namespace, old_len, value.map_or(0, str::len))?;

        let id = self.allocate_id()?;
        self.entries.insert(
            name.to_string(),
            Setting::new(
                name,
                value.map(str::to_owned),
                namespace.map(str::to_owned),
                id,
            ),
        );
        self.quota.commit(charge);
        Ok(true)
    }

    /// Like [`upsert`](Self::upsert) but only for names already present
    pub fn update(
        &mut self,
        name: &str,
        value: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<bool> {
        if !self.contains(name) {
            return Ok(false);
        }
        self.upsert(name, value, namespace)
    }

    /// Remove a setting, returning its bytes to the owner's quota
    pub fn delete(&mut self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        match self.entries.remove(name) {
            Some(old) => {
                self.quota
                    .release(old.namespace.as_deref(), old.value_len());
                true
            }
            None => false,
        }
    }

    /// Replace the version; returns false if unchanged
    pub const fn set_version(&mut self, version: i32) -> bool {
        if self.version == version {
            return false;
        }
        self.version = version;
        true
    }

    /// Remove every setting owned by `namespace` except the protected ones
    pub fn remove_namespace(&mut self, namespace: &str, protected: &HashSet<String>) -> usize {
        let doomed: Vec<String> = self
            .entries
            .values()
            .filter(|s| s.is_owned_by(namespace) && !protected.contains(&s.name))
            .map(|s| s.name.clone())
            .collect();

        for name in &doomed {
            self.delete(name);
        }
        doomed.len()
    }

    fn allocate_id(&mut self) -> Result<u64> {
        let id = self.next_id;
        self.next_id = id.checked_add(1).ok_or(Error::IdsExhausted)?;
        Ok(id)
    }

    // ---- Write bookkeeping ----

    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub const fn is_flush_pending(&self) -> bool {
        self.flush_pending
    }

    pub const fn last_dirty_at(&self) -> Option<Instant> {
        self.last_dirty_at
    }

    /// Record a mutation; returns when the oldest unwritten one happened
    pub fn mark_dirty(&mut self, now: Instant) -> Instant {
        self.dirty = true;
        self.flush_pending = true;
        self.mutations += 1;
        *self.last_dirty_at.get_or_insert(now)
    }

    /// Copy the persisted fields and clear the dirty bookkeeping
    pub fn take_snapshot(&mut self) -> Snapshot {
        self.generation += 1;
        let snapshot = Snapshot {
            generation: self.generation,
            version: self.version,
            settings: self.sorted(),
            dirty_since: self.last_dirty_at.take(),
            mutations: self.mutations,
        };
        self.dirty = false;
        self.flush_pending = false;
        snapshot
    }

    /// Put back the dirty state of a snapshot whose write failed
    pub fn restore_dirty(&mut self, snapshot: &Snapshot) {
        self.dirty = true;
        self.last_dirty_at = match (self.last_dirty_at, snapshot.dirty_since) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b).or_else(|| Some(Instant::now())),
        };
    }

    /// Mark the table clean after `snapshot` reached disk, unless it has
    /// been mutated since the snapshot was taken
    pub fn settle(&mut self, snapshot: &Snapshot) {
        if self.mutations == snapshot.mutations {
            self.dirty = false;
            self.last_dirty_at = None;
        }
    }
}
