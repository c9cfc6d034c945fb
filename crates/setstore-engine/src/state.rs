//! Persisted settings table
//!
//! `SettingsState` ties the table, the writer thread and the state file
//! together. Every operation takes the caller-supplied shared lock, so a
//! caller may hold it across several calls for a broader critical section.

use crate::atomic_file::AtomicFile;
use crate::codec;
use crate::lock::SharedLock;
use crate::scheduler::{DrainCallback, Flush, WriteScheduler};
use crate::table::{Snapshot, Table};
use parking_lot::Mutex;
use setstore_common::{Error, Result, Setting, StoreConfig};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::{debug, error, info};

/// Where the table stands with respect to its state file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Everything is on disk
    Clean,
    /// Changes are waiting for the debounce timer
    PendingDebounce,
    /// A snapshot is being written
    FlushRunning,
    /// Changes are unwritten and nothing is scheduled, e.g. after a failed write
    Stale,
}

/// Counters for a settings table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateStats {
    pub entries: usize,
    pub version: i32,
    pub dirty: bool,
    pub writes: u64,
    pub skipped_writes: u64,
    pub failed_writes: u64,
}

struct Inner {
    key: u32,
    lock: SharedLock,
    table: Mutex<Table>,
    file: AtomicFile,
    protected: HashSet<String>,
    /// Generation of the last snapshot that reached disk
    durable_generation: Mutex<u64>,
    in_flight: AtomicUsize,
    writes: AtomicU64,
    skipped_writes: AtomicU64,
    failed_writes: AtomicU64,
}

impl Inner {
    /// Take a snapshot under the shared lock; `None` if clean and not forced
    fn snapshot(&self, force: bool) -> Option<Snapshot> {
        let _guard = self.lock.lock();
        let mut table = self.table.lock();
        if !force && !table.is_dirty() {
            return None;
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        Some(table.take_snapshot())
    }

    fn write_out(&self, snapshot: &Snapshot) -> Result<()> {
        let result = self.write_snapshot(snapshot);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        // Lock order: shared, table, durable generation.
        let _guard = self.lock.lock();
        let mut table = self.table.lock();
        let durable = *self.durable_generation.lock();

        match &result {
            Ok(()) if durable == snapshot.generation => table.settle(snapshot),
            Ok(()) => {}
            Err(e) => {
                self.failed_writes.fetch_add(1, Ordering::Relaxed);
                if snapshot.generation > durable {
                    table.restore_dirty(snapshot);
                }
                error!(
                    "Settings {}: failed to write {:?}: {}",
                    self.key,
                    self.file.path(),
                    e
                );
            }
        }
        result
    }

    fn write_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let bytes = codec::encode(snapshot.version, &snapshot.settings)
            .map_err(|e| Error::persistence(e.to_string()))?;

        let mut durable = self.durable_generation.lock();
        if *durable >= snapshot.generation {
            self.skipped_writes.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Settings {}: skipping generation {}, generation {} already durable",
                self.key, snapshot.generation, *durable
            );
            return Ok(());
        }

        let started = Instant::now();
        self.file.write(&bytes)?;
        *durable = snapshot.generation;
        self.writes.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Settings {}: wrote {} settings ({} bytes) in {:?}",
            self.key,
            snapshot.settings.len(),
            bytes.len(),
            started.elapsed()
        );
        Ok(())
    }
}

impl Flush for Inner {
    fn flush_pending(&self) {
        if let Some(snapshot) = self.snapshot(false) {
            // Failures are logged and leave the table dirty.
            let _ = self.write_out(&snapshot);
        }
    }
}

/// A settings table persisted to a single state file
pub struct SettingsState {
    inner: Arc<Inner>,
    scheduler: WriteScheduler,
    drained: AtomicBool,
}

impl SettingsState {
    /// Load the table from `config.path` (empty if missing) and start its writer.
    ///
    /// A malformed state file fails with [`Error::CorruptState`].
    pub fn open(config: StoreConfig, lock: SharedLock) -> Result<Self> {
        config.validate()?;
        let file = AtomicFile::new(&config.path);

        let table = {
            let _guard = lock.lock();
            match file.read()? {
                Some(bytes) => {
                    let decoded = codec::decode(&bytes)
                        .map_err(|e| Error::corrupt(&config.path, e.to_string()))?;
                    Table::restore(decoded, config.quota)
                }
                None => Table::new(config.quota),
            }
        };

        info!(
            "Settings {}: opened {:?} ({} entries, version {})",
            config.key,
            config.path,
            table.len(),
            table.version()
        );

        let inner = Arc::new(Inner {
            key: config.key,
            lock,
            table: Mutex::new(table),
            file,
            protected: config.protected_names,
            durable_generation: Mutex::new(0),
            in_flight: AtomicUsize::new(0),
            writes: AtomicU64::new(0),
            skipped_writes: AtomicU64::new(0),
            failed_writes: AtomicU64::new(0),
        });

        let scheduler = WriteScheduler::spawn(
            format!("setstore-writer-{}", config.key),
            &config.scheduler,
            inner.clone(),
        )?;

        Ok(Self {
            inner,
            scheduler,
            drained: AtomicBool::new(false),
        })
    }

    // ---- Queries ----

    pub fn key(&self) -> u32 {
        self.inner.key
    }

    pub fn path(&self) -> &Path {
        self.inner.file.path()
    }

    pub fn lock(&self) -> &SharedLock {
        &self.inner.lock
    }

    pub fn get(&self, name: &str) -> Option<Setting> {
        self.read(|table| table.get(name).cloned())
    }

    /// All current names, in no particular order
    pub fn names(&self) -> Vec<String> {
        self.read(Table::names)
    }

    /// Current settings sorted by name
    pub fn settings(&self) -> Vec<Setting> {
        self.read(Table::sorted)
    }

    pub fn version(&self) -> i32 {
        self.read(Table::version)
    }

    pub fn len(&self) -> usize {
        self.read(Table::len)
    }

    pub fn is_empty(&self) -> bool {
        self.read(Table::is_empty)
    }

    /// Check if there are changes not yet on disk
    pub fn is_dirty(&self) -> bool {
        self.read(Table::is_dirty)
    }

    /// Bytes charged to `namespace`; `None` if unmetered or unused
    pub fn namespace_usage(&self, namespace: &str) -> Option<usize> {
        self.read(|table| table.quota().usage(namespace))
    }

    pub fn write_state(&self) -> WriteState {
        let (dirty, pending) = self.read(|table| (table.is_dirty(), table.is_flush_pending()));
        if self.inner.in_flight.load(Ordering::SeqCst) > 0 {
            WriteState::FlushRunning
        } else if pending {
            WriteState::PendingDebounce
        } else if dirty {
            WriteState::Stale
        } else {
            WriteState::Clean
        }
    }

    pub fn stats(&self) -> StateStats {
        let (entries, version, dirty) =
            self.read(|table| (table.len(), table.version(), table.is_dirty()));
        StateStats {
            entries,
            version,
            dirty,
            writes: self.inner.writes.load(Ordering::Relaxed),
            skipped_writes: self.inner.skipped_writes.load(Ordering::Relaxed),
            failed_writes: self.inner.failed_writes.load(Ordering::Relaxed),
        }
    }

    // ---- Mutations ----

    /// Insert or replace a setting.
    ///
    /// Returns `Ok(false)` if the stored value already equals `value`.
    pub fn insert(
        &self,
        name: &str,
        value: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<bool> {
        self.mutate(|table| table.upsert(name, value, namespace))
    }

    /// Replace an existing setting; `Ok(false)` if `name` is not present
    pub fn update(
        &self,
        name: &str,
        value: Option<&str>,
        namespace: Option<&str>,
    ) -> Result<bool> {
        self.mutate(|table| table.update(name, value, namespace))
    }

    pub fn delete(&self, name: &str) -> Result<bool> {
        self.mutate(|table| Ok(table.delete(name)))
    }

    pub fn set_version(&self, version: i32) {
        let _ = self.mutate(|table| Ok(table.set_version(version)));
    }

    /// Remove every setting owned by `namespace` except `protected` names
    pub fn remove_namespace(&self, namespace: &str, protected: &HashSet<String>) -> usize {
        let _guard = self.inner.lock.lock();
        let mut table = self.inner.table.lock();
        let removed = table.remove_namespace(namespace, protected);
        if removed > 0 {
            info!(
                "Settings {}: removed {} settings of namespace '{}'",
                self.inner.key, removed, namespace
            );
            self.schedule(&mut table);
        }
        removed
    }

    /// Names the configuration protects from namespace purges
    pub fn protected_names(&self) -> &HashSet<String> {
        &self.inner.protected
    }

    /// Like [`remove_namespace`](Self::remove_namespace) with the configured protected names
    pub fn remove_namespace_default(&self, namespace: &str) -> usize {
        self.remove_namespace(namespace, &self.inner.protected)
    }

    // ---- Persistence ----

    /// Write the current state now, even if clean.
    ///
    /// Cancels any pending timer. On failure the table stays dirty.
    pub fn flush_now(&self) -> Result<()> {
        let snapshot = {
            let _guard = self.inner.lock.lock();
            self.scheduler.cancel();
            self.inner.snapshot(true)
        };
        match snapshot {
            Some(snapshot) => self.inner.write_out(&snapshot),
            None => Ok(()),
        }
    }

    /// Stop the writer after one last flush of pending changes.
    ///
    /// `on_done` runs once that flush has finished, or right away if there
    /// was nothing to write. Does not block.
    pub fn drain(&self, on_done: Option<DrainCallback>) {
        if self.drained.swap(true, Ordering::SeqCst) {
            // Writer already stopped; anything dirtied since is written here.
            self.inner.flush_pending();
            if let Some(on_done) = on_done {
                on_done();
            }
            return;
        }

        let dirty = self.is_dirty();
        info!(
            "Settings {}: draining writer ({})",
            self.inner.key,
            if dirty { "dirty" } else { "clean" }
        );

        let on_done = if dirty {
            on_done
        } else {
            if let Some(on_done) = on_done {
                on_done();
            }
            None
        };

        if let Err(on_done) = self.scheduler.drain(on_done) {
            self.inner.flush_pending();
            if let Some(on_done) = on_done {
                on_done();
            }
        }
    }

    /// Drain and wait for the writer thread to exit.
    ///
    /// Must not be called while holding the shared lock.
    pub fn shutdown(&self) {
        self.drain(None);
        self.scheduler.join();
    }

    fn read<T>(&self, f: impl FnOnce(&Table) -> T) -> T {
        let _guard = self.inner.lock.lock();
        let table = self.inner.table.lock();
        f(&table)
    }

    fn mutate<F>(&self, op: F) -> Result<bool>
    where
        F: FnOnce(&mut Table) -> Result<bool>,
    {
        let _guard = self.inner.lock.lock();
        let mut table = self.inner.table.lock();
        let changed = op(&mut table)?;
        if changed {
            self.schedule(&mut table);
        }
        Ok(changed)
    }

    fn schedule(&self, table: &mut Table) {
        let first_dirty = table.mark_dirty(Instant::now());
        if !self.scheduler.arm(first_dirty) {
            debug!(
                "Settings {}: writer stopped, change kept until next flush",
                self.inner.key
            );
        }
    }
}

impl Drop for SettingsState {
    fn drop(&mut self) {
        if !self.drained.load(Ordering::SeqCst) {
            self.drain(None);
        }
    }
}

impl std::fmt::Debug for SettingsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsState")
            .field("key", &self.inner.key)
            .field("path", &self.inner.file.path())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use setstore_common::{QuotaLimit, SchedulerConfig, VERSION_UNDEFINED};
    use std::fs;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::tempdir;

    fn slow_config(path: &Path) -> StoreConfig {
        // Long enough that the timer never fires during a test.
        StoreConfig::with_path(path).scheduler(SchedulerConfig {
            debounce_ms: 60_000,
            max_delay_ms: 60_000,
        })
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        let state = SettingsState::open(
            slow_config(&dir.path().join("s.xml")),
            SharedLock::new(),
        )
        .unwrap();

        assert!(state.is_empty());
        assert_eq!(state.version(), VERSION_UNDEFINED);
        assert_eq!(state.write_state(), WriteState::Clean);
        state.shutdown();
    }

    #[test]
    fn test_mutation_marks_pending() {
        let dir = tempdir().unwrap();
        let state = SettingsState::open(
            slow_config(&dir.path().join("s.xml")),
            SharedLock::new(),
        )
        .unwrap();

        assert!(state.insert("a", Some("1"), Some("app")).unwrap());
        assert!(state.is_dirty());
        assert_eq!(state.write_state(), WriteState::PendingDebounce);
        assert!(!state.path().exists());

        state.flush_now().unwrap();
        assert!(!state.is_dirty());
        assert_eq!(state.write_state(), WriteState::Clean);
        assert!(state.path().exists());
        assert_eq!(state.stats().writes, 1);
        state.shutdown();
    }

    #[test]
    fn test_noop_does_not_dirty() {
        let dir = tempdir().unwrap();
        let state = SettingsState::open(
            slow_config(&dir.path().join("s.xml")),
            SharedLock::new(),
        )
        .unwrap();

        state.insert("a", Some("1"), None).unwrap();
        state.flush_now().unwrap();

        assert!(!state.insert("a", Some("1"), None).unwrap());
        assert!(!state.update("missing", Some("1"), None).unwrap());
        assert!(!state.delete("missing").unwrap());
        state.set_version(VERSION_UNDEFINED);
        assert!(!state.is_dirty());
        state.shutdown();
    }

    #[test]
    fn test_empty_name_rejected() {
        let dir = tempdir().unwrap();
        let state = SettingsState::open(
            slow_config(&dir.path().join("s.xml")),
            SharedLock::new(),
        )
        .unwrap();

        let err = state.insert("", Some("v"), None).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(!state.is_dirty());
        assert!(state.get("").is_none());
        state.shutdown();
    }

    #[test]
    fn test_reopen_restores_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.xml");

        let state = SettingsState::open(slow_config(&path), SharedLock::new()).unwrap();
        state.insert("a", Some("1"), Some("app")).unwrap();
        state.insert("b", None, None).unwrap();
        state.set_version(7);
        state.flush_now().unwrap();
        state.shutdown();

        let state = SettingsState::open(slow_config(&path), SharedLock::new()).unwrap();
        assert_eq!(state.version(), 7);
        assert_eq!(state.get("a").unwrap().value.as_deref(), Some("1"));
        assert_eq!(state.get("b").unwrap().value, None);

        state.insert("c", Some("x"), None).unwrap();
        assert_eq!(state.get("c").unwrap().id, 2);
        state.shutdown();
    }

    #[test]
    fn test_reentrant_with_held_lock() {
        let dir = tempdir().unwrap();
        let lock = SharedLock::new();
        let state =
            SettingsState::open(slow_config(&dir.path().join("s.xml")), lock.clone()).unwrap();

        {
            let _guard = lock.lock();
            state.insert("a", Some("1"), None).unwrap();
            state.insert("b", Some("2"), None).unwrap();
            assert_eq!(state.len(), 2);
            state.flush_now().unwrap();
        }
        state.shutdown();
    }

    #[test]
    fn test_failed_flush_stays_dirty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.xml");
        let state = SettingsState::open(slow_config(&path), SharedLock::new()).unwrap();

        state.insert("a", Some("1"), None).unwrap();
        state.flush_now().unwrap();
        let durable = fs::read(&path).unwrap();

        state.insert("a", Some("2"), None).unwrap();
        fs::create_dir(dir.path().join("s.xml.tmp")).unwrap();

        assert!(state.flush_now().is_err());
        assert!(state.is_dirty());
        assert_eq!(state.write_state(), WriteState::Stale);
        assert_eq!(fs::read(&path).unwrap(), durable);
        assert_eq!(state.stats().failed_writes, 1);

        fs::remove_dir(dir.path().join("s.xml.tmp")).unwrap();
        state.flush_now().unwrap();
        assert!(!state.is_dirty());
        state.shutdown();
    }

    #[test]
    fn test_drain_clean_runs_callback_inline() {
        let dir = tempdir().unwrap();
        let state = SettingsState::open(
            slow_config(&dir.path().join("s.xml")),
            SharedLock::new(),
        )
        .unwrap();

        let (tx, rx) = mpsc::channel();
        state.drain(Some(Box::new(move || tx.send(()).unwrap())));
        assert!(rx.try_recv().is_ok());
        state.shutdown();
    }

    #[test]
    fn test_drain_dirty_flushes_before_callback() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.xml");
        let state = SettingsState::open(slow_config(&path), SharedLock::new()).unwrap();
        state.insert("a", Some("1"), None).unwrap();

        let (tx, rx) = mpsc::channel();
        let observed = path.clone();
        state.drain(Some(Box::new(move || {
            tx.send(observed.exists()).unwrap();
        })));

        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        state.shutdown();
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_mutation_after_drain_needs_flush() {
        let dir = tempdir().unwrap();
        let state = SettingsState::open(
            slow_config(&dir.path().join("s.xml")),
            SharedLock::new(),
        )
        .unwrap();
        state.shutdown();

        state.insert("late", Some("1"), None).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(state.is_dirty());

        state.flush_now().unwrap();
        assert!(!state.is_dirty());
    }

    #[test]
    fn test_drop_flushes_dirty_state() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.xml");
        {
            let state = SettingsState::open(slow_config(&path), SharedLock::new()).unwrap();
            state.insert("a", Some("1"), None).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !path.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let state = SettingsState::open(slow_config(&path), SharedLock::new()).unwrap();
        assert_eq!(state.get("a").unwrap().value.as_deref(), Some("1"));
        state.shutdown();
    }

    #[test]
    fn test_quota_usage_reported() {
        let dir = tempdir().unwrap();
        let config = slow_config(&dir.path().join("s.xml")).quota(QuotaLimit::Limited(100));
        let state = SettingsState::open(config, SharedLock::new()).unwrap();

        state.insert("a", Some(&"x".repeat(60)), Some("app")).unwrap();
        assert_eq!(state.namespace_usage("app"), Some(60));

        let err = state
            .insert("b", Some(&"y".repeat(60)), Some("app"))
            .unwrap_err();
        assert!(err.is_quota_exceeded());
        assert!(state.get("b").is_none());
        state.shutdown();
    }

    #[test]
    fn test_remove_namespace_default_uses_config() {
        let dir = tempdir().unwrap();
        let config = slow_config(&dir.path().join("s.xml")).protect(["keep"]);
        let state = SettingsState::open(config, SharedLock::new()).unwrap();

        state.insert("keep", Some("1"), Some("app")).unwrap();
        state.insert("drop", Some("1"), Some("app")).unwrap();
        assert_eq!(state.remove_namespace_default("app"), 1);
        assert_eq!(state.names(), vec!["keep".to_string()]);
        state.shutdown();
    }

    #[test]
    fn test_debug_names_state_file() {
        let dir = tempdir().unwrap();
        let state = SettingsState::open(
            slow_config(&dir.path().join("s.xml")),
            SharedLock::new(),
        )
        .unwrap();

        let rendered = format!("{state:?}");
        assert!(rendered.contains("SettingsState"));
        assert!(rendered.contains("s.xml"));
        state.shutdown();
    }
}
