//! Crash-safe replacement of a whole file
//!
//! Write protocol:
//! 1. Write and fsync `<file>.tmp` next to the target
//! 2. Move the current target aside to `<file>.bak`
//! 3. Rename `<file>.tmp` over the target, fsync the directory
//! 4. Remove `<file>.bak`
//!
//! A failure in step 1 leaves the target and any backup untouched. A
//! backup that survives to the next read means the last write never
//! completed; the backup is restored and wins.

use setstore_common::{Error, Result};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A file replaced atomically on every write
#[derive(Debug, Clone)]
pub struct AtomicFile {
    path: PathBuf,
    tmp_path: PathBuf,
    backup_path: PathBuf,
}

impl AtomicFile {
    /// Wrap the given target path. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            tmp_path: sibling(&path, "tmp"),
            backup_path: sibling(&path, "bak"),
            path,
        }
    }

    /// Target path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the in-progress write
    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    /// Path of the previous version kept during a write
    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Check if either the target or a pending backup exists
    pub fn exists(&self) -> bool {
        self.path.exists() || self.backup_path.exists()
    }

    /// Read the last complete version, restoring the backup if needed.
    ///
    /// Returns `None` when no version has ever been written.
    pub fn read(&self) -> Result<Option<Vec<u8>>> {
        if self.backup_path.exists() {
            warn!(
                "Found backup {:?}, previous write did not complete; restoring",
                self.backup_path
            );
            fs::rename(&self.backup_path, &self.path).map_err(|e| {
                Error::persistence(format!(
                    "failed to restore backup {}: {e}",
                    self.backup_path.display()
                ))
            })?;
        }

        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Replace the file contents with `bytes`
    pub fn write(&self, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = self.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::persistence(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        if let Err(e) = self.write_tmp(bytes) {
            if let Err(cleanup) = fs::remove_file(&self.tmp_path)
                && cleanup.kind() != ErrorKind::NotFound
            {
                debug!("Failed to remove {:?}: {}", self.tmp_path, cleanup);
            }
            return Err(e);
        }

        if self.path.exists() {
            if self.backup_path.exists() {
                // The backup is the last good version; the target is suspect.
                fs::remove_file(&self.path).map_err(|e| {
                    Error::persistence(format!("failed to drop {}: {e}", self.path.display()))
                })?;
            } else {
                fs::rename(&self.path, &self.backup_path).map_err(|e| {
                    Error::persistence(format!(
                        "failed to back up {}: {e}",
                        self.path.display()
                    ))
                })?;
            }
        }

        fs::rename(&self.tmp_path, &self.path).map_err(|e| {
            Error::persistence(format!(
                "failed to rename {} into place: {e}",
                self.tmp_path.display()
            ))
        })?;

        self.sync_parent();

        if let Err(e) = fs::remove_file(&self.backup_path)
            && e.kind() != ErrorKind::NotFound
        {
            warn!("Failed to remove backup {:?}: {}", self.backup_path, e);
        }

        Ok(())
    }

    /// Remove the target and any leftovers
    pub fn delete(&self) -> Result<()> {
        for path in [&self.path, &self.tmp_path, &self.backup_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(())
    }

    fn write_tmp(&self, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.tmp_path)
            .map_err(|e| {
                Error::persistence(format!("failed to create {}: {e}", self.tmp_path.display()))
            })?;

        file.write_all(bytes).map_err(|e| {
            Error::persistence(format!("failed to write {}: {e}", self.tmp_path.display()))
        })?;

        file.sync_all().map_err(|e| {
            Error::persistence(format!("failed to sync {}: {e}", self.tmp_path.display()))
        })
    }

    fn parent(&self) -> Option<&Path> {
        self.path.parent().filter(|p| !p.as_os_str().is_empty())
    }

    #[cfg(unix)]
    fn sync_parent(&self) {
        let dir = self.parent().unwrap_or_else(|| Path::new("."));
        if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
            debug!("Failed to sync directory {:?}: {}", dir, e);
        }
    }

    #[cfg(not(unix))]
    fn sync_parent(&self) {}
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}
