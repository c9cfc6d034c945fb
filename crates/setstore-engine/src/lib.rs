//! Setstore Engine - settings table with debounced persistence
//!
//! An in-memory table of named settings, mutated synchronously under a
//! caller-shared lock and written to disk in the background.
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SettingsState                         │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │   Table (entries, ids, quota, dirty bookkeeping)    ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                          │ snapshot (under SharedLock)   │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │   WriteScheduler (debounce timer, worker thread)    ││
//! │  └─────────────────────────────────────────────────────┘│
//! │                          │ encode                        │
//! │  ┌─────────────────────────────────────────────────────┐│
//! │  │   AtomicFile (tmp + backup + rename)                ││
//! │  └─────────────────────────────────────────────────────┘│
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Write Path
//! 1. Mutate the table under the shared lock
//! 2. Mark dirty and (re-)arm the debounce timer
//! 3. Worker snapshots under the lock, encodes and writes outside it
//!
//! # Recovery
//! 1. Restore an interrupted write from the backup file
//! 2. Decode the state file; reject it outright if malformed
//! 3. Resume id assignment above the highest persisted id

pub mod atomic_file;
pub mod codec;
pub mod lock;
pub mod quota;
pub mod scheduler;
pub mod state;
pub mod table;

pub use atomic_file::AtomicFile;
pub use codec::{CodecError, DecodedState};
pub use lock::{SharedGuard, SharedLock};
pub use quota::QuotaTracker;
pub use scheduler::{DebouncePolicy, DrainCallback, Flush, WriteScheduler};
pub use state::{SettingsState, StateStats, WriteState};
pub use table::{Snapshot, Table};
