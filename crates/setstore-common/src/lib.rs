//! Setstore Common - Shared types and utilities
//!
//! This crate provides the setting model, configuration structures and
//! error definitions used by the persistence engine and its tooling.

pub mod config;
pub mod error;
pub mod types;

pub use config::{SchedulerConfig, StoreConfig};
pub use error::{Error, Result};
pub use types::*;
