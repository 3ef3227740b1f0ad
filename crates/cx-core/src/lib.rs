//! Core types and utilities for cloudexec
//!
//! # Modules
//!
//! - `config`: Settings file, environment overrides and secret references
//! - `error`: Error types and Result alias
//! - `identity`: Per-user naming of buckets, instances and tags

pub mod config;
pub mod error;
pub mod identity;

// Re-exports
pub use config::{ConsistencyMode, DigitalOceanSettings, Settings, StateSettings};
pub use error::{ConfigError, Result};
pub use identity::Identity;
