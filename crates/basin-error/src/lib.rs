#![forbid(unsafe_code)]
//! Error types for the basin file pool.
//!
//! Defines `PoolError` and a `Result<T>` alias used throughout the
//! workspace. Fatal startup conditions (validation, scan, manifest
//! corruption, disk exhaustion) are distinct variants from runtime
//! errors so the bootstrap can refuse to start while callers on the
//! hot path retry or degrade.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for all pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pool manifest missing or corrupt: {0}")]
    Manifest(String),

    #[error("pool directory scan failed: {0}")]
    Scan(String),

    #[error("not enough free disk space: need {needed} bytes, {available} available")]
    DiskFull { needed: u64, available: u64 },

    #[error("target file already exists: {}", .0.display())]
    TargetExists(PathBuf),

    #[error("file pool exhausted")]
    Exhausted,

    #[error("background format failed")]
    FormatFailed,

    #[error("invalid configuration: {field} ({reason})")]
    Validation {
        field: &'static str,
        reason: &'static str,
    },
}

/// Result alias using [`PoolError`].
pub type Result<T> = std::result::Result<T, PoolError>;
