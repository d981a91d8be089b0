//! # Strata Platform
//!
//! Thin platform layer shared by the streaming crates.
//!
//! This crate provides:
//! - **Threading**: Named OS worker threads with fallible spawning
//! - **FileSystem**: Existence, size, canonical path and read helpers for tile caches
//! - **Timers**: Scoped timers that report through `tracing`, rolling averages

pub mod filesystem;
pub mod threading;
pub mod timer;

pub use filesystem::FileSystem;
pub use threading::Thread;
pub use timer::{HighResTimer, RollingTimer, ScopedTimer};

use thiserror::Error;

/// Platform-specific errors
#[derive(Error, Debug)]
pub enum PlatformError {
    #[error("File I/O error: {0}")]
    FileIO(#[from] std::io::Error),

    #[error("Thread spawn failed: {0}")]
    ThreadSpawn(String),

    #[error("Thread panicked: {0}")]
    ThreadPanicked(String),
}

/// Result type for platform operations
pub type PlatformResult<T> = Result<T, PlatformError>;

/// Number of hardware threads, falling back to `fallback` when unknown
pub fn available_cores(fallback: usize) -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(fallback)
}
