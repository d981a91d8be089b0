//! # Strata Core
//!
//! Runtime primitives shared by the virtual texture and terrain streaming systems.
//!
//! This crate provides:
//! - **Frame pipelining**: Per-frame-in-flight resource slots and fence completion tokens
//! - **Streaming**: Priority-ordered worker pool for background tile loads
//! - **Memory**: Byte accounting against max/target budgets

pub mod frame;
pub mod memory;
pub mod streaming;

pub use frame::{FrameCompletion, FrameCounter, FrameFence, FrameSlots};
pub use memory::{MemoryBudget, MemoryStats};
pub use streaming::{LoadPriority, StreamingBudget, StreamingManager};

use thiserror::Error;

/// Core runtime errors
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Fence wait failed for frame {frame_index}: {reason}")]
    FenceWait { frame_index: u32, reason: String },

    #[error("Platform error: {0}")]
    Platform(#[from] strata_platform::PlatformError),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;

/// Default number of frames the CPU may record ahead of the GPU
pub const DEFAULT_FRAMES_IN_FLIGHT: u32 = 2;
