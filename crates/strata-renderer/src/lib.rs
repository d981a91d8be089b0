//! # Strata Renderer
//!
//! Renderer-side streaming for large terrain textures.
//!
//! ## Features
//! - GPU backend boundary (`GpuDevice` / `CommandRecorder`) with a headless CPU backend
//! - Virtual texturing: feedback-driven tile requests, asynchronous tile loading,
//!   LRU physical cache, per-mip page table indirection
//! - Budget-driven mip bias that trades detail for cache headroom

pub mod gpu;
pub mod virtual_texture;

pub use gpu::{CommandList, CommandRecorder, GpuDevice, HeadlessDevice};
pub use virtual_texture::{
    TileFormat, TileId, VirtualTextureConfig, VirtualTextureSettings, VirtualTextureSystem,
};

use thiserror::Error;

/// Renderer errors
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("GPU resource creation failed: {0}")]
    ResourceCreation(String),

    #[error("Invalid resource handle: {0}")]
    InvalidHandle(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Invalid image layout: {0}")]
    InvalidLayout(String),

    #[error("Buffer is not host visible: {0}")]
    NotHostVisible(String),

    #[error("Tile rejected: {0}")]
    TileRejected(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid DDS file: {0}")]
    InvalidDds(String),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Core error: {0}")]
    Core(#[from] strata_core::CoreError),

    #[error("Platform error: {0}")]
    Platform(#[from] strata_platform::PlatformError),
}

/// Result type for renderer operations
pub type RendererResult<T> = Result<T, RendererError>;
