//! # Strata Terrain
//!
//! Heightmap terrain tiles streamed around the camera.
//!
//! ## Features
//! - LOD-ringed tile residency driven by camera distance
//! - Background height loads on the core streaming worker pool
//! - Tile cache preprocessing from a 16-bit heightmap (raw or PNG tiles)
//! - Procedural fBm fallback when no cache is configured
//! - Height queries against the finest loaded tile

pub mod importer;
pub mod metadata;
pub mod streaming;
pub mod tile;

pub use importer::{ImportSummary, TerrainImportConfig, TerrainImporter};
pub use metadata::CacheMetadata;
pub use streaming::{
    DeviceTileUploader, LodLevelConfig, TerrainStreamingConfig, TerrainStreamingManager,
    TerrainStreamingStats, TileGpuResource, TileUploader,
};
pub use tile::{TerrainTile, TerrainTileConfig, TileCacheFormat, TileCoord, TileLoadState};

use thiserror::Error;

/// Terrain errors
#[derive(Error, Debug)]
pub enum TerrainError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid heightmap: {0}")]
    InvalidHeightmap(String),

    #[error("Invalid tile cache: {0}")]
    InvalidCache(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Platform error: {0}")]
    Platform(#[from] strata_platform::PlatformError),

    #[error("Core error: {0}")]
    Core(#[from] strata_core::CoreError),

    #[error("Renderer error: {0}")]
    Renderer(#[from] strata_renderer::RendererError),
}

/// Result type for terrain operations
pub type TerrainResult<T> = Result<T, TerrainError>;
