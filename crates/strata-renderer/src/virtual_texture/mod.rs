//! Virtual Texturing
//!
//! A very large virtual texture is split into fixed-size tiles across a mip
//! chain. Only tiles the GPU reports as needed are loaded from disk into a
//! small physical cache atlas; a per-mip page table maps each virtual tile to
//! its cache slot.
//!
//! Frame flow:
//! 1. Shaders sample through the page table and write missing tile ids into
//!    this frame's feedback buffer.
//! 2. [`VirtualTextureSystem::update`] reads back a completed frame's feedback,
//!    biases requests towards coarser mips under cache pressure, and queues loads.
//! 3. Loader workers read tiles from disk in the background.
//! 4. Finished tiles are copied into cache slots (evicting LRU) and the page
//!    table is updated and uploaded.

pub mod cache;
pub mod dds;
pub mod feedback;
pub mod page_table;
pub mod system;
pub mod tile_loader;

pub use cache::{SlotAllocation, VirtualTextureCache};
pub use feedback::VirtualTextureFeedback;
pub use page_table::VirtualTexturePageTable;
pub use system::{TileResidency, VirtualTextureStats, VirtualTextureSystem};
pub use tile_loader::{TileLoader, TileSource};

use std::fmt;
use std::path::{Path, PathBuf};

use bytemuck::{Pod, Zeroable};
use glam::Vec4;
use serde::{Deserialize, Serialize};

use crate::{RendererError, RendererResult};

/// Largest coordinate representable in a packed [`TileId`]
pub const MAX_TILE_COORD: u16 = 0x3FF;

/// Virtual tile address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TileId {
    pub x: u16,
    pub y: u16,
    pub mip_level: u8,
}

impl TileId {
    /// Create a tile id
    pub const fn new(x: u16, y: u16, mip_level: u8) -> Self {
        Self { x, y, mip_level }
    }

    /// Pack as `mip << 20 | y << 10 | x`, the encoding shaders write to feedback
    pub fn pack(&self) -> u32 {
        (u32::from(self.mip_level) << 20)
            | ((u32::from(self.y) & 0x3FF) << 10)
            | (u32::from(self.x) & 0x3FF)
    }

    /// Inverse of [`TileId::pack`]
    pub fn unpack(packed: u32) -> Self {
        Self {
            x: (packed & 0x3FF) as u16,
            y: ((packed >> 10) & 0x3FF) as u16,
            mip_level: (packed >> 20) as u8,
        }
    }

    /// The tile covering this one `levels` mips coarser, clamped to `max_mip`
    pub fn coarser(&self, levels: u8, max_mip: u8) -> Self {
        let target = self.mip_level.saturating_add(levels).min(max_mip);
        if target <= self.mip_level {
            return *self;
        }
        let shift = target - self.mip_level;
        Self {
            x: self.x >> shift,
            y: self.y >> shift,
            mip_level: target,
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, mip {})", self.x, self.y, self.mip_level)
    }
}

/// Virtual texture dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualTextureConfig {
    /// Virtual texture width and height in pixels
    pub virtual_size_pixels: u32,
    /// Tile width and height in pixels
    pub tile_size_pixels: u32,
    /// Physical cache atlas width and height in pixels
    pub cache_size_pixels: u32,
    /// Filtering border around each tile
    pub border_pixels: u32,
    /// Number of mip levels in the virtual texture
    pub max_mip_levels: u32,
}

impl Default for VirtualTextureConfig {
    fn default() -> Self {
        Self {
            virtual_size_pixels: 65536,
            tile_size_pixels: 128,
            cache_size_pixels: 4096,
            border_pixels: 4,
            max_mip_levels: 9,
        }
    }
}

impl VirtualTextureConfig {
    /// Tiles per axis at mip 0
    pub fn tiles_per_axis(&self) -> u32 {
        self.virtual_size_pixels / self.tile_size_pixels
    }

    /// Cache slots per axis
    pub fn cache_tiles_per_axis(&self) -> u32 {
        self.cache_size_pixels / self.tile_size_pixels
    }

    /// Total cache slots
    pub fn total_cache_slots(&self) -> u32 {
        let n = self.cache_tiles_per_axis();
        n * n
    }

    /// Tiles per axis at `mip`; zero beyond the last level
    pub fn tiles_at_mip(&self, mip: u32) -> u32 {
        self.tiles_per_axis().checked_shr(mip).unwrap_or(0)
    }

    /// Virtual pixels per world unit for a terrain of `terrain_size` world units
    pub fn world_to_virtual_scale(&self, terrain_size: f32) -> f32 {
        self.virtual_size_pixels as f32 / terrain_size
    }

    /// Check the dimensions describe a usable texture
    pub fn validate(&self) -> RendererResult<()> {
        if self.tile_size_pixels == 0 {
            return Err(RendererError::InvalidConfig("tile size must be non-zero".into()));
        }
        if self.max_mip_levels == 0 {
            return Err(RendererError::InvalidConfig("at least one mip level is required".into()));
        }
        if self.tiles_per_axis() == 0 || self.tiles_per_axis() > u32::from(MAX_TILE_COORD) + 1 {
            return Err(RendererError::InvalidConfig(format!(
                "{} tiles per axis does not fit the 10-bit tile encoding",
                self.tiles_per_axis()
            )));
        }
        if self.max_mip_levels > 16 {
            return Err(RendererError::InvalidConfig(format!(
                "{} mip levels exceeds the 16 supported",
                self.max_mip_levels
            )));
        }
        if self.tiles_at_mip(self.max_mip_levels - 1) == 0 {
            return Err(RendererError::InvalidConfig(format!(
                "mip {} has no tiles",
                self.max_mip_levels - 1
            )));
        }
        if self.total_cache_slots() == 0 {
            return Err(RendererError::InvalidConfig(
                "cache must hold at least one tile".into(),
            ));
        }
        Ok(())
    }
}

/// Page table entry for one virtual tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableEntry {
    pub cache_x: u16,
    pub cache_y: u16,
    pub valid: bool,
}

impl PageTableEntry {
    /// Pack for an RGBA8 texel: R = cache x, G = cache y, A = valid
    pub fn pack_rgba8(&self) -> u32 {
        (u32::from(self.valid) << 24)
            | ((u32::from(self.cache_y) & 0xFF) << 8)
            | (u32::from(self.cache_x) & 0xFF)
    }
}

/// One physical cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheSlot {
    pub tile_id: TileId,
    /// Update count of the last frame that sampled this slot
    pub last_used_frame: u64,
    pub occupied: bool,
}

/// Pixel formats tiles may be stored in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TileFormat {
    Rgba8,
    Bc1,
    Bc1Srgb,
    Bc4,
    Bc5,
    Bc7,
    Bc7Srgb,
}

impl TileFormat {
    /// Whether the format is block compressed
    pub fn is_compressed(&self) -> bool {
        !matches!(self, TileFormat::Rgba8)
    }

    /// Bytes per 4x4 block, or per pixel for RGBA8
    fn unit_bytes(&self) -> usize {
        match self {
            TileFormat::Rgba8 => 4,
            TileFormat::Bc1 | TileFormat::Bc1Srgb | TileFormat::Bc4 => 8,
            TileFormat::Bc5 | TileFormat::Bc7 | TileFormat::Bc7Srgb => 16,
        }
    }

    /// Bytes needed to store a `width` x `height` image
    pub fn data_size(&self, width: u32, height: u32) -> usize {
        if self.is_compressed() {
            width.div_ceil(4) as usize * height.div_ceil(4) as usize * self.unit_bytes()
        } else {
            width as usize * height as usize * self.unit_bytes()
        }
    }
}

/// Tile pixels produced by the loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedTile {
    pub id: TileId,
    pub pixels: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: TileFormat,
}

impl LoadedTile {
    /// Non-empty pixels and non-zero dimensions
    pub fn is_valid(&self) -> bool {
        !self.pixels.is_empty() && self.width > 0 && self.height > 0
    }
}

/// Uniform block consumed by virtual texture sampling shaders (std140, 64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct VtParamsUbo {
    /// xy = virtual size, zw = 1 / virtual size
    pub virtual_size_and_inverse: [f32; 4],
    /// xy = cache size, zw = 1 / cache size
    pub physical_cache_size_and_inverse: [f32; 4],
    /// x = tile size, y = border, z = tile size with both borders, w unused
    pub tile_size_and_border: [f32; 4],
    pub max_mip_level: u32,
    pub _pad: [u32; 3],
}

impl VtParamsUbo {
    /// Build shader parameters for `config`
    pub fn from_config(config: &VirtualTextureConfig) -> Self {
        let virtual_size = config.virtual_size_pixels as f32;
        let cache_size = config.cache_size_pixels as f32;
        let tile = config.tile_size_pixels as f32;
        let border = config.border_pixels as f32;

        Self {
            virtual_size_and_inverse: Vec4::new(
                virtual_size,
                virtual_size,
                1.0 / virtual_size,
                1.0 / virtual_size,
            )
            .to_array(),
            physical_cache_size_and_inverse: Vec4::new(
                cache_size,
                cache_size,
                1.0 / cache_size,
                1.0 / cache_size,
            )
            .to_array(),
            tile_size_and_border: Vec4::new(tile, border, tile + 2.0 * border, 0.0).to_array(),
            max_mip_level: config.max_mip_levels.saturating_sub(1),
            _pad: [0; 3],
        }
    }
}

/// Everything needed to build a [`VirtualTextureSystem`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualTextureSettings {
    /// Texture and cache dimensions
    pub config: VirtualTextureConfig,
    /// Root directory holding `mip{n}/tile_{x}_{y}.{dds|png}`
    pub tile_path: PathBuf,
    /// Frames the CPU may record ahead of the GPU
    pub frames_in_flight: u32,
    /// Tile loader worker threads
    pub loader_workers: usize,
    /// Capacity of each feedback buffer in tile ids
    pub feedback_entries: u32,
    /// Store the cache atlas as BC1 instead of RGBA8
    pub use_compression: bool,
}

impl Default for VirtualTextureSettings {
    fn default() -> Self {
        Self {
            config: VirtualTextureConfig::default(),
            tile_path: PathBuf::from("assets/virtual_texture"),
            frames_in_flight: strata_core::DEFAULT_FRAMES_IN_FLIGHT,
            loader_workers: 2,
            feedback_entries: feedback::DEFAULT_MAX_ENTRIES,
            use_compression: false,
        }
    }
}

impl VirtualTextureSettings {
    /// Load settings from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> RendererResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&text)?;
        settings.config.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_id_pack_round_trip() {
        for id in [
            TileId::new(0, 0, 0),
            TileId::new(127, 255, 8),
            TileId::new(1023, 1023, 15),
            TileId::new(50, 75, 3),
        ] {
            assert_eq!(TileId::unpack(id.pack()), id);
        }
    }

    #[test]
    fn test_tile_id_pack_layout() {
        assert_eq!(TileId::new(5, 3, 2).pack(), (2 << 20) | (3 << 10) | 5);
        assert_ne!(TileId::new(1, 0, 0).pack(), TileId::new(0, 1, 0).pack());
        assert_ne!(TileId::new(0, 0, 1).pack(), TileId::new(0, 0, 0).pack());
    }

    #[test]
    fn test_tile_id_coarser() {
        let id = TileId::new(13, 6, 1);
        assert_eq!(id.coarser(2, 8), TileId::new(3, 1, 3));
        assert_eq!(id.coarser(0, 8), id);
        // Clamped at the last mip; the shift uses the actual delta
        assert_eq!(id.coarser(5, 2), TileId::new(6, 3, 2));
    }

    #[test]
    fn test_config_defaults() {
        let config = VirtualTextureConfig::default();
        assert_eq!(config.virtual_size_pixels, 65536);
        assert_eq!(config.tile_size_pixels, 128);
        assert_eq!(config.cache_size_pixels, 4096);
        assert_eq!(config.border_pixels, 4);
        assert_eq!(config.max_mip_levels, 9);
        assert_eq!(config.tiles_per_axis(), 512);
        assert_eq!(config.cache_tiles_per_axis(), 32);
        assert_eq!(config.total_cache_slots(), 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tiles_at_mip() {
        let config = VirtualTextureConfig {
            virtual_size_pixels: 1024,
            max_mip_levels: 4,
            ..Default::default()
        };
        assert_eq!(config.tiles_at_mip(0), 8);
        assert_eq!(config.tiles_at_mip(1), 4);
        assert_eq!(config.tiles_at_mip(2), 2);
        assert_eq!(config.tiles_at_mip(3), 1);
        assert_eq!(config.tiles_at_mip(4), 0);
        assert_eq!(config.tiles_at_mip(40), 0);
    }

    #[test]
    fn test_world_to_virtual_scale() {
        let config = VirtualTextureConfig::default();
        assert!((config.world_to_virtual_scale(16384.0) - 4.0).abs() < f32::EPSILON);
        assert!((config.world_to_virtual_scale(32768.0) - 2.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_config_validation() {
        let too_many_mips = VirtualTextureConfig {
            virtual_size_pixels: 1024,
            max_mip_levels: 5,
            ..Default::default()
        };
        assert!(too_many_mips.validate().is_err());

        let too_large = VirtualTextureConfig {
            virtual_size_pixels: 1 << 18,
            ..Default::default()
        };
        assert!(too_large.validate().is_err());

        let no_cache = VirtualTextureConfig {
            cache_size_pixels: 64,
            ..Default::default()
        };
        assert!(no_cache.validate().is_err());
    }

    #[test]
    fn test_page_table_entry_packing() {
        assert_eq!(PageTableEntry::default().pack_rgba8(), 0);

        let entry = PageTableEntry {
            cache_x: 5,
            cache_y: 10,
            valid: true,
        };
        assert_eq!(entry.pack_rgba8(), 0x01000A05);

        let max = PageTableEntry {
            cache_x: 255,
            cache_y: 255,
            valid: true,
        };
        assert_eq!(max.pack_rgba8(), 0x0100FFFF);
    }

    #[test]
    fn test_tile_format_sizes() {
        assert_eq!(TileFormat::Rgba8.data_size(128, 128), 128 * 128 * 4);
        assert_eq!(TileFormat::Bc1.data_size(128, 128), 32 * 32 * 8);
        assert_eq!(TileFormat::Bc4.data_size(6, 6), 4 * 8);
        assert_eq!(TileFormat::Bc5.data_size(128, 128), 32 * 32 * 16);
        assert_eq!(TileFormat::Bc7Srgb.data_size(4, 4), 16);
        assert!(!TileFormat::Rgba8.is_compressed());
        assert!(TileFormat::Bc1Srgb.is_compressed());
    }

    #[test]
    fn test_loaded_tile_validity() {
        let mut tile = LoadedTile {
            id: TileId::default(),
            pixels: Vec::new(),
            width: 0,
            height: 0,
            format: TileFormat::Rgba8,
        };
        assert!(!tile.is_valid());
        tile.pixels = vec![0; 16];
        assert!(!tile.is_valid());
        tile.width = 2;
        assert!(!tile.is_valid());
        tile.height = 2;
        assert!(tile.is_valid());
    }

    #[test]
    fn test_params_ubo() {
        assert_eq!(std::mem::size_of::<VtParamsUbo>(), 64);

        let params = VtParamsUbo::from_config(&VirtualTextureConfig::default());
        assert_eq!(params.virtual_size_and_inverse[0], 65536.0);
        assert_eq!(params.virtual_size_and_inverse[2], 1.0 / 65536.0);
        assert_eq!(params.physical_cache_size_and_inverse[1], 4096.0);
        assert_eq!(params.tile_size_and_border, [128.0, 4.0, 136.0, 0.0]);
        assert_eq!(params.max_mip_level, 8);
        assert_eq!(bytemuck::bytes_of(&params).len(), 64);
    }

    #[test]
    fn test_settings_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vt.json");
        std::fs::write(
            &path,
            r#"{ "config": { "cache_size_pixels": 2048 }, "frames_in_flight": 3, "use_compression": true }"#,
        )
        .unwrap();

        let settings = VirtualTextureSettings::from_json_file(&path).unwrap();
        assert_eq!(settings.config.cache_size_pixels, 2048);
        assert_eq!(settings.config.tile_size_pixels, 128);
        assert_eq!(settings.frames_in_flight, 3);
        assert!(settings.use_compression);
        assert_eq!(settings.loader_workers, 2);
    }

    #[test]
    fn test_settings_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vt.json");
        std::fs::write(&path, r#"{ "config": { "tile_size_pixels": 0 } }"#).unwrap();
        assert!(VirtualTextureSettings::from_json_file(&path).is_err());
    }
}
