//! Terrain Tiles
//!
//! A tile covers `base_tile_size * 2^lod` world units on each side and holds a
//! `heightmap_resolution`² grid of normalized heights. Heights come from the
//! preprocessed tile cache when one is configured, otherwise from procedural fBm.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use glam::{Vec2, Vec3};
use noise::{Fbm, MultiFractal, NoiseFn, Perlin};
use serde::{Deserialize, Serialize};

use crate::streaming::TileGpuResource;
use crate::{TerrainError, TerrainResult};

/// On-disk encoding of cached tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TileCacheFormat {
    /// `u32 res_x, u32 res_z` header followed by little-endian `u16` heights
    #[default]
    Raw,
    /// 16-bit grayscale PNG
    Png,
}

impl TileCacheFormat {
    /// File extension without the dot
    pub fn extension(&self) -> &'static str {
        match self {
            TileCacheFormat::Raw => "raw",
            TileCacheFormat::Png => "png",
        }
    }
}

/// Per-tile parameters shared by every tile of a terrain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainTileConfig {
    /// World size of a LOD 0 tile
    pub base_tile_size: f32,
    /// Height samples per tile edge
    pub heightmap_resolution: u32,
    pub min_altitude: f32,
    pub max_altitude: f32,
    /// Preprocessed tile cache; `None` selects procedural heights
    pub cache_directory: Option<PathBuf>,
    pub cache_format: TileCacheFormat,
}

impl TerrainTileConfig {
    /// Altitude range covered by normalized heights
    pub fn height_scale(&self) -> f32 {
        self.max_altitude - self.min_altitude
    }

    /// World size of a tile at `lod`
    pub fn tile_size(&self, lod: u32) -> f32 {
        self.base_tile_size * (1u64 << lod) as f32
    }

    /// Reject empty tiles and inverted altitude ranges
    pub fn validate(&self) -> TerrainResult<()> {
        if self.heightmap_resolution < 2 {
            return Err(TerrainError::InvalidConfig(format!(
                "heightmap resolution must be at least 2, got {}",
                self.heightmap_resolution
            )));
        }
        if self.base_tile_size <= 0.0 {
            return Err(TerrainError::InvalidConfig(format!(
                "base tile size must be positive, got {}",
                self.base_tile_size
            )));
        }
        Ok(())
    }
}

impl Default for TerrainTileConfig {
    fn default() -> Self {
        Self {
            base_tile_size: 256.0,
            heightmap_resolution: 129,
            min_altitude: 0.0,
            max_altitude: 200.0,
            cache_directory: None,
            cache_format: TileCacheFormat::Raw,
        }
    }
}

/// Tile grid coordinate; `x` and `z` are in units of the tile size at `lod`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i32,
    pub z: i32,
    pub lod: u32,
}

impl TileCoord {
    pub fn new(x: i32, z: i32, lod: u32) -> Self {
        Self { x, z, lod }
    }

    /// Tile containing a world position
    pub fn from_world(world_x: f32, world_z: f32, tile_size: f32) -> Self {
        Self {
            x: (world_x / tile_size).floor() as i32,
            z: (world_z / tile_size).floor() as i32,
            lod: 0,
        }
    }

    /// Same position with a different LOD
    pub fn with_lod(mut self, lod: u32) -> Self {
        self.lod = lod;
        self
    }
}

impl std::fmt::Display for TileCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, lod {})", self.x, self.z, self.lod)
    }
}

/// Residency of a terrain tile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TileLoadState {
    Unloaded,
    /// Height load queued or running on a worker, or waiting for GPU upload
    Loading,
    Loaded,
}

/// Path of a cached tile inside `cache_dir`
pub fn tile_path(cache_dir: &Path, coord: TileCoord, format: TileCacheFormat) -> PathBuf {
    cache_dir.join(format!(
        "tile_{}_{}_lod{}.{}",
        coord.x,
        coord.z,
        coord.lod,
        format.extension()
    ))
}

/// Heights for `coord`: the cached tile if present and well formed, procedural otherwise
pub fn load_heights(coord: TileCoord, config: &TerrainTileConfig) -> TerrainResult<Vec<f32>> {
    if let Some(cache_dir) = &config.cache_directory {
        let path = tile_path(cache_dir, coord, config.cache_format);
        if path.is_file() {
            let loaded = match config.cache_format {
                TileCacheFormat::Raw => read_raw_tile(&path, config.heightmap_resolution),
                TileCacheFormat::Png => read_png_tile(&path, config.heightmap_resolution),
            };
            match loaded {
                Ok(heights) => return Ok(heights),
                Err(e) => log::warn!("Failed to load tile cache {}: {}", path.display(), e),
            }
        } else {
            log::debug!("Tile {} not in cache, generating", coord);
        }
    }

    Ok(procedural_heights(coord, config))
}

/// Read a raw cached tile, normalizing heights to [0, 1]
pub fn read_raw_tile(path: &Path, resolution: u32) -> TerrainResult<Vec<f32>> {
    let mut file = std::fs::File::open(path)?;
    let mut header = [0u8; 8];
    file.read_exact(&mut header)?;
    let res_x = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let res_z = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if res_x != resolution || res_z != resolution {
        return Err(TerrainError::InvalidCache(format!(
            "tile is {}x{}, expected {}x{}",
            res_x, res_z, resolution, resolution
        )));
    }

    let count = (resolution * resolution) as usize;
    let mut bytes = vec![0u8; count * 2];
    file.read_exact(&mut bytes)?;

    Ok(bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]) as f32 / 65535.0)
        .collect())
}

/// Read a 16-bit grayscale PNG tile, normalizing heights to [0, 1]
pub fn read_png_tile(path: &Path, resolution: u32) -> TerrainResult<Vec<f32>> {
    let image = image::open(path)?.to_luma16();
    if image.width() != resolution || image.height() != resolution {
        return Err(TerrainError::InvalidCache(format!(
            "tile is {}x{}, expected {}x{}",
            image.width(),
            image.height(),
            resolution,
            resolution
        )));
    }
    Ok(image.as_raw().iter().map(|&h| h as f32 / 65535.0).collect())
}

fn octave_noise(octaves: usize, frequency: f64) -> Fbm<Perlin> {
    Fbm::<Perlin>::new(0)
        .set_octaves(octaves)
        .set_frequency(frequency)
        .set_persistence(0.5)
}

/// Layered fBm heights sampled on the tile's world-space grid
pub fn procedural_heights(coord: TileCoord, config: &TerrainTileConfig) -> Vec<f32> {
    let res = config.heightmap_resolution;
    let tile_size = config.tile_size(coord.lod);
    let min_x = coord.x as f32 * tile_size;
    let min_z = coord.z as f32 * tile_size;
    let step = tile_size / (res - 1) as f32;

    let layers = [
        (octave_noise(6, 0.002), 0.7),
        (octave_noise(4, 0.01), 0.2),
        (octave_noise(3, 0.05), 0.1),
    ];

    let mut heights = Vec::with_capacity((res * res) as usize);
    for z in 0..res {
        for x in 0..res {
            let point = [
                (min_x + x as f32 * step) as f64,
                (min_z + z as f32 * step) as f64,
            ];
            let height: f64 = layers
                .iter()
                .map(|(fbm, weight)| (fbm.get(point) * 0.5 + 0.5).clamp(0.0, 1.0) * weight)
                .sum();
            heights.push(height as f32);
        }
    }
    heights
}

/// A streamed terrain tile
#[derive(Debug)]
pub struct TerrainTile {
    coord: TileCoord,
    config: Arc<TerrainTileConfig>,
    tile_size: f32,
    world_min: Vec2,
    heights: Vec<f32>,
    state: TileLoadState,
    last_access_frame: u64,
    gpu: Option<TileGpuResource>,
}

impl TerrainTile {
    /// Unloaded tile at `coord`
    pub fn new(coord: TileCoord, config: Arc<TerrainTileConfig>) -> Self {
        let tile_size = config.tile_size(coord.lod);
        Self {
            coord,
            tile_size,
            world_min: Vec2::new(coord.x as f32 * tile_size, coord.z as f32 * tile_size),
            config,
            heights: Vec::new(),
            state: TileLoadState::Unloaded,
            last_access_frame: 0,
            gpu: None,
        }
    }

    pub fn coord(&self) -> TileCoord {
        self.coord
    }

    pub fn lod(&self) -> u32 {
        self.coord.lod
    }

    pub fn config(&self) -> &TerrainTileConfig {
        &self.config
    }

    /// World size of this tile
    pub fn tile_size(&self) -> f32 {
        self.tile_size
    }

    /// World-space (x, z) of the tile's minimum corner
    pub fn world_min(&self) -> Vec2 {
        self.world_min
    }

    /// Center of the tile footprint in world XZ
    pub fn world_center(&self) -> Vec2 {
        self.world_min + Vec2::splat(self.tile_size * 0.5)
    }

    /// Current load state
    pub fn load_state(&self) -> TileLoadState {
        self.state
    }

    pub(crate) fn set_load_state(&mut self, state: TileLoadState) {
        self.state = state;
    }

    /// Normalized heights, row-major by z; empty until loaded
    pub fn heights(&self) -> &[f32] {
        &self.heights
    }

    pub(crate) fn set_heights(&mut self, heights: Vec<f32>) -> TerrainResult<()> {
        let expected = (self.config.heightmap_resolution * self.config.heightmap_resolution) as usize;
        if heights.len() != expected {
            return Err(TerrainError::InvalidHeightmap(format!(
                "tile {} got {} heights, expected {}",
                self.coord,
                heights.len(),
                expected
            )));
        }
        self.heights = heights;
        Ok(())
    }

    /// Load heights synchronously from the cache or the procedural fallback
    pub fn load_height_data(&mut self) -> TerrainResult<()> {
        let heights = load_heights(self.coord, &self.config)?;
        self.set_heights(heights)
    }

    /// Altitude at tile-local (x, z), bilinearly filtered and clamped to the tile
    pub fn height_at(&self, local_x: f32, local_z: f32) -> f32 {
        let res = self.config.heightmap_resolution as usize;
        if self.heights.len() != res * res {
            return self.config.min_altitude;
        }

        let u = (local_x / self.tile_size).clamp(0.0, 1.0);
        let v = (local_z / self.tile_size).clamp(0.0, 1.0);
        let fx = u * (res - 1) as f32;
        let fz = v * (res - 1) as f32;

        let x0 = fx as usize;
        let z0 = fz as usize;
        let x1 = (x0 + 1).min(res - 1);
        let z1 = (z0 + 1).min(res - 1);
        let tx = fx - x0 as f32;
        let tz = fz - z0 as f32;

        let h = |x: usize, z: usize| self.heights[z * res + x];
        let h0 = h(x0, z0) + (h(x1, z0) - h(x0, z0)) * tx;
        let h1 = h(x0, z1) + (h(x1, z1) - h(x0, z1)) * tx;
        let normalized = h0 + (h1 - h0) * tz;

        self.config.min_altitude + normalized * self.config.height_scale()
    }

    /// Altitude at a world position inside this tile
    pub fn height_at_world(&self, world_x: f32, world_z: f32) -> f32 {
        self.height_at(world_x - self.world_min.x, world_z - self.world_min.y)
    }

    /// Bytes of GPU memory used by the height image
    pub fn gpu_memory_usage(&self) -> usize {
        let res = self.config.heightmap_resolution as usize;
        res * res * std::mem::size_of::<f32>()
    }

    /// Horizontal distance from the camera to the tile center
    pub fn distance_to_camera(&self, camera: Vec3) -> f32 {
        self.world_center().distance(Vec2::new(camera.x, camera.z))
    }

    /// Frame the tile was last visible
    pub fn last_access_frame(&self) -> u64 {
        self.last_access_frame
    }

    /// Record that the tile was visible on `frame`
    pub fn mark_accessed(&mut self, frame: u64) {
        self.last_access_frame = frame;
    }

    /// GPU image holding the heights, once uploaded
    pub fn gpu_resource(&self) -> Option<&TileGpuResource> {
        self.gpu.as_ref()
    }

    pub(crate) fn set_gpu_resource(&mut self, resource: TileGpuResource) {
        self.gpu = Some(resource);
    }

    pub(crate) fn take_gpu_resource(&mut self) -> Option<TileGpuResource> {
        self.gpu.take()
    }

    /// Drop heights and return to `Unloaded`
    pub(crate) fn reset(&mut self) {
        self.heights = Vec::new();
        self.gpu = None;
        self.state = TileLoadState::Unloaded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> TerrainTileConfig {
        TerrainTileConfig {
            base_tile_size: 64.0,
            heightmap_resolution: 5,
            min_altitude: 10.0,
            max_altitude: 110.0,
            ..Default::default()
        }
    }

    fn write_raw(path: &Path, res_x: u32, res_z: u32, heights: &[u16]) {
        let mut bytes = Vec::new();
        bytes.extend(res_x.to_le_bytes());
        bytes.extend(res_z.to_le_bytes());
        for h in heights {
            bytes.extend(h.to_le_bytes());
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_tile_geometry() {
        let config = Arc::new(small_config());
        let tile = TerrainTile::new(TileCoord::new(-2, 3, 1), config);

        assert_eq!(tile.tile_size(), 128.0);
        assert_eq!(tile.world_min(), Vec2::new(-256.0, 384.0));
        assert_eq!(tile.world_center(), Vec2::new(-192.0, 448.0));
        assert_eq!(tile.gpu_memory_usage(), 5 * 5 * 4);
        assert_eq!(tile.load_state(), TileLoadState::Unloaded);

        let camera = Vec3::new(-192.0, 1000.0, 448.0 + 30.0);
        assert!((tile.distance_to_camera(camera) - 30.0).abs() < 1e-4);
    }

    #[test]
    fn test_coord_from_world_floors() {
        assert_eq!(TileCoord::from_world(10.0, 10.0, 64.0), TileCoord::new(0, 0, 0));
        assert_eq!(TileCoord::from_world(-0.5, 64.0, 64.0), TileCoord::new(-1, 1, 0));
        assert_eq!(
            TileCoord::from_world(-129.0, -1.0, 64.0).with_lod(2),
            TileCoord::new(-3, -1, 2)
        );
    }

    #[test]
    fn test_tile_path() {
        let path = tile_path(Path::new("cache"), TileCoord::new(-1, 4, 2), TileCacheFormat::Png);
        assert_eq!(path, Path::new("cache").join("tile_-1_4_lod2.png"));
    }

    #[test]
    fn test_procedural_heights_normalized_and_deterministic() {
        let config = small_config();
        let coord = TileCoord::new(3, -7, 0);
        let a = procedural_heights(coord, &config);
        let b = procedural_heights(coord, &config);

        assert_eq!(a.len(), 25);
        assert_eq!(a, b);
        assert!(a.iter().all(|h| (0.0..=1.0).contains(h)));
    }

    #[test]
    fn test_procedural_edges_match_neighbors() {
        let config = small_config();
        let left = procedural_heights(TileCoord::new(0, 0, 0), &config);
        let right = procedural_heights(TileCoord::new(1, 0, 0), &config);

        for z in 0..5 {
            assert!((left[z * 5 + 4] - right[z * 5]).abs() < 1e-5);
        }
    }

    #[test]
    fn test_raw_cache_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = TerrainTileConfig {
            heightmap_resolution: 2,
            cache_directory: Some(dir.path().to_path_buf()),
            ..small_config()
        };
        let coord = TileCoord::new(1, 2, 0);
        write_raw(
            &tile_path(dir.path(), coord, TileCacheFormat::Raw),
            2,
            2,
            &[0, 65535, 32768, 0],
        );

        let heights = load_heights(coord, &config).unwrap();
        assert_eq!(heights[0], 0.0);
        assert_eq!(heights[1], 1.0);
        assert!((heights[2] - 0.5).abs() < 1e-4);
    }

    #[test]
    fn test_raw_resolution_mismatch_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = TerrainTileConfig {
            cache_directory: Some(dir.path().to_path_buf()),
            ..small_config()
        };
        let coord = TileCoord::new(0, 0, 0);
        let path = tile_path(dir.path(), coord, TileCacheFormat::Raw);
        write_raw(&path, 2, 2, &[1, 2, 3, 4]);

        assert!(matches!(read_raw_tile(&path, 5), Err(TerrainError::InvalidCache(_))));
        assert_eq!(
            load_heights(coord, &config).unwrap(),
            procedural_heights(coord, &config)
        );
    }

    #[test]
    fn test_truncated_raw_tile_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tile.raw");
        write_raw(&path, 2, 2, &[1, 2]);
        assert!(matches!(read_raw_tile(&path, 2), Err(TerrainError::IoError(_))));
    }

    #[test]
    fn test_png_cache_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = TerrainTileConfig {
            heightmap_resolution: 2,
            cache_directory: Some(dir.path().to_path_buf()),
            cache_format: TileCacheFormat::Png,
            ..small_config()
        };
        let coord = TileCoord::new(0, 0, 1);
        let image = image::ImageBuffer::<image::Luma<u16>, _>::from_raw(2, 2, vec![0u16, 65535, 0, 65535])
            .unwrap();
        image.save(tile_path(dir.path(), coord, TileCacheFormat::Png)).unwrap();

        let heights = load_heights(coord, &config).unwrap();
        assert_eq!(heights, vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_height_at_bilinear() {
        let config = Arc::new(TerrainTileConfig {
            base_tile_size: 10.0,
            heightmap_resolution: 2,
            min_altitude: 100.0,
            max_altitude: 200.0,
            ..Default::default()
        });
        let mut tile = TerrainTile::new(TileCoord::new(1, 0, 0), config);
        assert_eq!(tile.height_at(5.0, 5.0), 100.0);

        tile.set_heights(vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        assert!((tile.height_at(0.0, 0.0) - 100.0).abs() < 1e-4);
        assert!((tile.height_at(10.0, 0.0) - 200.0).abs() < 1e-4);
        assert!((tile.height_at(5.0, 7.0) - 150.0).abs() < 1e-4);
        // Clamped outside the tile
        assert!((tile.height_at(-5.0, 0.0) - 100.0).abs() < 1e-4);
        assert!((tile.height_at(50.0, 50.0) - 200.0).abs() < 1e-4);
        assert!((tile.height_at_world(12.5, 3.0) - 125.0).abs() < 1e-4);
    }

    #[test]
    fn test_set_heights_rejects_wrong_size() {
        let mut tile = TerrainTile::new(TileCoord::new(0, 0, 0), Arc::new(small_config()));
        assert!(tile.set_heights(vec![0.0; 4]).is_err());
        tile.load_height_data().unwrap();
        assert_eq!(tile.heights().len(), 25);

        tile.set_load_state(TileLoadState::Loaded);
        tile.reset();
        assert!(tile.heights().is_empty());
        assert_eq!(tile.load_state(), TileLoadState::Unloaded);
    }

    #[test]
    fn test_config_validation() {
        assert!(TerrainTileConfig::default().validate().is_ok());
        let bad = TerrainTileConfig {
            heightmap_resolution: 1,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = TerrainTileConfig {
            base_tile_size: 0.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
