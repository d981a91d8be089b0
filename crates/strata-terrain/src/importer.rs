//! Heightmap Importer
//!
//! Cuts a 16-bit grayscale heightmap into a tile cache:
//! - LOD `n` is the source box-filtered down by `2^n`
//! - Each LOD is split into `tile_resolution`² tiles (ceil division, edge clamped)
//! - Tiles are written in parallel, then `terrain_tiles.meta` is written last so an
//!   interrupted import never looks valid

use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strata_platform::{FileSystem, HighResTimer};

use crate::metadata::{CacheMetadata, METADATA_FILE};
use crate::tile::{tile_path, TileCacheFormat, TileCoord};
use crate::{TerrainError, TerrainResult};

/// Import parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainImportConfig {
    pub source_heightmap: PathBuf,
    pub cache_directory: PathBuf,
    pub min_altitude: f32,
    pub max_altitude: f32,
    pub meters_per_pixel: f32,
    /// Samples per tile edge
    pub tile_resolution: u32,
    pub num_lod_levels: u32,
    pub format: TileCacheFormat,
}

impl Default for TerrainImportConfig {
    fn default() -> Self {
        Self {
            source_heightmap: PathBuf::from("heightmap.png"),
            cache_directory: PathBuf::from("terrain_cache"),
            min_altitude: 0.0,
            max_altitude: 200.0,
            meters_per_pixel: 1.0,
            tile_resolution: 512,
            num_lod_levels: 4,
            format: TileCacheFormat::Raw,
        }
    }
}

impl TerrainImportConfig {
    /// Reject zero resolution, zero LODs and non-positive pixel size
    pub fn validate(&self) -> TerrainResult<()> {
        if self.tile_resolution == 0 {
            return Err(TerrainError::InvalidConfig("tile resolution must be non-zero".into()));
        }
        if self.num_lod_levels == 0 {
            return Err(TerrainError::InvalidConfig("at least one LOD level is required".into()));
        }
        if self.meters_per_pixel <= 0.0 {
            return Err(TerrainError::InvalidConfig(format!(
                "meters per pixel must be positive, got {}",
                self.meters_per_pixel
            )));
        }
        Ok(())
    }

    /// World size of a LOD 0 tile; streaming configs reading this cache use it as
    /// their base tile size
    pub fn base_tile_size(&self) -> f32 {
        self.tile_resolution as f32 * self.meters_per_pixel
    }
}

/// What an import produced
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportSummary {
    pub source_width: u32,
    pub source_height: u32,
    pub world_width: f32,
    pub world_height: f32,
    /// Tile grid per LOD as `(tiles_x, tiles_z)`
    pub lod_tiles: Vec<(u32, u32)>,
    pub tiles_written: usize,
}

/// Single-channel 16-bit height grid
#[derive(Debug, Clone, PartialEq)]
pub struct HeightGrid {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
}

impl HeightGrid {
    /// Load a grayscale heightmap, converting to 16 bits
    pub fn load(path: &Path) -> TerrainResult<Self> {
        let image = image::open(path)?.to_luma16();
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(TerrainError::InvalidHeightmap(format!(
                "{} is empty",
                path.display()
            )));
        }
        Ok(Self {
            width,
            height,
            data: image.into_raw(),
        })
    }

    /// 2x2 box filter to half resolution (minimum 1x1); odd edges average what exists
    pub fn downsample(&self) -> Self {
        let width = (self.width / 2).max(1);
        let height = (self.height / 2).max(1);
        let mut data = vec![0u16; (width * height) as usize];

        data.par_chunks_mut(width as usize)
            .enumerate()
            .for_each(|(y, row)| {
                let src_y = y as u32 * 2;
                for (x, out) in row.iter_mut().enumerate() {
                    let src_x = x as u32 * 2;
                    let mut sum = 0u32;
                    let mut count = 0u32;
                    for dy in 0..2 {
                        for dx in 0..2 {
                            if src_y + dy < self.height && src_x + dx < self.width {
                                sum += self.data[((src_y + dy) * self.width + src_x + dx) as usize]
                                    as u32;
                                count += 1;
                            }
                        }
                    }
                    *out = (sum / count) as u16;
                }
            });

        Self { width, height, data }
    }

    /// Tile grid size for `tile_resolution`
    pub fn tile_count(&self, tile_resolution: u32) -> (u32, u32) {
        (
            self.width.div_ceil(tile_resolution),
            self.height.div_ceil(tile_resolution),
        )
    }

    /// Copy out tile `(tx, tz)`, clamping reads past the right and bottom edges
    pub fn extract_tile(&self, tx: u32, tz: u32, tile_resolution: u32) -> Vec<u16> {
        let mut tile = Vec::with_capacity((tile_resolution * tile_resolution) as usize);
        for py in 0..tile_resolution {
            let src_z = (tz * tile_resolution + py).min(self.height - 1);
            for px in 0..tile_resolution {
                let src_x = (tx * tile_resolution + px).min(self.width - 1);
                tile.push(self.data[(src_z * self.width + src_x) as usize]);
            }
        }
        tile
    }
}

/// Write a raw tile: `u32 res, u32 res` header then little-endian heights
pub fn write_raw_tile(path: &Path, resolution: u32, heights: &[u16]) -> TerrainResult<()> {
    let mut bytes = Vec::with_capacity(8 + heights.len() * 2);
    bytes.extend(resolution.to_le_bytes());
    bytes.extend(resolution.to_le_bytes());
    for h in heights {
        bytes.extend(h.to_le_bytes());
    }
    std::fs::write(path, bytes)?;
    Ok(())
}

/// Write a 16-bit grayscale PNG tile
pub fn write_png_tile(path: &Path, resolution: u32, heights: &[u16]) -> TerrainResult<()> {
    let image =
        image::ImageBuffer::<image::Luma<u16>, _>::from_raw(resolution, resolution, heights.to_vec())
            .ok_or_else(|| {
                TerrainError::InvalidHeightmap(format!(
                    "{} heights do not fill a {}x{} tile",
                    heights.len(),
                    resolution,
                    resolution
                ))
            })?;
    image.save(path)?;
    Ok(())
}

/// Builds and validates terrain tile caches
pub struct TerrainImporter {
    fs: FileSystem,
    config: TerrainImportConfig,
}

impl TerrainImporter {
    /// Create an importer; fails on an invalid config
    pub fn new(config: TerrainImportConfig) -> TerrainResult<Self> {
        config.validate()?;
        let source_dir = config
            .source_heightmap
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(Self {
            fs: FileSystem::with_dirs(source_dir, config.cache_directory.clone()),
            config,
        })
    }

    pub fn config(&self) -> &TerrainImportConfig {
        &self.config
    }

    /// Metadata of the existing cache, if readable
    pub fn cached_metadata(&self) -> TerrainResult<CacheMetadata> {
        let text = self.fs.read_string(self.fs.cache_path(METADATA_FILE))?;
        CacheMetadata::parse(&text)
    }

    /// Whether the cache on disk was built from the same source and parameters
    pub fn is_cache_valid(&self) -> bool {
        match self.check_cache() {
            Ok(()) => {
                log::info!("Terrain cache: valid cache at {}", self.fs.cache_dir().display());
                true
            }
            Err(e) => {
                log::info!("Terrain cache: {}", e);
                false
            }
        }
    }

    fn check_cache(&self) -> TerrainResult<()> {
        let meta = self.cached_metadata()?;
        let config = &self.config;
        let mismatch = |what: String| -> TerrainResult<()> { Err(TerrainError::InvalidCache(what)) };

        let cached_source = self.fs.canonicalize(&meta.source)?;
        let source = self.fs.canonicalize(&config.source_heightmap)?;
        if cached_source != source {
            return mismatch(format!(
                "source path mismatch (cached={}, config={})",
                cached_source.display(),
                source.display()
            ));
        }
        if (meta.min_altitude - config.min_altitude).abs() > 0.01 {
            return mismatch(format!(
                "minAltitude mismatch (cached={}, config={})",
                meta.min_altitude, config.min_altitude
            ));
        }
        if (meta.max_altitude - config.max_altitude).abs() > 0.01 {
            return mismatch(format!(
                "maxAltitude mismatch (cached={}, config={})",
                meta.max_altitude, config.max_altitude
            ));
        }
        if (meta.meters_per_pixel - config.meters_per_pixel).abs() > 0.001 {
            return mismatch(format!(
                "metersPerPixel mismatch (cached={}, config={})",
                meta.meters_per_pixel, config.meters_per_pixel
            ));
        }
        if meta.tile_resolution != config.tile_resolution {
            return mismatch(format!(
                "tileResolution mismatch (cached={}, config={})",
                meta.tile_resolution, config.tile_resolution
            ));
        }
        if meta.num_lod_levels != config.num_lod_levels {
            return mismatch(format!(
                "numLODLevels mismatch (cached={}, config={})",
                meta.num_lod_levels, config.num_lod_levels
            ));
        }
        let source_size = self.fs.file_size(&config.source_heightmap)?;
        if meta.source_file_size != source_size {
            return mismatch(format!(
                "source file size changed (cached={}, current={})",
                meta.source_file_size, source_size
            ));
        }
        Ok(())
    }

    /// Build the cache unconditionally
    pub fn import(&self) -> TerrainResult<ImportSummary> {
        let timer = HighResTimer::new();
        let config = &self.config;
        let source = HeightGrid::load(&config.source_heightmap)?;
        let source_file_size = self.fs.file_size(&config.source_heightmap)?;
        self.fs.create_dir_all(self.fs.cache_dir())?;

        let world_width = source.width as f32 * config.meters_per_pixel;
        let world_height = source.height as f32 * config.meters_per_pixel;
        let (tiles_x, tiles_z) = source.tile_count(config.tile_resolution);

        log::info!(
            "Importing {}: {}x{} pixels, {:.1}m x {:.1}m, LOD 0 {}x{} tiles of {}",
            config.source_heightmap.display(),
            source.width,
            source.height,
            world_width,
            world_height,
            tiles_x,
            tiles_z,
            config.tile_resolution
        );

        let mut summary = ImportSummary {
            source_width: source.width,
            source_height: source.height,
            world_width,
            world_height,
            lod_tiles: Vec::with_capacity(config.num_lod_levels as usize),
            tiles_written: 0,
        };

        let mut level = source;
        for lod in 0..config.num_lod_levels {
            let written = self.write_lod(&level, lod)?;
            summary.lod_tiles.push(level.tile_count(config.tile_resolution));
            summary.tiles_written += written;

            if lod + 1 < config.num_lod_levels {
                level = level.downsample();
                log::debug!("Downsampled to {}x{} for LOD {}", level.width, level.height, lod + 1);
            }
        }

        let meta = CacheMetadata {
            source: self.fs.canonicalize(&config.source_heightmap)?,
            source_file_size,
            min_altitude: config.min_altitude,
            max_altitude: config.max_altitude,
            meters_per_pixel: config.meters_per_pixel,
            tile_resolution: config.tile_resolution,
            num_lod_levels: config.num_lod_levels,
            source_width: summary.source_width,
            source_height: summary.source_height,
            tiles_x,
            tiles_z,
        };
        self.fs
            .write_string(self.fs.cache_path(METADATA_FILE), &meta.to_meta_string())?;

        log::info!(
            "Terrain cache: wrote {} tiles to {} in {:.1} ms",
            summary.tiles_written,
            self.fs.cache_dir().display(),
            timer.elapsed_millis()
        );
        Ok(summary)
    }

    /// Import unless a valid cache already exists; returns `None` when reused
    pub fn import_if_needed(&self) -> TerrainResult<Option<ImportSummary>> {
        if self.is_cache_valid() {
            return Ok(None);
        }
        self.import().map(Some)
    }

    fn write_lod(&self, level: &HeightGrid, lod: u32) -> TerrainResult<usize> {
        let res = self.config.tile_resolution;
        let format = self.config.format;
        let cache_dir = self.fs.cache_dir();
        let (tiles_x, tiles_z) = level.tile_count(res);

        log::info!(
            "LOD {}: {}x{} tiles from {}x{} ({} threads)",
            lod,
            tiles_x,
            tiles_z,
            level.width,
            level.height,
            rayon::current_num_threads()
        );

        (0..tiles_x * tiles_z).into_par_iter().try_for_each(|index| {
            let tx = index % tiles_x;
            let tz = index / tiles_x;
            let heights = level.extract_tile(tx, tz, res);
            let path = tile_path(cache_dir, TileCoord::new(tx as i32, tz as i32, lod), format);
            match format {
                TileCacheFormat::Raw => write_raw_tile(&path, res, &heights),
                TileCacheFormat::Png => write_png_tile(&path, res, &heights),
            }
        })?;

        Ok((tiles_x * tiles_z) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::{read_png_tile, read_raw_tile};

    fn grid(width: u32, height: u32) -> HeightGrid {
        HeightGrid {
            width,
            height,
            data: (0..width * height).map(|i| (i * 100) as u16).collect(),
        }
    }

    fn write_source(dir: &Path, width: u32, height: u32) -> PathBuf {
        let path = dir.join("height.png");
        let g = grid(width, height);
        image::ImageBuffer::<image::Luma<u16>, _>::from_raw(width, height, g.data)
            .unwrap()
            .save(&path)
            .unwrap();
        path
    }

    fn import_config(dir: &Path, format: TileCacheFormat) -> TerrainImportConfig {
        TerrainImportConfig {
            source_heightmap: write_source(dir, 10, 6),
            cache_directory: dir.join("cache"),
            min_altitude: 0.0,
            max_altitude: 100.0,
            meters_per_pixel: 2.0,
            tile_resolution: 4,
            num_lod_levels: 2,
            format,
        }
    }

    #[test]
    fn test_downsample_box_filter() {
        let g = HeightGrid {
            width: 3,
            height: 3,
            data: vec![0, 4, 8, 8, 12, 16, 100, 200, 300],
        };
        let half = g.downsample();
        assert_eq!((half.width, half.height), (1, 1));
        assert_eq!(half.data, vec![6]);

        let tiny = HeightGrid {
            width: 1,
            height: 2,
            data: vec![10, 30],
        };
        let half = tiny.downsample();
        assert_eq!((half.width, half.height), (1, 1));
        assert_eq!(half.data, vec![20]);
    }

    #[test]
    fn test_extract_tile_clamps_edges() {
        let g = grid(5, 3);
        assert_eq!(g.tile_count(4), (2, 1));

        let tile = g.extract_tile(1, 0, 4);
        // Column 4 repeats across the tile, row 2 repeats below
        assert_eq!(tile[0], 400);
        assert_eq!(tile[1], 400);
        assert_eq!(tile[4], 900);
        assert_eq!(tile[15], 1400);
    }

    #[test]
    fn test_import_writes_all_lods() {
        let dir = tempfile::tempdir().unwrap();
        let config = import_config(dir.path(), TileCacheFormat::Raw);
        let importer = TerrainImporter::new(config.clone()).unwrap();

        let summary = importer.import().unwrap();
        assert_eq!((summary.source_width, summary.source_height), (10, 6));
        assert_eq!(summary.world_width, 20.0);
        assert_eq!(summary.lod_tiles, vec![(3, 2), (2, 1)]);
        assert_eq!(summary.tiles_written, 8);

        let cache = &config.cache_directory;
        for tz in 0..2 {
            for tx in 0..3 {
                assert!(tile_path(cache, TileCoord::new(tx, tz, 0), TileCacheFormat::Raw).is_file());
            }
        }
        assert!(tile_path(cache, TileCoord::new(1, 0, 1), TileCacheFormat::Raw).is_file());

        let heights =
            read_raw_tile(&tile_path(cache, TileCoord::new(0, 0, 0), TileCacheFormat::Raw), 4).unwrap();
        assert_eq!(heights.len(), 16);
        assert_eq!(heights[1], 100.0 / 65535.0);

        let meta = importer.cached_metadata().unwrap();
        assert_eq!((meta.tiles_x, meta.tiles_z), (3, 2));
        assert_eq!(meta.tile_resolution, 4);
        assert!(meta.source.is_absolute());
        assert_eq!(
            meta.source_file_size,
            std::fs::metadata(&config.source_heightmap).unwrap().len()
        );
    }

    #[test]
    fn test_png_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let config = import_config(dir.path(), TileCacheFormat::Png);
        TerrainImporter::new(config.clone()).unwrap().import().unwrap();

        let path = tile_path(&config.cache_directory, TileCoord::new(2, 1, 0), TileCacheFormat::Png);
        let heights = read_png_tile(&path, 4).unwrap();
        // Tile (2, 1) starts at pixel (8, 4)
        assert_eq!(heights[0], 4800.0 / 65535.0);
    }

    #[test]
    fn test_cache_validation() {
        let dir = tempfile::tempdir().unwrap();
        let config = import_config(dir.path(), TileCacheFormat::Raw);
        let importer = TerrainImporter::new(config.clone()).unwrap();
        assert!(!importer.is_cache_valid());

        assert!(importer.import_if_needed().unwrap().is_some());
        assert!(importer.is_cache_valid());
        assert!(importer.import_if_needed().unwrap().is_none());

        let within_tolerance = TerrainImportConfig {
            min_altitude: 0.005,
            ..config.clone()
        };
        assert!(TerrainImporter::new(within_tolerance).unwrap().is_cache_valid());

        for changed in [
            TerrainImportConfig {
                max_altitude: 150.0,
                ..config.clone()
            },
            TerrainImportConfig {
                meters_per_pixel: 2.01,
                ..config.clone()
            },
            TerrainImportConfig {
                tile_resolution: 8,
                ..config.clone()
            },
            TerrainImportConfig {
                num_lod_levels: 3,
                ..config.clone()
            },
        ] {
            assert!(!TerrainImporter::new(changed).unwrap().is_cache_valid());
        }
    }

    #[test]
    fn test_source_change_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let config = import_config(dir.path(), TileCacheFormat::Raw);
        let importer = TerrainImporter::new(config.clone()).unwrap();
        importer.import().unwrap();

        // Same parameters, different source file
        let other = dir.path().join("other.png");
        std::fs::copy(&config.source_heightmap, &other).unwrap();
        let moved = TerrainImportConfig {
            source_heightmap: other,
            ..config.clone()
        };
        assert!(!TerrainImporter::new(moved).unwrap().is_cache_valid());

        // Bigger source at the same path
        write_source(dir.path(), 40, 40);
        assert!(!importer.is_cache_valid());
    }

    #[test]
    fn test_invalid_config() {
        let config = TerrainImportConfig {
            tile_resolution: 0,
            ..Default::default()
        };
        assert!(TerrainImporter::new(config).is_err());
        assert!(TerrainImportConfig::default().validate().is_ok());
        assert_eq!(
            TerrainImportConfig {
                tile_resolution: 256,
                meters_per_pixel: 2.0,
                ..Default::default()
            }
            .base_tile_size(),
            512.0
        );
    }

    #[test]
    fn test_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = TerrainImportConfig {
            source_heightmap: dir.path().join("missing.png"),
            cache_directory: dir.path().join("cache"),
            ..Default::default()
        };
        assert!(TerrainImporter::new(config).unwrap().import().is_err());
    }
}
