//! Tile cache metadata
//!
//! `terrain_tiles.meta` records the parameters a tile cache was built with as
//! `key=value` lines. A cache is reused only while the source heightmap size and
//! every import parameter still match.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use crate::{TerrainError, TerrainResult};

/// File name of the metadata inside a cache directory
pub const METADATA_FILE: &str = "terrain_tiles.meta";

/// Path of the metadata file for `cache_dir`
pub fn metadata_path(cache_dir: &Path) -> PathBuf {
    cache_dir.join(METADATA_FILE)
}

/// Parameters a tile cache was built with
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CacheMetadata {
    pub source: PathBuf,
    pub source_file_size: u64,
    pub min_altitude: f32,
    pub max_altitude: f32,
    pub meters_per_pixel: f32,
    pub tile_resolution: u32,
    pub num_lod_levels: u32,
    pub source_width: u32,
    pub source_height: u32,
    pub tiles_x: u32,
    pub tiles_z: u32,
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> TerrainResult<T> {
    value
        .parse()
        .map_err(|_| TerrainError::InvalidCache(format!("bad value for {}: '{}'", key, value)))
}

impl CacheMetadata {
    /// Parse `key=value` lines; unknown keys are ignored
    pub fn parse(text: &str) -> TerrainResult<Self> {
        let mut meta = Self::default();
        let mut has_source = false;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "source" => {
                    meta.source = PathBuf::from(value);
                    has_source = true;
                }
                "sourceFileSize" => meta.source_file_size = parse_value(key, value)?,
                "minAltitude" => meta.min_altitude = parse_value(key, value)?,
                "maxAltitude" => meta.max_altitude = parse_value(key, value)?,
                "metersPerPixel" => meta.meters_per_pixel = parse_value(key, value)?,
                "tileResolution" => meta.tile_resolution = parse_value(key, value)?,
                "numLODLevels" => meta.num_lod_levels = parse_value(key, value)?,
                "sourceWidth" => meta.source_width = parse_value(key, value)?,
                "sourceHeight" => meta.source_height = parse_value(key, value)?,
                "tilesX" => meta.tiles_x = parse_value(key, value)?,
                "tilesZ" => meta.tiles_z = parse_value(key, value)?,
                _ => {}
            }
        }

        if !has_source {
            return Err(TerrainError::InvalidCache("metadata has no source entry".into()));
        }
        Ok(meta)
    }

    /// Serialize as `key=value` lines
    pub fn to_meta_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "source={}", self.source.display());
        let _ = writeln!(out, "sourceFileSize={}", self.source_file_size);
        let _ = writeln!(out, "minAltitude={}", self.min_altitude);
        let _ = writeln!(out, "maxAltitude={}", self.max_altitude);
        let _ = writeln!(out, "metersPerPixel={}", self.meters_per_pixel);
        let _ = writeln!(out, "tileResolution={}", self.tile_resolution);
        let _ = writeln!(out, "numLODLevels={}", self.num_lod_levels);
        let _ = writeln!(out, "sourceWidth={}", self.source_width);
        let _ = writeln!(out, "sourceHeight={}", self.source_height);
        let _ = writeln!(out, "tilesX={}", self.tiles_x);
        let _ = writeln!(out, "tilesZ={}", self.tiles_z);
        out
    }

    /// Read the metadata of a cache directory
    pub fn read(cache_dir: &Path) -> TerrainResult<Self> {
        let text = std::fs::read_to_string(metadata_path(cache_dir))?;
        Self::parse(&text)
    }

    /// Write the metadata into a cache directory
    pub fn write(&self, cache_dir: &Path) -> TerrainResult<()> {
        std::fs::write(metadata_path(cache_dir), self.to_meta_string())?;
        Ok(())
    }
}
