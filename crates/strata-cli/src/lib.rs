//! # Strata CLI
//!
//! Command-line interface for the Strata streaming systems.
//!
//! ## Commands
//! - `preprocess` - Cut a 16-bit heightmap into a terrain tile cache
//! - `check-cache` - Validate an existing tile cache against import parameters
//! - `simulate` - Drive the virtual texture system headlessly with synthetic feedback

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use glam::Vec3;
use serde::Serialize;
use strata_core::{FrameCompletion, FrameCounter};
use strata_platform::{HighResTimer, RollingTimer};
use strata_renderer::virtual_texture::{TileId, VirtualTextureFeedback, VirtualTextureStats};
use strata_renderer::{
    CommandList, HeadlessDevice, VirtualTextureConfig, VirtualTextureSettings, VirtualTextureSystem,
};
use strata_terrain::streaming::TerrainStreamingStats;
use strata_terrain::{
    CacheMetadata, DeviceTileUploader, ImportSummary, TerrainImportConfig, TerrainImporter,
    TerrainStreamingConfig, TerrainStreamingManager, TileCacheFormat,
};

/// Strata streaming tools
#[derive(Parser)]
#[command(name = "strata")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Heightmap import parameters
#[derive(Args, Debug, Clone)]
pub struct ImportArgs {
    /// 16-bit grayscale PNG heightmap
    #[arg(short, long)]
    pub source: PathBuf,

    /// Tile cache directory
    #[arg(short, long)]
    pub cache_dir: PathBuf,

    /// Altitude of height 0
    #[arg(long, default_value_t = 0.0)]
    pub min_altitude: f32,

    /// Altitude of height 65535
    #[arg(long, default_value_t = 200.0)]
    pub max_altitude: f32,

    /// World meters covered by one source pixel
    #[arg(long, default_value_t = 1.0)]
    pub meters_per_pixel: f32,

    /// Samples per tile edge
    #[arg(long, default_value_t = 512)]
    pub tile_resolution: u32,

    /// Number of LOD levels to generate
    #[arg(long, default_value_t = 4)]
    pub lod_levels: u32,

    /// Tile encoding: raw or png
    #[arg(long, default_value = "raw", value_parser = ["raw", "png"])]
    pub format: String,
}

impl ImportArgs {
    pub fn to_config(&self) -> TerrainImportConfig {
        TerrainImportConfig {
            source_heightmap: self.source.clone(),
            cache_directory: self.cache_dir.clone(),
            min_altitude: self.min_altitude,
            max_altitude: self.max_altitude,
            meters_per_pixel: self.meters_per_pixel,
            tile_resolution: self.tile_resolution,
            num_lod_levels: self.lod_levels,
            format: match self.format.as_str() {
                "png" => TileCacheFormat::Png,
                _ => TileCacheFormat::Raw,
            },
        }
    }
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Build a terrain tile cache from a heightmap
    Preprocess {
        #[command(flatten)]
        import: ImportArgs,

        /// Rebuild even if the cache is valid
        #[arg(long)]
        force: bool,
    },

    /// Check whether a tile cache matches the import parameters
    CheckCache {
        #[command(flatten)]
        import: ImportArgs,
    },

    /// Run the virtual texture system headlessly and print statistics
    Simulate {
        /// Virtual texture settings JSON
        #[arg(short, long)]
        settings: Option<PathBuf>,

        /// Override the tile directory from the settings
        #[arg(short, long)]
        tiles: Option<PathBuf>,

        /// Frames to simulate
        #[arg(short, long, default_value_t = 120)]
        frames: u32,

        /// Also stream terrain along the camera path using this config JSON
        #[arg(long)]
        terrain: Option<PathBuf>,
    },
}

/// Statistics printed by `simulate`
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub frames: u32,
    /// Rolling average of the last 60 frames' CPU time
    pub avg_frame_ms: f64,
    pub max_frame_ms: f64,
    pub virtual_texture: VirtualTextureStats,
    pub terrain: Option<TerrainStreamingStats>,
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    if cli.verbose {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    match cli.command {
        Commands::Preprocess { import, force } => {
            match run_preprocess(&import.to_config(), force)? {
                Some(summary) => println!("{}", serde_json::to_string_pretty(&summary)?),
                None => log::info!("Tile cache is up to date, nothing to do"),
            }
        }

        Commands::CheckCache { import } => {
            let meta = run_check_cache(&import.to_config())?;
            log::info!(
                "Cache valid: {}x{} source, {} LOD levels, {}x{} LOD 0 tiles",
                meta.source_width,
                meta.source_height,
                meta.num_lod_levels,
                meta.tiles_x,
                meta.tiles_z
            );
        }

        Commands::Simulate {
            settings,
            tiles,
            frames,
            terrain,
        } => {
            let mut settings = match settings {
                Some(path) => VirtualTextureSettings::from_json_file(&path)
                    .with_context(|| format!("loading {}", path.display()))?,
                None => VirtualTextureSettings::default(),
            };
            if let Some(tiles) = tiles {
                settings.tile_path = tiles;
            }
            let terrain = terrain
                .map(|path| {
                    TerrainStreamingConfig::from_json_file(&path)
                        .with_context(|| format!("loading {}", path.display()))
                })
                .transpose()?;

            let report = run_simulation(settings, frames, terrain)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Import unless the cache is valid (or `force` is set); `None` when the cache was reused
pub fn run_preprocess(config: &TerrainImportConfig, force: bool) -> Result<Option<ImportSummary>> {
    let importer = TerrainImporter::new(config.clone())?;
    let summary = if force {
        Some(importer.import()?)
    } else {
        importer.import_if_needed()?
    };
    Ok(summary)
}

/// Metadata of a valid cache; fails when the cache is missing or stale
pub fn run_check_cache(config: &TerrainImportConfig) -> Result<CacheMetadata> {
    let importer = TerrainImporter::new(config.clone())?;
    if !importer.is_cache_valid() {
        bail!(
            "tile cache at {} is missing or stale",
            config.cache_directory.display()
        );
    }
    Ok(importer.cached_metadata()?)
}

/// Tiles a camera panning across mip 0 would touch on `frame`, plus the coarser mips under it
pub fn synthetic_feedback(config: &VirtualTextureConfig, frame: u32, max_entries: u32) -> Vec<TileId> {
    let tiles = config.tiles_per_axis();
    let window = tiles.min(6);
    let pan = frame / 2;

    let mut ids = Vec::new();
    for dy in 0..window {
        for dx in 0..window {
            ids.push(TileId::new(((pan + dx) % tiles) as u16, dy as u16, 0));
        }
    }
    for mip in 1..config.max_mip_levels {
        let mip_tiles = config.tiles_at_mip(mip).max(1);
        ids.push(TileId::new(((pan >> mip) % mip_tiles) as u16, 0, mip as u8));
    }
    ids.truncate(max_entries as usize);
    ids
}

/// Stand-in for the fragment shader: append `ids` to this frame's feedback buffer
fn write_feedback(
    device: &mut HeadlessDevice,
    feedback: &VirtualTextureFeedback,
    frame_index: u32,
    ids: &[TileId],
) -> Result<()> {
    let storage = device.buffer_data_mut(feedback.storage_buffer(frame_index))?;
    for (slot, id) in storage.chunks_exact_mut(4).zip(ids) {
        slot.copy_from_slice(&id.pack().to_le_bytes());
    }
    let counter = device.buffer_data_mut(feedback.counter_buffer(frame_index))?;
    counter[..4].copy_from_slice(&(ids.len() as u32).to_le_bytes());
    Ok(())
}

/// Camera position for terrain streaming on `frame`
fn camera_path(frame: u32) -> Vec3 {
    Vec3::new(frame as f32 * 8.0, 0.0, frame as f32 * 2.0)
}

/// Run the headless frame loop
pub fn run_simulation(
    settings: VirtualTextureSettings,
    frames: u32,
    terrain: Option<TerrainStreamingConfig>,
) -> Result<SimulationReport> {
    let mut device = HeadlessDevice::new();
    let mut system = VirtualTextureSystem::new(&mut device, settings)?;
    let mut terrain = terrain.map(TerrainStreamingManager::new).transpose()?;
    let mut counter = FrameCounter::new(system.frames_in_flight());
    let mut frame_times = RollingTimer::new(60);

    for frame in 0..frames {
        let frame_timer = HighResTimer::new();
        let frame_index = counter.frame_index();
        let completion = FrameCompletion::wait(&device, frame_index)?;

        let mut cmd = CommandList::new();
        system.update(&mut device, &mut cmd, frame_index, &completion)?;
        system.begin_frame(&mut cmd, frame_index);
        device.submit(&cmd)?;

        let ids = synthetic_feedback(system.config(), frame, system.feedback().max_entries());
        write_feedback(&mut device, system.feedback(), frame_index, &ids)?;

        let mut end = CommandList::new();
        system.end_frame(&mut end, frame_index);
        device.submit(&end)?;

        if let Some(manager) = terrain.as_mut() {
            manager.update(
                camera_path(frame),
                counter.frame_number(),
                &mut DeviceTileUploader::new(&mut device),
            );
        }

        frame_times.record_duration(frame_timer.elapsed());
        if frame % 30 == 0 {
            let stats = system.stats();
            log::debug!(
                "frame {}: {} resident, {} requested, penalty {:.1}, {:.3} ms/frame",
                frame,
                stats.resident_tiles,
                stats.requested_tiles,
                stats.penalty,
                frame_times.average_millis()
            );
        }
        counter.advance();
    }

    system.loader().wait_idle();
    let report = SimulationReport {
        frames,
        avg_frame_ms: frame_times.average_millis(),
        max_frame_ms: frame_times.max() * 1000.0,
        virtual_texture: system.stats(),
        terrain: terrain.as_ref().map(|manager| {
            manager.wait_for_loads();
            manager.stats()
        }),
    };

    if let Some(manager) = terrain.as_mut() {
        manager.shutdown(&mut DeviceTileUploader::new(&mut device));
    }
    system.destroy(&mut device);

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_terrain::LodLevelConfig;
    use strata_terrain::TerrainTileConfig;

    fn small_settings(tile_path: PathBuf) -> VirtualTextureSettings {
        VirtualTextureSettings {
            config: VirtualTextureConfig {
                virtual_size_pixels: 2048,
                tile_size_pixels: 128,
                cache_size_pixels: 512,
                border_pixels: 4,
                max_mip_levels: 5,
            },
            tile_path,
            loader_workers: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_cli_parse() {
        let cli = Cli::parse_from(["strata", "simulate"]);
        if let Commands::Simulate { frames, settings, .. } = cli.command {
            assert_eq!(frames, 120);
            assert!(settings.is_none());
        } else {
            panic!("Expected Simulate command");
        }
    }

    #[test]
    fn test_preprocess_command() {
        let cli = Cli::parse_from([
            "strata",
            "preprocess",
            "-s",
            "height.png",
            "-c",
            "cache",
            "--tile-resolution",
            "256",
            "--format",
            "png",
            "--force",
        ]);
        if let Commands::Preprocess { import, force } = cli.command {
            let config = import.to_config();
            assert_eq!(config.tile_resolution, 256);
            assert_eq!(config.num_lod_levels, 4);
            assert_eq!(config.format, TileCacheFormat::Png);
            assert_eq!(config.cache_directory, PathBuf::from("cache"));
            assert!(force);
        } else {
            panic!("Expected Preprocess command");
        }
    }

    #[test]
    fn test_rejects_unknown_format() {
        let result = Cli::try_parse_from([
            "strata",
            "check-cache",
            "-s",
            "height.png",
            "-c",
            "cache",
            "--format",
            "tiff",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_synthetic_feedback_in_range() {
        let config = small_settings(PathBuf::new()).config;
        for frame in [0, 7, 100] {
            let ids = synthetic_feedback(&config, frame, 4096);
            assert_eq!(ids.len(), 36 + 4);
            for id in &ids {
                let tiles = config.tiles_at_mip(u32::from(id.mip_level));
                assert!(u32::from(id.x) < tiles && u32::from(id.y) < tiles);
            }
        }
        assert_eq!(synthetic_feedback(&config, 0, 10).len(), 10);
    }

    #[test]
    fn test_preprocess_then_check() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("height.png");
        image::ImageBuffer::<image::Luma<u16>, _>::from_raw(8, 8, vec![1000u16; 64])
            .unwrap()
            .save(&source)
            .unwrap();
        let config = TerrainImportConfig {
            source_heightmap: source,
            cache_directory: dir.path().join("cache"),
            tile_resolution: 4,
            num_lod_levels: 2,
            ..Default::default()
        };

        assert!(run_check_cache(&config).is_err());
        let summary = run_preprocess(&config, false).unwrap().unwrap();
        assert_eq!(summary.tiles_written, 5);
        assert_eq!(run_check_cache(&config).unwrap().tiles_x, 2);

        assert!(run_preprocess(&config, false).unwrap().is_none());
        assert!(run_preprocess(&config, true).unwrap().is_some());
    }

    #[test]
    fn test_simulation_streams_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let report = run_simulation(small_settings(dir.path().to_path_buf()), 24, None).unwrap();

        assert_eq!(report.frames, 24);
        assert!(report.avg_frame_ms >= 0.0 && report.max_frame_ms >= 0.0);
        assert_eq!(report.virtual_texture.frame, 24);
        let vt = report.virtual_texture;
        assert!(vt.resident_tiles + vt.awaiting_upload + vt.requested_tiles > 0);
        assert!(vt.bytes_loaded > 0);
        assert!(vt.resident_tiles <= vt.total_slots);
        assert!(report.terrain.is_none());
    }

    #[test]
    fn test_simulation_with_terrain() {
        let dir = tempfile::tempdir().unwrap();
        let terrain = TerrainStreamingConfig {
            tile: TerrainTileConfig {
                base_tile_size: 32.0,
                heightmap_resolution: 5,
                ..Default::default()
            },
            lod_levels: vec![
                LodLevelConfig::new(0.0, 64.0, 16.0),
                LodLevelConfig::new(64.0, 160.0, 32.0),
            ],
            num_workers: 1,
            ..Default::default()
        };

        let report =
            run_simulation(small_settings(dir.path().to_path_buf()), 10, Some(terrain)).unwrap();
        let stats = report.terrain.unwrap();
        assert!(stats.loaded_tiles + stats.loading_tiles > 0);
    }
}
