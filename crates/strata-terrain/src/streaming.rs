//! Terrain Streaming
//!
//! Keeps terrain tiles resident around the camera. Each LOD owns a distance ring
//! `[min_distance, max_distance)`; tiles whose center falls inside a ring are
//! loaded on the core [`StreamingManager`] worker pool and uploaded on the calling
//! thread. Tiles are evicted once they leave their ring by more than the unload
//! margin, or coarsest-first while GPU memory is over budget.

use std::path::Path;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use crossbeam::channel::{self, Receiver, Sender};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use strata_core::{LoadPriority, StreamingBudget, StreamingManager};
use strata_renderer::gpu::{
    AccessFlags, Barrier, BufferDesc, BufferImageCopy, GpuDevice, ImageDesc, ImageFormat,
    ImageHandle, ImageLayout, PipelineStages,
};

use crate::tile::{load_heights, TerrainTile, TerrainTileConfig, TileCoord, TileLoadState};
use crate::{TerrainError, TerrainResult};

/// Distance ring of one LOD level
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LodLevelConfig {
    pub min_distance: f32,
    pub max_distance: f32,
    /// Hysteresis beyond `max_distance` before a tile is unloaded
    #[serde(default)]
    pub unload_margin: f32,
}

impl LodLevelConfig {
    /// Ring from `min_distance` to `max_distance`, kept loaded until `max_distance + unload_margin`
    pub fn new(min_distance: f32, max_distance: f32, unload_margin: f32) -> Self {
        Self {
            min_distance,
            max_distance,
            unload_margin,
        }
    }

    /// Distance beyond which tiles of this ring are evicted
    pub fn unload_distance(&self) -> f32 {
        self.max_distance + self.unload_margin
    }
}

/// Terrain streaming configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerrainStreamingConfig {
    pub tile: TerrainTileConfig,
    /// One ring per LOD, finest first
    pub lod_levels: Vec<LodLevelConfig>,
    pub budget: StreamingBudget,
    pub num_workers: usize,
}

impl Default for TerrainStreamingConfig {
    fn default() -> Self {
        Self {
            tile: TerrainTileConfig::default(),
            lod_levels: vec![
                LodLevelConfig::new(0.0, 512.0, 64.0),
                LodLevelConfig::new(512.0, 1536.0, 128.0),
                LodLevelConfig::new(1536.0, 4096.0, 256.0),
            ],
            budget: StreamingBudget::default(),
            num_workers: 2,
        }
    }
}

impl TerrainStreamingConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> TerrainResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the tile config and that rings are non-empty and ordered
    pub fn validate(&self) -> TerrainResult<()> {
        self.tile.validate()?;
        if self.lod_levels.is_empty() {
            return Err(TerrainError::InvalidConfig("at least one LOD level is required".into()));
        }
        for (lod, level) in self.lod_levels.iter().enumerate() {
            if !(level.min_distance < level.max_distance) || level.unload_margin < 0.0 {
                return Err(TerrainError::InvalidConfig(format!(
                    "LOD {} ring [{}, {}) margin {} is invalid",
                    lod, level.min_distance, level.max_distance, level.unload_margin
                )));
            }
        }
        if self.num_workers == 0 {
            return Err(TerrainError::InvalidConfig("at least one worker is required".into()));
        }
        Ok(())
    }

    /// Unload distance for `lod`; LODs past the configured rings use the last ring's maximum
    pub fn unload_distance(&self, lod: u32) -> f32 {
        match self.lod_levels.get(lod as usize) {
            Some(level) => level.unload_distance(),
            None => self.lod_levels.last().map_or(0.0, |level| level.max_distance),
        }
    }
}

/// GPU image holding a tile's heights
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGpuResource {
    pub image: ImageHandle,
}

/// Creates and destroys GPU resources for loaded tiles
pub trait TileUploader {
    /// Create the height image for a tile whose heights are loaded
    fn upload(&mut self, tile: &TerrainTile) -> TerrainResult<TileGpuResource>;

    /// Destroy a resource returned by [`TileUploader::upload`]
    fn release(&mut self, resource: TileGpuResource);
}

/// Uploads heights into an `R32Float` image through a [`GpuDevice`]
pub struct DeviceTileUploader<'a> {
    device: &'a mut dyn GpuDevice,
}

impl<'a> DeviceTileUploader<'a> {
    /// Upload through `device`
    pub fn new(device: &'a mut dyn GpuDevice) -> Self {
        Self { device }
    }

    fn copy_heights(&mut self, image: ImageHandle, tile: &TerrainTile) -> TerrainResult<()> {
        let res = tile.config().heightmap_resolution;
        let bytes: &[u8] = bytemuck::cast_slice(tile.heights());
        let staging = self
            .device
            .create_buffer(&BufferDesc::staging(bytes.len() as u64), "terrain_tile_staging")?;

        let result = self.device.write_buffer(staging, 0, bytes).and_then(|()| {
            self.device.one_shot(&mut |cmd| {
                cmd.pipeline_barrier(
                    PipelineStages::TOP_OF_PIPE,
                    PipelineStages::TRANSFER,
                    &[Barrier::Image {
                        image,
                        old_layout: ImageLayout::Undefined,
                        new_layout: ImageLayout::TransferDst,
                        src_access: AccessFlags::empty(),
                        dst_access: AccessFlags::TRANSFER_WRITE,
                    }],
                );
                cmd.copy_buffer_to_image(
                    staging,
                    image,
                    ImageLayout::TransferDst,
                    &[BufferImageCopy {
                        buffer_offset: 0,
                        image_offset: [0, 0],
                        image_extent: [res, res],
                    }],
                );
                cmd.pipeline_barrier(
                    PipelineStages::TRANSFER,
                    PipelineStages::FRAGMENT_SHADER,
                    &[Barrier::image_to_shader_read(image)],
                );
                Ok(())
            })
        });

        self.device.destroy_buffer(staging);
        result.map_err(TerrainError::from)
    }
}

impl TileUploader for DeviceTileUploader<'_> {
    fn upload(&mut self, tile: &TerrainTile) -> TerrainResult<TileGpuResource> {
        let res = tile.config().heightmap_resolution;
        let expected = (res * res) as usize;
        if tile.heights().len() != expected {
            return Err(TerrainError::InvalidHeightmap(format!(
                "tile {} has {} heights, expected {}",
                tile.coord(),
                tile.heights().len(),
                expected
            )));
        }

        let c = tile.coord();
        let label = format!("terrain_tile_{}_{}_lod{}", c.x, c.z, c.lod);
        let image = self
            .device
            .create_image(&ImageDesc::sampled(res, res, ImageFormat::R32Float), &label)?;

        if let Err(e) = self.copy_heights(image, tile) {
            self.device.destroy_image(image);
            return Err(e);
        }
        Ok(TileGpuResource { image })
    }

    fn release(&mut self, resource: TileGpuResource) {
        self.device.destroy_image(resource.image);
    }
}

/// Streaming counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct TerrainStreamingStats {
    pub loaded_tiles: usize,
    pub loading_tiles: usize,
    pub visible_tiles: usize,
    pub gpu_memory: usize,
    pub total_evictions: u64,
    pub failed_loads: u64,
}

struct CompletedLoad {
    coord: TileCoord,
    heights: TerrainResult<Vec<f32>>,
}

/// Load priority: LOD-weighted distance so finer rings win at equal distance
pub fn load_priority(coord: TileCoord, distance: f32, frame: u64) -> LoadPriority {
    LoadPriority {
        distance: distance * (1.0 + 0.5 * coord.lod as f32),
        importance: 1.0,
        request_frame: frame,
    }
}

/// Camera-driven terrain tile residency
pub struct TerrainStreamingManager {
    config: TerrainStreamingConfig,
    tile_config: Arc<TerrainTileConfig>,
    streaming: StreamingManager,
    tiles: AHashMap<TileCoord, TerrainTile>,
    loading: AHashSet<TileCoord>,
    visible: Vec<TileCoord>,
    completed_tx: Sender<CompletedLoad>,
    completed_rx: Receiver<CompletedLoad>,
    last_camera: Option<Vec3>,
    total_evictions: u64,
    failed_loads: u64,
}

impl TerrainStreamingManager {
    /// Validate `config` and start the loader workers
    pub fn new(config: TerrainStreamingConfig) -> TerrainResult<Self> {
        config.validate()?;
        let streaming = StreamingManager::new("terrain-loader", config.num_workers, config.budget)?;
        let (completed_tx, completed_rx) = channel::unbounded();

        match &config.tile.cache_directory {
            Some(dir) => log::info!(
                "TerrainStreamingManager: {} LOD levels, cache {}",
                config.lod_levels.len(),
                dir.display()
            ),
            None => log::info!(
                "TerrainStreamingManager: {} LOD levels, procedural heights",
                config.lod_levels.len()
            ),
        }

        Ok(Self {
            tile_config: Arc::new(config.tile.clone()),
            config,
            streaming,
            tiles: AHashMap::new(),
            loading: AHashSet::new(),
            visible: Vec::new(),
            completed_tx,
            completed_rx,
            last_camera: None,
            total_evictions: 0,
            failed_loads: 0,
        })
    }

    /// Advance streaming for one frame
    pub fn update(&mut self, camera: Vec3, frame: u64, uploader: &mut dyn TileUploader) {
        self.process_completed_loads(uploader);
        self.update_tile_requests(camera, frame);
        self.evict_tiles(camera, uploader);
        self.update_visible_tiles(camera, frame);
        self.last_camera = Some(camera);
    }

    /// Upload tiles whose heights finished loading; returns how many became resident
    pub fn process_completed_loads(&mut self, uploader: &mut dyn TileUploader) -> u32 {
        let mut uploaded = 0;

        for done in self.completed_rx.try_iter() {
            self.loading.remove(&done.coord);
            let Some(tile) = self.tiles.get_mut(&done.coord) else {
                continue;
            };
            if tile.load_state() != TileLoadState::Loading {
                continue;
            }

            let result = done
                .heights
                .and_then(|heights| tile.set_heights(heights))
                .and_then(|()| uploader.upload(tile));

            match result {
                Ok(resource) => {
                    tile.set_gpu_resource(resource);
                    tile.set_load_state(TileLoadState::Loaded);
                    self.streaming.add_gpu_memory(tile.gpu_memory_usage());
                    uploaded += 1;
                }
                Err(e) => {
                    log::warn!("Terrain tile {} failed to load: {}", done.coord, e);
                    self.tiles.remove(&done.coord);
                    self.failed_loads += 1;
                }
            }
        }

        if uploaded > 0 {
            log::debug!("Terrain: {} tiles uploaded", uploaded);
        }
        uploaded
    }

    /// World size of a tile at `lod`
    pub fn tile_size_for_lod(&self, lod: u32) -> f32 {
        self.tile_config.tile_size(lod)
    }

    /// Tile containing `(world_x, world_z)` at `lod`
    pub fn world_to_tile_coord(&self, world_x: f32, world_z: f32, lod: u32) -> TileCoord {
        TileCoord::from_world(world_x, world_z, self.tile_size_for_lod(lod)).with_lod(lod)
    }

    /// Finest LOD whose ring contains `distance`, or the coarsest LOD
    pub fn lod_for_distance(&self, distance: f32) -> u32 {
        self.config
            .lod_levels
            .iter()
            .position(|l| distance >= l.min_distance && distance < l.max_distance)
            .unwrap_or(self.config.lod_levels.len() - 1) as u32
    }

    fn update_tile_requests(&mut self, camera: Vec3, frame: u64) {
        for lod in 0..self.config.lod_levels.len() as u32 {
            let ring = self.config.lod_levels[lod as usize];
            let tile_size = self.tile_size_for_lod(lod);
            let radius = (ring.max_distance / tile_size).ceil() as i32 + 1;
            let center = self.world_to_tile_coord(camera.x, camera.z, lod);

            let mut requests = Vec::new();
            for dz in -radius..=radius {
                for dx in -radius..=radius {
                    let coord = TileCoord::new(center.x + dx, center.z + dz, lod);
                    let cx = (coord.x as f32 + 0.5) * tile_size;
                    let cz = (coord.z as f32 + 0.5) * tile_size;
                    let distance = ((cx - camera.x).powi(2) + (cz - camera.z).powi(2)).sqrt();
                    if distance >= ring.min_distance && distance < ring.max_distance {
                        requests.push((coord, distance));
                    }
                }
            }
            requests.sort_by(|a, b| a.1.total_cmp(&b.1));

            let mut issued = 0;
            for (coord, distance) in requests {
                if issued >= self.config.budget.max_load_requests_per_frame {
                    break;
                }
                if self.streaming.is_over_target() {
                    break;
                }
                if self.request_tile_load(coord, distance, frame) {
                    issued += 1;
                }
            }
        }
    }

    fn request_tile_load(&mut self, coord: TileCoord, distance: f32, frame: u64) -> bool {
        let tile = self
            .tiles
            .entry(coord)
            .or_insert_with(|| TerrainTile::new(coord, self.tile_config.clone()));
        if tile.load_state() != TileLoadState::Unloaded || !self.loading.insert(coord) {
            return false;
        }
        tile.set_load_state(TileLoadState::Loading);

        let config = self.tile_config.clone();
        let tx = self.completed_tx.clone();
        self.streaming.submit_work(
            move || {
                let heights = load_heights(coord, &config);
                // The receiver is gone only after shutdown
                let _ = tx.send(CompletedLoad { coord, heights });
            },
            load_priority(coord, distance, frame),
        );
        true
    }

    fn evict_tiles(&mut self, camera: Vec3, uploader: &mut dyn TileUploader) {
        let over_max = self.streaming.is_over_budget();
        let mut candidates: Vec<(TileCoord, f32, u64)> = self
            .tiles
            .values()
            .filter(|tile| tile.load_state() == TileLoadState::Loaded)
            .filter_map(|tile| {
                let distance = tile.distance_to_camera(camera);
                let out_of_range = distance > self.config.unload_distance(tile.lod());
                (out_of_range || over_max).then_some((tile.coord(), distance, tile.last_access_frame()))
            })
            .collect();

        if candidates.is_empty() {
            return;
        }

        candidates.sort_by(|a, b| {
            b.0.lod
                .cmp(&a.0.lod)
                .then_with(|| b.1.total_cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut evicted = 0;
        for (coord, distance, _) in candidates {
            if evicted >= self.config.budget.max_unloads_per_frame {
                break;
            }
            if !self.streaming.is_over_target() && distance <= self.config.unload_distance(coord.lod) {
                break;
            }

            if let Some(mut tile) = self.tiles.remove(&coord) {
                if let Some(resource) = tile.take_gpu_resource() {
                    uploader.release(resource);
                }
                self.streaming.remove_gpu_memory(tile.gpu_memory_usage());
                tile.reset();
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.total_evictions += evicted as u64;
            log::debug!(
                "Terrain: evicted {} tiles, {} KB resident",
                evicted,
                self.streaming.current_gpu_memory() / 1024
            );
        }
    }

    fn has_finer_coverage(&self, world_x: f32, world_z: f32, lod: u32) -> bool {
        (0..lod).any(|finer| self.is_loaded(self.world_to_tile_coord(world_x, world_z, finer)))
    }

    fn is_loaded(&self, coord: TileCoord) -> bool {
        self.tiles
            .get(&coord)
            .is_some_and(|tile| tile.load_state() == TileLoadState::Loaded)
    }

    fn update_visible_tiles(&mut self, camera: Vec3, frame: u64) {
        let mut visible: Vec<(TileCoord, f32)> = self
            .tiles
            .values()
            .filter(|tile| tile.load_state() == TileLoadState::Loaded)
            .filter(|tile| {
                let center = tile.world_center();
                tile.lod() == 0 || !self.has_finer_coverage(center.x, center.y, tile.lod())
            })
            .map(|tile| (tile.coord(), tile.distance_to_camera(camera)))
            .collect();

        visible.sort_by(|a, b| a.0.lod.cmp(&b.0.lod).then_with(|| a.1.total_cmp(&b.1)));

        self.visible.clear();
        for (coord, _) in visible {
            if let Some(tile) = self.tiles.get_mut(&coord) {
                tile.mark_accessed(frame);
            }
            self.visible.push(coord);
        }
    }

    /// Loaded tiles to draw this frame, finest LOD first then nearest first
    pub fn visible_tiles(&self) -> Vec<&TerrainTile> {
        self.visible.iter().filter_map(|c| self.tiles.get(c)).collect()
    }

    /// Every tile with height data and a GPU resource
    pub fn loaded_tiles(&self) -> Vec<&TerrainTile> {
        self.tiles
            .values()
            .filter(|tile| tile.load_state() == TileLoadState::Loaded)
            .collect()
    }

    /// Tracked tile at `coord`, loaded or not
    pub fn tile(&self, coord: TileCoord) -> Option<&TerrainTile> {
        self.tiles.get(&coord)
    }

    /// Finest loaded tile containing a world position
    pub fn tile_at(&self, world_x: f32, world_z: f32) -> Option<&TerrainTile> {
        (0..self.config.lod_levels.len() as u32)
            .map(|lod| self.world_to_tile_coord(world_x, world_z, lod))
            .filter_map(|coord| self.tiles.get(&coord))
            .find(|tile| tile.load_state() == TileLoadState::Loaded)
    }

    /// Whether any loaded tile covers the point
    pub fn has_tile_at(&self, world_x: f32, world_z: f32) -> bool {
        self.tile_at(world_x, world_z).is_some()
    }

    /// Altitude from the finest loaded tile, or 0 where nothing is loaded
    pub fn height_at(&self, world_x: f32, world_z: f32) -> f32 {
        self.tile_at(world_x, world_z)
            .map_or(0.0, |tile| tile.height_at_world(world_x, world_z))
    }

    /// Number of loaded tiles
    pub fn loaded_tile_count(&self) -> usize {
        self.tiles
            .values()
            .filter(|tile| tile.load_state() == TileLoadState::Loaded)
            .count()
    }

    /// Number of tiles with a load in flight
    pub fn loading_tile_count(&self) -> usize {
        self.loading.len()
    }

    /// GPU bytes held by loaded tiles
    pub fn current_gpu_memory(&self) -> usize {
        self.streaming.current_gpu_memory()
    }

    /// Counters for the last update
    pub fn stats(&self) -> TerrainStreamingStats {
        TerrainStreamingStats {
            loaded_tiles: self.loaded_tile_count(),
            loading_tiles: self.loading_tile_count(),
            visible_tiles: self.visible.len(),
            gpu_memory: self.current_gpu_memory(),
            total_evictions: self.total_evictions,
            failed_loads: self.failed_loads,
        }
    }

    pub fn config(&self) -> &TerrainStreamingConfig {
        &self.config
    }

    /// Camera position of the last update
    pub fn last_camera(&self) -> Option<Vec3> {
        self.last_camera
    }

    /// Block until every queued height load has finished
    pub fn wait_for_loads(&self) {
        self.streaming.wait_idle();
    }

    /// Stop the workers and release every tile's GPU resources
    pub fn shutdown(&mut self, uploader: &mut dyn TileUploader) {
        self.streaming.shutdown();
        while self.completed_rx.try_recv().is_ok() {}

        for (_, mut tile) in self.tiles.drain() {
            if let Some(resource) = tile.take_gpu_resource() {
                uploader.release(resource);
                self.streaming.remove_gpu_memory(tile.gpu_memory_usage());
            }
        }
        self.loading.clear();
        self.visible.clear();
    }
}
