//! Asynchronous Tile Loader
//!
//! Worker threads pull tile requests from a priority heap, read the tile from
//! disk outside the lock and append the result to a loaded list the render
//! thread drains with [`TileLoader::take_loaded_tiles`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::AHashSet;
use parking_lot::{Condvar, Mutex};
use strata_platform::threading::{join_all, Thread};
use strata_platform::FileSystem;

use super::{dds, LoadedTile, TileFormat, TileId};
use crate::RendererResult;

const CHECKER_SIZE: u32 = 16;
const CHECKER_LIGHT: [u8; 4] = [255, 0, 255, 255];
const CHECKER_DARK: [u8; 4] = [128, 0, 128, 255];
// RGB565 of the checker colours, for solid BC1 blocks
const CHECKER_LIGHT_565: u16 = 0xF81F;
const CHECKER_DARK_565: u16 = 0x8010;

/// Called on a worker thread after a tile is added to the loaded list
pub type TileLoadedCallback = Arc<dyn Fn(TileId) + Send + Sync>;

/// On-disk tile layout: `base/mip{level}/tile_{x}_{y}.{dds|png}`
#[derive(Debug, Clone)]
pub struct TileSource {
    fs: FileSystem,
    tile_size: u32,
    placeholder_format: TileFormat,
}

impl TileSource {
    /// Tiles under `base_path`; missing tiles become `tile_size` placeholders
    pub fn new(base_path: impl Into<PathBuf>, tile_size: u32) -> Self {
        let base_path = base_path.into();
        Self {
            fs: FileSystem::with_dirs(base_path.clone(), base_path),
            tile_size,
            placeholder_format: TileFormat::Rgba8,
        }
    }

    /// Emit placeholders in `format`; `Rgba8` or a BC1 variant, anything else falls back to `Rgba8`
    pub fn with_placeholder_format(mut self, format: TileFormat) -> Self {
        self.placeholder_format = match format {
            TileFormat::Bc1 | TileFormat::Bc1Srgb => format,
            _ => TileFormat::Rgba8,
        };
        self
    }

    /// Format placeholders are generated in
    pub fn placeholder_format(&self) -> TileFormat {
        self.placeholder_format
    }

    /// Root directory of the tile tree
    pub fn base_path(&self) -> &Path {
        self.fs.data_dir()
    }

    /// Path of `id` with extension `ext`
    pub fn tile_path(&self, id: TileId, ext: &str) -> PathBuf {
        self.fs.data_path(format!(
            "mip{}/tile_{}_{}.{}",
            id.mip_level, id.x, id.y, ext
        ))
    }

    /// Load `id` from DDS, then PNG, falling back to a placeholder
    pub fn load(&self, id: TileId) -> LoadedTile {
        let dds_path = self.tile_path(id, "dds");
        if self.fs.is_file(&dds_path) {
            match dds::load(&dds_path) {
                Ok(image) => {
                    return LoadedTile {
                        id,
                        pixels: image.data,
                        width: image.width,
                        height: image.height,
                        format: image.format,
                    };
                }
                Err(e) => log::warn!("Failed to read {}: {}", dds_path.display(), e),
            }
        }

        let png_path = self.tile_path(id, "png");
        if self.fs.is_file(&png_path) {
            match load_png(id, &png_path) {
                Ok(tile) => return tile,
                Err(e) => log::warn!("Failed to decode {}: {}", png_path.display(), e),
            }
        }

        self.placeholder(id)
    }

    /// Magenta checkerboard standing in for a missing tile, in the placeholder format
    pub fn placeholder(&self, id: TileId) -> LoadedTile {
        let size = self.tile_size;
        let format = self.placeholder_format;
        let mut pixels = Vec::with_capacity(format.data_size(size, size));
        if format.is_compressed() {
            // One solid block per 4x4 texels: color0, color1 = 0, all indices 0
            for by in 0..size.div_ceil(4) {
                for bx in 0..size.div_ceil(4) {
                    let color = if is_light_square(bx * 4, by * 4) {
                        CHECKER_LIGHT_565
                    } else {
                        CHECKER_DARK_565
                    };
                    pixels.extend_from_slice(&color.to_le_bytes());
                    pixels.extend_from_slice(&[0; 6]);
                }
            }
        } else {
            for y in 0..size {
                for x in 0..size {
                    let texel = if is_light_square(x, y) { &CHECKER_LIGHT } else { &CHECKER_DARK };
                    pixels.extend_from_slice(texel);
                }
            }
        }
        LoadedTile {
            id,
            pixels,
            width: size,
            height: size,
            format,
        }
    }
}

fn is_light_square(x: u32, y: u32) -> bool {
    (x / CHECKER_SIZE + y / CHECKER_SIZE) % 2 == 0
}

fn load_png(id: TileId, path: &Path) -> RendererResult<LoadedTile> {
    let image = image::open(path)?.to_rgba8();
    let (width, height) = image.dimensions();
    Ok(LoadedTile {
        id,
        pixels: image.into_raw(),
        width,
        height,
        format: TileFormat::Rgba8,
    })
}

#[derive(Debug, Clone, Copy)]
struct LoadRequest {
    id: TileId,
    priority: i32,
    sequence: u64,
}

impl PartialEq for LoadRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LoadRequest {}

impl PartialOrd for LoadRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LoadRequest {
    // Lowest priority value first, then submission order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct LoaderQueue {
    heap: BinaryHeap<LoadRequest>,
    queued: AHashSet<u32>,
    next_sequence: u64,
    running: bool,
    paused: bool,
    active: usize,
}

impl LoaderQueue {
    fn push(&mut self, id: TileId, priority: i32) -> bool {
        if !self.running || !self.queued.insert(id.pack()) {
            return false;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(LoadRequest {
            id,
            priority,
            sequence,
        });
        true
    }

    /// Pop the next request that has not been cancelled
    fn pop_live(&mut self) -> Option<LoadRequest> {
        while let Some(request) = self.heap.pop() {
            if self.queued.remove(&request.id.pack()) {
                return Some(request);
            }
        }
        None
    }

    fn is_idle(&self) -> bool {
        self.active == 0 && self.queued.is_empty()
    }
}

struct Shared {
    queue: Mutex<LoaderQueue>,
    work_available: Condvar,
    idle: Condvar,
    loaded: Mutex<Vec<LoadedTile>>,
    callback: Mutex<Option<TileLoadedCallback>>,
    total_bytes_loaded: AtomicU64,
    source: TileSource,
}

impl Shared {
    fn load(&self, request: LoadRequest) {
        let tile = self.source.load(request.id);
        self.total_bytes_loaded
            .fetch_add(tile.pixels.len() as u64, AtomicOrdering::Relaxed);
        self.loaded.lock().push(tile);

        let callback = self.callback.lock().clone();
        if let Some(callback) = callback {
            callback(request.id);
        }
    }

    fn finish(&self) {
        let mut queue = self.queue.lock();
        queue.active -= 1;
        if queue.is_idle() {
            self.idle.notify_all();
        }
    }
}

/// Priority-ordered, deduplicating tile loader
pub struct TileLoader {
    shared: Arc<Shared>,
    workers: Vec<Thread>,
}

impl TileLoader {
    /// Spawn `num_workers` loader threads. With zero workers requests are only
    /// served by [`process_next`](Self::process_next).
    pub fn new(source: TileSource, num_workers: usize) -> RendererResult<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(LoaderQueue {
                running: true,
                ..Default::default()
            }),
            work_available: Condvar::new(),
            idle: Condvar::new(),
            loaded: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
            total_bytes_loaded: AtomicU64::new(0),
            source,
        });

        let mut loader = Self {
            shared,
            workers: Vec::with_capacity(num_workers),
        };
        for i in 0..num_workers {
            let shared = loader.shared.clone();
            let thread = Thread::spawn(format!("vt-loader-{}", i), move || worker_loop(&shared))?;
            loader.workers.push(thread);
        }

        log::info!(
            "TileLoader started: {} workers, tiles from {}",
            num_workers,
            loader.shared.source.base_path().display()
        );
        Ok(loader)
    }

    /// Queue one tile; returns false if it is already queued
    pub fn queue_tile(&self, id: TileId, priority: i32) -> bool {
        let queued = self.shared.queue.lock().push(id, priority);
        if queued {
            self.shared.work_available.notify_one();
        }
        queued
    }

    /// Queue several tiles at one priority; returns how many were new
    pub fn queue_tiles(&self, ids: &[TileId], priority: i32) -> usize {
        let added = {
            let mut queue = self.shared.queue.lock();
            ids.iter().filter(|&&id| queue.push(id, priority)).count()
        };
        if added > 0 {
            self.shared.work_available.notify_all();
        }
        added
    }

    /// Whether `id` is waiting in the queue
    pub fn is_queued(&self, id: TileId) -> bool {
        self.shared.queue.lock().queued.contains(&id.pack())
    }

    /// Drop a queued request. A load already in progress still completes.
    pub fn cancel_tile(&self, id: TileId) -> bool {
        let mut queue = self.shared.queue.lock();
        let removed = queue.queued.remove(&id.pack());
        if removed && queue.is_idle() {
            self.shared.idle.notify_all();
        }
        removed
    }

    /// Drop every queued request
    pub fn clear_queue(&self) {
        let mut queue = self.shared.queue.lock();
        queue.heap.clear();
        queue.queued.clear();
        if queue.is_idle() {
            self.shared.idle.notify_all();
        }
    }

    /// Requests waiting in the queue
    pub fn pending_count(&self) -> usize {
        self.shared.queue.lock().queued.len()
    }

    /// Finished tiles waiting to be taken
    pub fn loaded_count(&self) -> usize {
        self.shared.loaded.lock().len()
    }

    /// Bytes of pixel data loaded since creation
    pub fn total_bytes_loaded(&self) -> u64 {
        self.shared.total_bytes_loaded.load(AtomicOrdering::Relaxed)
    }

    /// Drain finished tiles
    pub fn take_loaded_tiles(&self) -> Vec<LoadedTile> {
        std::mem::take(&mut *self.shared.loaded.lock())
    }

    /// Install a callback run after each tile load
    pub fn set_callback(&self, callback: TileLoadedCallback) {
        *self.shared.callback.lock() = Some(callback);
    }

    /// Remove the load callback
    pub fn clear_callback(&self) {
        *self.shared.callback.lock() = None;
    }

    /// Number of worker threads
    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    /// Where tiles are read from
    pub fn source(&self) -> &TileSource {
        &self.shared.source
    }

    /// Stop workers from picking up new requests
    pub fn pause(&self) {
        self.shared.queue.lock().paused = true;
    }

    /// Let workers pick up queued requests again
    pub fn resume(&self) {
        self.shared.queue.lock().paused = false;
        self.shared.work_available.notify_all();
    }

    /// Load the next queued tile on the calling thread
    pub fn process_next(&self) -> bool {
        let request = {
            let mut queue = self.shared.queue.lock();
            if !queue.running {
                return false;
            }
            match queue.pop_live() {
                Some(request) => {
                    queue.active += 1;
                    request
                }
                None => return false,
            }
        };
        self.shared.load(request);
        self.shared.finish();
        true
    }

    /// Block until every queued request has been loaded. Returns immediately
    /// when there are no workers or the loader is paused.
    pub fn wait_idle(&self) {
        let mut queue = self.shared.queue.lock();
        if self.workers.is_empty() {
            return;
        }
        while queue.running && (queue.active > 0 || (!queue.queued.is_empty() && !queue.paused)) {
            self.shared.idle.wait(&mut queue);
        }
    }
}

impl Drop for TileLoader {
    fn drop(&mut self) {
        self.shared.queue.lock().running = false;
        self.shared.work_available.notify_all();
        self.shared.idle.notify_all();

        join_all(&mut self.workers);

        {
            let mut queue = self.shared.queue.lock();
            queue.heap.clear();
            queue.queued.clear();
        }
        self.shared.loaded.lock().clear();
        log::debug!("TileLoader shut down");
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let request = {
            let mut queue = shared.queue.lock();
            loop {
                while queue.running && (queue.heap.is_empty() || queue.paused) {
                    shared.work_available.wait(&mut queue);
                }
                if !queue.running {
                    return;
                }
                if let Some(request) = queue.pop_live() {
                    queue.active += 1;
                    break request;
                }
                // Only cancelled requests were left
                if queue.is_idle() {
                    shared.idle.notify_all();
                }
            }
        };

        shared.load(request);
        shared.finish();
    }
}
