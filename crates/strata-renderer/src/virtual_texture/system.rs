//! Virtual Texture System
//!
//! Per-frame admission and eviction loop tying feedback, loader, cache and
//! page table together. Under cache pressure new requests are biased towards
//! coarser mips by an integer mip penalty that relaxes once pressure subsides.

use std::collections::VecDeque;

use ahash::AHashMap;
use serde::Serialize;
use strata_core::FrameCompletion;
use strata_platform::ScopedTimer;

use super::cache::{VirtualTextureCache, MAX_UPLOADS_PER_FRAME};
use super::feedback::VirtualTextureFeedback;
use super::page_table::VirtualTexturePageTable;
use super::tile_loader::{TileLoader, TileSource};
use super::{
    LoadedTile, TileFormat, TileId, VirtualTextureConfig, VirtualTextureSettings, VtParamsUbo,
};
use crate::gpu::{CommandRecorder, GpuDevice};
use crate::{RendererError, RendererResult};

/// Largest mip bias applied to requests
pub const MAX_PENALTY: f32 = 4.0;
/// Penalty added per frame while projected usage exceeds the target
pub const PENALTY_INCREMENT: f32 = 0.5;
/// Penalty removed per frame once pressure subsides
pub const PENALTY_RELAX_RATE: f32 = 0.1;
/// Cache utilization above which the penalty grows
pub const TARGET_UTILIZATION: f32 = 0.8;
/// New tiles queued from feedback per frame
pub const MAX_REQUESTS_PER_FRAME: usize = 64;

/// Penalty after one frame.
///
/// `projected_usage` is `None` when the frame produced no feedback; the
/// penalty then relaxes only while nothing is pending.
pub fn next_penalty(current: f32, projected_usage: Option<f32>, has_pending: bool) -> f32 {
    let relaxed = (current - PENALTY_RELAX_RATE).max(0.0);
    match projected_usage {
        None if has_pending => current,
        None => relaxed,
        Some(usage) if usage > TARGET_UTILIZATION => (current + PENALTY_INCREMENT).min(MAX_PENALTY),
        Some(usage) if usage < TARGET_UTILIZATION * 0.5 => relaxed,
        Some(_) => current,
    }
}

/// Where a tracked tile is in its lifecycle. Untracked tiles are unseen or evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileResidency {
    /// Queued in or being read by the loader
    Requested,
    /// Loaded, waiting for upload capacity in a later frame
    AwaitingUpload,
    /// In the cache at `slot`
    Resident { slot: u32 },
}

/// Snapshot of system activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct VirtualTextureStats {
    pub frame: u64,
    pub penalty: f32,
    pub resident_tiles: usize,
    pub requested_tiles: usize,
    pub awaiting_upload: usize,
    pub total_slots: usize,
    pub requests_this_frame: usize,
    pub uploads_this_frame: usize,
    pub total_evictions: u64,
    pub failed_uploads: u64,
    pub bytes_loaded: u64,
}

/// Feedback-driven virtual texture streaming
pub struct VirtualTextureSystem {
    config: VirtualTextureConfig,
    frames_in_flight: u32,
    cache: VirtualTextureCache,
    page_table: VirtualTexturePageTable,
    feedback: VirtualTextureFeedback,
    loader: TileLoader,
    residency: AHashMap<u32, TileResidency>,
    carry_over: VecDeque<LoadedTile>,
    penalty: f32,
    current_frame: u64,
    requests_this_frame: usize,
    uploads_this_frame: usize,
    total_evictions: u64,
    failed_uploads: u64,
}

impl VirtualTextureSystem {
    /// Create GPU resources and start the tile loader
    pub fn new(device: &mut dyn GpuDevice, settings: VirtualTextureSettings) -> RendererResult<Self> {
        let config = settings.config;
        config.validate()?;
        let frames_in_flight = settings.frames_in_flight.max(1);

        let cache = VirtualTextureCache::new(device, config, frames_in_flight, settings.use_compression)?;
        let page_table = VirtualTexturePageTable::new(device, config, frames_in_flight)?;
        let feedback = VirtualTextureFeedback::new(device, settings.feedback_entries, frames_in_flight)?;
        let placeholder_format = if settings.use_compression {
            TileFormat::Bc1Srgb
        } else {
            TileFormat::Rgba8
        };
        let loader = TileLoader::new(
            TileSource::new(settings.tile_path.clone(), config.tile_size_pixels)
                .with_placeholder_format(placeholder_format),
            settings.loader_workers,
        )?;

        log::info!(
            "VirtualTextureSystem initialized: {}px virtual ({} tiles/axis, {} mips), {} cache slots, {} frames in flight",
            config.virtual_size_pixels,
            config.tiles_per_axis(),
            config.max_mip_levels,
            config.total_cache_slots(),
            frames_in_flight
        );

        Ok(Self {
            config,
            frames_in_flight,
            cache,
            page_table,
            feedback,
            loader,
            residency: AHashMap::new(),
            carry_over: VecDeque::new(),
            penalty: 0.0,
            current_frame: 0,
            requests_this_frame: 0,
            uploads_this_frame: 0,
            total_evictions: 0,
            failed_uploads: 0,
        })
    }

    /// Reset this frame's feedback counter; record before the draws that sample the texture
    pub fn begin_frame(&self, cmd: &mut dyn CommandRecorder, frame_index: u32) {
        self.feedback.clear(cmd, frame_index);
    }

    /// Copy this frame's feedback for readback; record after the draws
    pub fn end_frame(&self, cmd: &mut dyn CommandRecorder, frame_index: u32) {
        self.feedback.record_copy_to_readback(cmd, frame_index);
    }

    /// Run one frame of streaming.
    ///
    /// `completion` must come from waiting on `frame_index`'s fence: it
    /// guards both the feedback readback (written `frames_in_flight` frames
    /// ago) and reuse of this frame's staging memory.
    pub fn update(
        &mut self,
        device: &mut dyn GpuDevice,
        cmd: &mut dyn CommandRecorder,
        frame_index: u32,
        completion: &FrameCompletion,
    ) -> RendererResult<()> {
        let _timer = ScopedTimer::traced("vt_update");
        completion.ensure_covers(frame_index, self.frames_in_flight)?;

        self.current_frame += 1;
        self.requests_this_frame = 0;

        let requested = if self.current_frame > u64::from(self.frames_in_flight) {
            self.feedback.readback(device, completion)?.to_vec()
        } else {
            Vec::new()
        };
        self.process_feedback(&requested);

        self.process_loaded_tiles(device, cmd, frame_index);
        self.page_table.record_upload(device, cmd, frame_index)?;

        log::debug!(
            "VT frame {}: {} feedback, {} requested, {} uploaded, penalty {:.1}",
            self.current_frame,
            requested.len(),
            self.requests_this_frame,
            self.uploads_this_frame,
            self.penalty
        );
        Ok(())
    }

    fn frame_stamp(&self) -> u64 {
        self.current_frame
    }

    fn pending_count(&self) -> usize {
        self.residency
            .values()
            .filter(|r| !matches!(r, TileResidency::Resident { .. }))
            .count()
    }

    fn process_feedback(&mut self, requested: &[TileId]) {
        let pending = self.pending_count();
        let projected = if requested.is_empty() {
            None
        } else {
            let new_requests = requested
                .iter()
                .filter(|id| !self.residency.contains_key(&id.pack()) && !self.loader.is_queued(**id))
                .count();
            let used = self.cache.used_slot_count();
            Some((used + pending + new_requests) as f32 / self.cache.total_slots() as f32)
        };
        self.penalty = next_penalty(self.penalty, projected, pending > 0);

        let shift = self.penalty.floor() as u8;
        let max_mip = (self.config.max_mip_levels - 1) as u8;
        for id in requested {
            if self.requests_this_frame >= MAX_REQUESTS_PER_FRAME {
                break;
            }
            let adjusted = id.coarser(shift, max_mip);
            if self.page_table.entry_index(adjusted).is_none() {
                log::debug!("VT feedback: ignoring out-of-range tile {}", adjusted);
                continue;
            }
            self.admit(adjusted, i32::from(adjusted.mip_level));
        }
    }

    /// Queue `id` unless it is already tracked; resident tiles are marked used
    fn admit(&mut self, id: TileId, priority: i32) -> bool {
        match self.residency.get(&id.pack()) {
            Some(TileResidency::Resident { .. }) => {
                self.cache.mark_used(id, self.frame_stamp());
                false
            }
            Some(_) => false,
            None => {
                if !self.loader.queue_tile(id, priority) {
                    return false;
                }
                self.residency.insert(id.pack(), TileResidency::Requested);
                self.requests_this_frame += 1;
                true
            }
        }
    }

    /// Request `id` ahead of feedback at the highest priority.
    /// Returns false if the tile is out of range or already tracked.
    pub fn request_tile(&mut self, id: TileId) -> bool {
        if self.page_table.entry_index(id).is_none() {
            log::warn!("VT: ignoring request for out-of-range tile {}", id);
            return false;
        }
        self.admit(id, 0)
    }

    fn process_loaded_tiles(
        &mut self,
        device: &mut dyn GpuDevice,
        cmd: &mut dyn CommandRecorder,
        frame_index: u32,
    ) {
        self.cache.begin_frame_uploads();
        self.uploads_this_frame = 0;

        let mut incoming = std::mem::take(&mut self.carry_over);
        incoming.extend(self.loader.take_loaded_tiles());

        while let Some(tile) = incoming.pop_front() {
            let key = tile.id.pack();
            match self.residency.get(&key) {
                Some(TileResidency::Requested) | Some(TileResidency::AwaitingUpload) => {}
                _ => {
                    log::debug!("VT: dropping untracked tile {}", tile.id);
                    continue;
                }
            }

            if self.uploads_this_frame >= MAX_UPLOADS_PER_FRAME {
                self.residency.insert(key, TileResidency::AwaitingUpload);
                self.carry_over.push_back(tile);
                continue;
            }

            match self.upload_tile(device, cmd, &tile, frame_index) {
                Ok(slot) => {
                    self.residency.insert(key, TileResidency::Resident { slot });
                    self.uploads_this_frame += 1;
                }
                Err(e) => {
                    log::warn!("VT: failed to upload tile {}: {}", tile.id, e);
                    self.residency.remove(&key);
                    self.failed_uploads += 1;
                }
            }
        }
    }

    fn upload_tile(
        &mut self,
        device: &mut dyn GpuDevice,
        cmd: &mut dyn CommandRecorder,
        tile: &LoadedTile,
        frame_index: u32,
    ) -> RendererResult<u32> {
        if !tile.is_valid() {
            return Err(RendererError::TileRejected(format!("tile {} has no pixels", tile.id)));
        }

        let allocation = self
            .cache
            .allocate_slot(tile.id, self.frame_stamp())
            .ok_or_else(|| RendererError::TileRejected("cache has no slots".into()))?;

        if let Some(evicted) = allocation.evicted {
            self.page_table.clear_entry(evicted);
            self.residency.remove(&evicted.pack());
            self.total_evictions += 1;
        }

        if let Err(e) = self.cache.record_tile_upload(device, cmd, tile, frame_index) {
            self.cache.release(tile.id);
            return Err(e);
        }

        let (cache_x, cache_y) = self.cache.slot_coords(allocation.slot_index);
        self.page_table.set_entry(tile.id, cache_x, cache_y);
        Ok(allocation.slot_index)
    }

    /// Shader parameters for sampling this texture
    pub fn params(&self) -> VtParamsUbo {
        VtParamsUbo::from_config(&self.config)
    }

    /// Snapshot of residency and per-frame counters
    pub fn stats(&self) -> VirtualTextureStats {
        let mut stats = VirtualTextureStats {
            frame: self.current_frame,
            penalty: self.penalty,
            total_slots: self.cache.total_slots(),
            requests_this_frame: self.requests_this_frame,
            uploads_this_frame: self.uploads_this_frame,
            total_evictions: self.total_evictions,
            failed_uploads: self.failed_uploads,
            bytes_loaded: self.loader.total_bytes_loaded(),
            ..Default::default()
        };
        for residency in self.residency.values() {
            match residency {
                TileResidency::Requested => stats.requested_tiles += 1,
                TileResidency::AwaitingUpload => stats.awaiting_upload += 1,
                TileResidency::Resident { .. } => stats.resident_tiles += 1,
            }
        }
        stats
    }

    /// Current mip penalty
    pub fn penalty(&self) -> f32 {
        self.penalty
    }

    /// Lifecycle state of `id`; `None` when unseen or evicted
    pub fn residency(&self, id: TileId) -> Option<TileResidency> {
        self.residency.get(&id.pack()).copied()
    }

    /// Whether `id` is in the cache and mapped
    pub fn is_resident(&self, id: TileId) -> bool {
        matches!(self.residency(id), Some(TileResidency::Resident { .. }))
    }

    /// Texture layout this system was built with
    pub fn config(&self) -> &VirtualTextureConfig {
        &self.config
    }

    /// Number of per-frame resource sets
    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Number of `update` calls so far
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    /// Physical cache
    pub fn cache(&self) -> &VirtualTextureCache {
        &self.cache
    }

    /// Page table indirection
    pub fn page_table(&self) -> &VirtualTexturePageTable {
        &self.page_table
    }

    /// Feedback buffers to bind for the shading pass
    pub fn feedback(&self) -> &VirtualTextureFeedback {
        &self.feedback
    }

    /// Background tile loader
    pub fn loader(&self) -> &TileLoader {
        &self.loader
    }

    /// Release GPU resources. The loader stops when the system is dropped.
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.loader.clear_queue();
        self.cache.destroy(device);
        self.page_table.destroy(device);
        self.feedback.destroy(device);
        self.residency.clear();
        self.carry_over.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{CommandList, HeadlessDevice};
    use crate::virtual_texture::PageTableEntry;

    fn settings(dir: &tempfile::TempDir, cache_size_pixels: u32, loader_workers: usize) -> VirtualTextureSettings {
        VirtualTextureSettings {
            config: VirtualTextureConfig {
                virtual_size_pixels: 4096,
                tile_size_pixels: 128,
                cache_size_pixels,
                border_pixels: 4,
                max_mip_levels: 3,
            },
            tile_path: dir.path().to_path_buf(),
            frames_in_flight: 2,
            loader_workers,
            feedback_entries: 256,
            use_compression: false,
        }
    }

    /// One full frame: update, feedback clear, simulated shader writes, feedback copy
    fn run_frame(system: &mut VirtualTextureSystem, device: &mut HeadlessDevice, frame_index: u32, shader_ids: &[TileId]) {
        let token = FrameCompletion::wait(&*device, frame_index).unwrap();
        let mut cmd = CommandList::new();
        system.update(device, &mut cmd, frame_index, &token).unwrap();
        system.begin_frame(&mut cmd, frame_index);
        device.submit(&cmd).unwrap();

        let feedback = system.feedback();
        let storage = device.buffer_data_mut(feedback.storage_buffer(frame_index)).unwrap();
        for (i, id) in shader_ids.iter().enumerate() {
            storage[i * 4..i * 4 + 4].copy_from_slice(&id.pack().to_le_bytes());
        }
        let counter = device.buffer_data_mut(feedback.counter_buffer(frame_index)).unwrap();
        counter.copy_from_slice(&(shader_ids.len() as u32).to_le_bytes());

        let mut end = CommandList::new();
        system.end_frame(&mut end, frame_index);
        device.submit(&end).unwrap();
    }

    #[test]
    fn test_penalty_increases_to_max() {
        let mut penalty = 0.0;
        let mut previous = -1.0;
        for _ in 0..20 {
            penalty = next_penalty(penalty, Some(1.5), true);
            assert!(penalty > previous || penalty == MAX_PENALTY);
            previous = penalty;
        }
        assert_eq!(penalty, MAX_PENALTY);
        assert_eq!(next_penalty(MAX_PENALTY, Some(0.81), false), MAX_PENALTY);
    }

    #[test]
    fn test_penalty_relaxes_to_zero() {
        let mut penalty = MAX_PENALTY;
        for _ in 0..60 {
            let next = next_penalty(penalty, Some(0.05), false);
            assert!(next < penalty || next == 0.0);
            penalty = next;
        }
        assert_eq!(penalty, 0.0);

        let mut idle = 1.0;
        for _ in 0..20 {
            idle = next_penalty(idle, None, false);
        }
        assert_eq!(idle, 0.0);
    }

    #[test]
    fn test_penalty_holds_while_pending_or_in_band() {
        assert_eq!(next_penalty(2.0, None, true), 2.0);
        assert_eq!(next_penalty(2.0, Some(0.6), false), 2.0);
        assert_eq!(next_penalty(2.0, Some(0.8), true), 2.0);
        assert!((next_penalty(2.0, Some(0.39), true) - 1.9).abs() < 1e-6);
    }

    #[test]
    fn test_end_to_end_lru_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 512, 1)).unwrap();
        assert_eq!(system.cache().total_slots(), 16);

        let ids: Vec<TileId> = (0..20).map(|i| TileId::new(i, 0, 0)).collect();
        for (frame, &id) in ids.iter().enumerate() {
            assert!(system.request_tile(id));
            system.loader().wait_idle();
            run_frame(&mut system, &mut device, frame as u32, &[]);
        }

        assert_eq!(system.cache().used_slot_count(), 16);
        for &id in &ids[..4] {
            assert!(!system.cache().has_tile(id));
            assert_eq!(system.residency(id), None);
            assert_eq!(system.page_table().entry(id), PageTableEntry::default());
        }
        for &id in &ids[4..] {
            assert!(system.is_resident(id));
            let slot = system.cache().slot_index(id).unwrap();
            let (x, y) = system.cache().slot_coords(slot);
            assert_eq!(
                system.page_table().entry(id),
                PageTableEntry {
                    cache_x: x,
                    cache_y: y,
                    valid: true
                }
            );
        }

        let stats = system.stats();
        assert_eq!(stats.resident_tiles, 16);
        assert_eq!(stats.total_evictions, 4);
        assert_eq!(stats.failed_uploads, 0);
    }

    #[test]
    fn test_upload_overflow_carries_over() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 1024, 0)).unwrap();

        for i in 0..20 {
            system.request_tile(TileId::new(i, 1, 0));
        }
        while system.loader().process_next() {}

        run_frame(&mut system, &mut device, 0, &[]);
        let stats = system.stats();
        assert_eq!(stats.uploads_this_frame, MAX_UPLOADS_PER_FRAME);
        assert_eq!(stats.resident_tiles, 16);
        assert_eq!(stats.awaiting_upload, 4);

        run_frame(&mut system, &mut device, 1, &[]);
        let stats = system.stats();
        assert_eq!(stats.uploads_this_frame, 4);
        assert_eq!(stats.resident_tiles, 20);
        assert_eq!(stats.awaiting_upload, 0);
    }

    #[test]
    fn test_feedback_drives_requests() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 1024, 0)).unwrap();
        let wanted = [TileId::new(3, 4, 1), TileId::new(7, 2, 0)];

        // Written in frame 1, read back in frame 3
        run_frame(&mut system, &mut device, 0, &wanted);
        run_frame(&mut system, &mut device, 1, &[]);
        assert_eq!(system.residency(wanted[0]), None);
        run_frame(&mut system, &mut device, 0, &[]);

        for id in wanted {
            assert_eq!(system.residency(id), Some(TileResidency::Requested));
            assert!(system.loader().is_queued(id));
        }
        assert_eq!(system.stats().requests_this_frame, 2);

        while system.loader().process_next() {}
        run_frame(&mut system, &mut device, 1, &[]);
        for id in wanted {
            assert!(system.is_resident(id));
        }
    }

    #[test]
    fn test_pending_tiles_do_not_consume_request_cap() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 4096, 0)).unwrap();

        let pending: Vec<TileId> = (0..64u16).map(|i| TileId::new(i % 32, 1 + i / 32, 0)).collect();
        for id in &pending {
            assert!(system.request_tile(*id));
        }
        let fresh: Vec<TileId> = (0..6u16).map(|x| TileId::new(x, 0, 1)).collect();
        let feedback: Vec<TileId> = pending.iter().chain(&fresh).copied().collect();

        for frame in 0..3u32 {
            run_frame(&mut system, &mut device, frame % 2, &feedback);
        }

        assert_eq!(system.penalty(), 0.0);
        for id in &fresh {
            assert_eq!(system.residency(*id), Some(TileResidency::Requested));
        }
        assert_eq!(system.stats().requests_this_frame, 6);
    }

    #[test]
    fn test_request_cap_counts_queued_tiles() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 4096, 0)).unwrap();
        let wanted: Vec<TileId> = (0..100u16).map(|i| TileId::new(i % 32, 1 + i / 32, 0)).collect();

        for frame in 0..3u32 {
            run_frame(&mut system, &mut device, frame % 2, &wanted);
        }
        assert_eq!(system.stats().requests_this_frame, MAX_REQUESTS_PER_FRAME);
        assert_eq!(system.stats().requested_tiles, MAX_REQUESTS_PER_FRAME);

        // The next readback admits the rest
        run_frame(&mut system, &mut device, 1, &wanted);
        assert_eq!(system.stats().requests_this_frame, 100 - MAX_REQUESTS_PER_FRAME);
        assert_eq!(system.stats().requested_tiles, 100);
    }

    #[test]
    fn test_pressure_biases_to_coarser_mips() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        // Four slots, nothing loads
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 256, 0)).unwrap();
        let wanted: Vec<TileId> = (0..10).map(|i| TileId::new(i * 2, 0, 0)).collect();

        for frame in 0..4u32 {
            run_frame(&mut system, &mut device, frame % 2, &wanted);
        }

        // Readbacks in frames 3 and 4 each raised the penalty
        assert_eq!(system.penalty(), 1.0);
        assert_eq!(system.residency(TileId::new(0, 0, 0)), Some(TileResidency::Requested));
        assert_eq!(system.residency(TileId::new(9, 0, 1)), Some(TileResidency::Requested));
    }

    #[test]
    fn test_request_tile_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 512, 0)).unwrap();

        assert!(!system.request_tile(TileId::new(32, 0, 0)));
        assert!(!system.request_tile(TileId::new(0, 0, 3)));

        let id = TileId::new(31, 31, 0);
        assert!(system.request_tile(id));
        assert!(!system.request_tile(id));
        assert_eq!(system.residency(id), Some(TileResidency::Requested));
    }

    #[test]
    fn test_compressed_cache_accepts_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut vt_settings = settings(&dir, 512, 0);
        vt_settings.use_compression = true;
        let mut system = VirtualTextureSystem::new(&mut device, vt_settings).unwrap();

        let id = TileId::new(4, 4, 0);
        for frame in 0..12u32 {
            run_frame(&mut system, &mut device, frame % 2, &[id]);
            while system.loader().process_next() {}
        }

        assert!(system.is_resident(id));
        assert_eq!(system.stats().failed_uploads, 0);
        assert!(system.page_table().entry(id).valid);
        // Loaded once, never reloaded after becoming resident
        assert_eq!(system.stats().bytes_loaded, 32 * 32 * 8);
    }

    #[test]
    fn test_rejected_upload_returns_tile_to_unseen() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 512, 0)).unwrap();

        // A PNG tile larger than the 128px tile size is rejected by the cache
        let id = TileId::new(1, 1, 0);
        let path = dir.path().join("mip0/tile_1_1.png");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        image::RgbaImage::new(256, 256).save(&path).unwrap();

        system.request_tile(id);
        while system.loader().process_next() {}
        run_frame(&mut system, &mut device, 0, &[]);

        assert_eq!(system.residency(id), None);
        assert!(!system.cache().has_tile(id));
        assert_eq!(system.cache().used_slot_count(), 0);
        assert_eq!(system.stats().failed_uploads, 1);
        assert!(system.request_tile(id));
    }

    #[test]
    fn test_update_requires_matching_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 512, 0)).unwrap();

        let token = FrameCompletion::wait(&device, 1).unwrap();
        let mut cmd = CommandList::new();
        let result = system.update(&mut device, &mut cmd, 0, &token);
        assert!(matches!(result, Err(RendererError::Core(_))));
        assert_eq!(system.current_frame(), 0);
    }

    #[test]
    fn test_params_and_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let mut device = HeadlessDevice::new();
        let mut system = VirtualTextureSystem::new(&mut device, settings(&dir, 512, 0)).unwrap();

        let params = system.params();
        assert_eq!(params.max_mip_level, 2);
        assert_eq!(params.physical_cache_size_and_inverse[0], 512.0);

        assert!(device.buffer_count() > 0);
        system.destroy(&mut device);
        assert_eq!(device.buffer_count(), 0);
        assert_eq!(device.image_count(), 0);
    }
}
