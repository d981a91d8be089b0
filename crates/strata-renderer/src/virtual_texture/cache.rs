//! Physical Tile Cache
//!
//! A square atlas of `cache_tiles_per_axis²` tile slots with LRU replacement.
//! Tile pixels reach the atlas through per-frame staging buffers; each frame
//! can stage up to [`MAX_UPLOADS_PER_FRAME`] tiles.

use ahash::AHashMap;
use strata_core::FrameSlots;

use super::{CacheSlot, LoadedTile, TileFormat, TileId, VirtualTextureConfig};
use crate::gpu::{
    Barrier, BufferDesc, BufferHandle, BufferImageCopy, CommandRecorder, GpuDevice, ImageDesc,
    ImageFormat, ImageHandle, ImageLayout, PipelineStages, SamplerDesc, SamplerFilter,
    SamplerHandle,
};
use crate::{RendererError, RendererResult};

/// Tiles that can be staged for upload in one frame
pub const MAX_UPLOADS_PER_FRAME: usize = 16;

/// Result of [`VirtualTextureCache::allocate_slot`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAllocation {
    /// Slot now bound to the requested tile
    pub slot_index: u32,
    /// Tile that previously occupied the slot, if one was evicted
    pub evicted: Option<TileId>,
}

/// Fixed-size LRU tile atlas
pub struct VirtualTextureCache {
    config: VirtualTextureConfig,
    slots: Vec<CacheSlot>,
    tile_to_slot: AHashMap<u32, u32>,
    atlas: ImageHandle,
    atlas_format: ImageFormat,
    sampler: SamplerHandle,
    staging: FrameSlots<BufferHandle>,
    staging_slot_bytes: usize,
    upload_cursor: usize,
}

impl VirtualTextureCache {
    /// Create the atlas, its sampler and per-frame staging buffers
    pub fn new(
        device: &mut dyn GpuDevice,
        config: VirtualTextureConfig,
        frames_in_flight: u32,
        use_compression: bool,
    ) -> RendererResult<Self> {
        config.validate()?;

        let atlas_format = if use_compression {
            ImageFormat::Bc1RgbSrgb
        } else {
            ImageFormat::Rgba8Srgb
        };

        let atlas = device.create_image(
            &ImageDesc::sampled(config.cache_size_pixels, config.cache_size_pixels, atlas_format),
            "vt_cache_atlas",
        )?;
        device.one_shot(&mut |cmd| {
            cmd.pipeline_barrier(
                PipelineStages::TOP_OF_PIPE,
                PipelineStages::FRAGMENT_SHADER,
                &[Barrier::image_init_shader_read(atlas)],
            );
            Ok(())
        })?;

        let sampler = device.create_sampler(
            &SamplerDesc {
                filter: SamplerFilter::Linear,
            },
            "vt_cache_sampler",
        )?;

        let staging_slot_bytes =
            atlas_format.data_size(config.tile_size_pixels, config.tile_size_pixels);
        let staging = FrameSlots::try_new(frames_in_flight, |i| {
            device.create_buffer(
                &BufferDesc::staging((staging_slot_bytes * MAX_UPLOADS_PER_FRAME) as u64),
                &format!("vt_cache_staging{}", i),
            )
        })?;

        let total_slots = config.total_cache_slots() as usize;
        log::info!(
            "VirtualTextureCache initialized: {}x{} tiles ({} slots), format {:?}",
            config.cache_tiles_per_axis(),
            config.cache_tiles_per_axis(),
            total_slots,
            atlas_format
        );

        Ok(Self {
            config,
            slots: vec![CacheSlot::default(); total_slots],
            tile_to_slot: AHashMap::with_capacity(total_slots),
            atlas,
            atlas_format,
            sampler,
            staging,
            staging_slot_bytes,
            upload_cursor: 0,
        })
    }

    /// Bind `id` to a slot, evicting the least recently used tile when full.
    /// Returns `None` only when the cache has no slots.
    pub fn allocate_slot(&mut self, id: TileId, current_frame: u64) -> Option<SlotAllocation> {
        let key = id.pack();
        if let Some(&slot_index) = self.tile_to_slot.get(&key) {
            self.slots[slot_index as usize].last_used_frame = current_frame;
            return Some(SlotAllocation {
                slot_index,
                evicted: None,
            });
        }

        let index = match self.slots.iter().position(|s| !s.occupied) {
            Some(free) => free,
            None => self
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.last_used_frame)
                .map(|(i, _)| i)?,
        };

        let slot = &mut self.slots[index];
        let evicted = if slot.occupied {
            self.tile_to_slot.remove(&slot.tile_id.pack());
            log::debug!("VT cache: evicting tile {} from slot {}", slot.tile_id, index);
            Some(slot.tile_id)
        } else {
            None
        };

        *slot = CacheSlot {
            tile_id: id,
            last_used_frame: current_frame,
            occupied: true,
        };
        self.tile_to_slot.insert(key, index as u32);

        Some(SlotAllocation {
            slot_index: index as u32,
            evicted,
        })
    }

    /// Refresh the LRU stamp of a resident tile
    pub fn mark_used(&mut self, id: TileId, current_frame: u64) {
        if let Some(&slot_index) = self.tile_to_slot.get(&id.pack()) {
            self.slots[slot_index as usize].last_used_frame = current_frame;
        }
    }

    /// Unbind `id`, freeing its slot
    pub fn release(&mut self, id: TileId) -> Option<u32> {
        let slot_index = self.tile_to_slot.remove(&id.pack())?;
        self.slots[slot_index as usize] = CacheSlot::default();
        Some(slot_index)
    }

    /// Whether `id` occupies a slot
    pub fn has_tile(&self, id: TileId) -> bool {
        self.tile_to_slot.contains_key(&id.pack())
    }

    /// Slot bookkeeping for `id`, if resident
    pub fn slot(&self, id: TileId) -> Option<&CacheSlot> {
        self.slot_index(id).map(|i| &self.slots[i as usize])
    }

    /// Slot index of `id`, if resident
    pub fn slot_index(&self, id: TileId) -> Option<u32> {
        self.tile_to_slot.get(&id.pack()).copied()
    }

    /// Grid coordinate of a slot in the atlas
    pub fn slot_coords(&self, slot_index: u32) -> (u16, u16) {
        let n = self.config.cache_tiles_per_axis();
        ((slot_index % n) as u16, (slot_index / n) as u16)
    }

    /// Occupied slots
    pub fn used_slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.occupied).count()
    }

    /// Number of slots in the atlas
    pub fn total_slots(&self) -> usize {
        self.slots.len()
    }

    /// All slots in index order
    pub fn slots(&self) -> &[CacheSlot] {
        &self.slots
    }

    /// Atlas image bound for sampling
    pub fn atlas(&self) -> ImageHandle {
        self.atlas
    }

    /// Pixel format of the atlas
    pub fn atlas_format(&self) -> ImageFormat {
        self.atlas_format
    }

    /// Sampler used with the atlas
    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// Staging buffer used by `frame_index`
    pub fn staging_buffer(&self, frame_index: u32) -> BufferHandle {
        *self.staging.get(frame_index)
    }

    /// Tiles staged so far this frame
    pub fn uploads_this_frame(&self) -> usize {
        self.upload_cursor
    }

    /// Reset the staging cursor; call once per frame before recording uploads
    pub fn begin_frame_uploads(&mut self) {
        self.upload_cursor = 0;
    }

    fn accepts_format(&self, format: TileFormat) -> bool {
        match self.atlas_format {
            ImageFormat::Bc1RgbSrgb => matches!(format, TileFormat::Bc1 | TileFormat::Bc1Srgb),
            _ => format == TileFormat::Rgba8,
        }
    }

    /// Stage `tile` and record its copy into the tile's slot
    pub fn record_tile_upload(
        &mut self,
        device: &mut dyn GpuDevice,
        cmd: &mut dyn CommandRecorder,
        tile: &LoadedTile,
        frame_index: u32,
    ) -> RendererResult<()> {
        let reject = |reason: String| {
            log::warn!("VT cache: rejecting tile {}: {}", tile.id, reason);
            Err(RendererError::TileRejected(format!("tile {}: {}", tile.id, reason)))
        };

        let Some(slot_index) = self.slot_index(tile.id) else {
            return reject("not resident".into());
        };
        if !self.accepts_format(tile.format) {
            return reject(format!(
                "format {:?} does not match cache format {:?}",
                tile.format, self.atlas_format
            ));
        }
        let tile_size = self.config.tile_size_pixels;
        if tile.width > tile_size || tile.height > tile_size {
            return reject(format!(
                "{}x{} exceeds the {}px tile size",
                tile.width, tile.height, tile_size
            ));
        }
        let size = tile.format.data_size(tile.width, tile.height);
        if size > self.staging_slot_bytes {
            return reject(format!(
                "{} bytes exceeds the {} byte staging slot",
                size, self.staging_slot_bytes
            ));
        }
        if tile.pixels.len() < size {
            return reject(format!("{} bytes of pixels, expected {}", tile.pixels.len(), size));
        }
        if self.upload_cursor >= MAX_UPLOADS_PER_FRAME {
            return reject("staging buffer full for this frame".into());
        }

        let staging = *self.staging.get(frame_index);
        let offset = (self.upload_cursor * self.staging_slot_bytes) as u64;
        device.write_buffer(staging, offset, &tile.pixels[..size])?;
        self.upload_cursor += 1;

        let (slot_x, slot_y) = self.slot_coords(slot_index);
        cmd.pipeline_barrier(
            PipelineStages::FRAGMENT_SHADER,
            PipelineStages::TRANSFER,
            &[Barrier::image_to_transfer_dst(self.atlas)],
        );
        cmd.copy_buffer_to_image(
            staging,
            self.atlas,
            ImageLayout::TransferDst,
            &[BufferImageCopy {
                buffer_offset: offset,
                image_offset: [u32::from(slot_x) * tile_size, u32::from(slot_y) * tile_size],
                image_extent: [tile.width, tile.height],
            }],
        );
        cmd.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::FRAGMENT_SHADER,
            &[Barrier::image_to_shader_read(self.atlas)],
        );

        Ok(())
    }

    /// Release GPU resources
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        device.destroy_image(self.atlas);
        device.destroy_sampler(self.sampler);
        for &buffer in self.staging.iter() {
            device.destroy_buffer(buffer);
        }
    }
}
