//! Page Table
//!
//! CPU mirror of the per-mip indirection images. Each entry maps one virtual
//! tile to a cache slot; entries are stored flat with per-mip offsets and
//! uploaded only for mips that changed.

use smallvec::SmallVec;
use strata_core::FrameSlots;

use super::{PageTableEntry, TileId, VirtualTextureConfig};
use crate::gpu::{
    Barrier, BufferDesc, BufferHandle, BufferImageCopy, CommandRecorder, GpuDevice, ImageDesc,
    ImageFormat, ImageHandle, ImageLayout, PipelineStages, SamplerDesc, SamplerFilter,
    SamplerHandle,
};
use crate::RendererResult;

/// Per-mip virtual-to-physical tile mapping
pub struct VirtualTexturePageTable {
    config: VirtualTextureConfig,
    entries: Vec<PageTableEntry>,
    mip_offsets: Vec<usize>,
    mip_dirty: SmallVec<[bool; 16]>,
    dirty: bool,
    images: Vec<ImageHandle>,
    sampler: SamplerHandle,
    staging: FrameSlots<BufferHandle>,
}

impl VirtualTexturePageTable {
    /// Create the page table images, sampler and per-frame staging buffers
    pub fn new(
        device: &mut dyn GpuDevice,
        config: VirtualTextureConfig,
        frames_in_flight: u32,
    ) -> RendererResult<Self> {
        config.validate()?;

        let mut mip_offsets = Vec::with_capacity(config.max_mip_levels as usize);
        let mut total_entries = 0usize;
        for mip in 0..config.max_mip_levels {
            mip_offsets.push(total_entries);
            let n = config.tiles_at_mip(mip) as usize;
            total_entries += n * n;
        }

        let mut images = Vec::with_capacity(config.max_mip_levels as usize);
        for mip in 0..config.max_mip_levels {
            let n = config.tiles_at_mip(mip);
            let image = device.create_image(
                &ImageDesc::sampled(n, n, ImageFormat::Rgba8Uint),
                &format!("vt_page_table_mip{}", mip),
            )?;
            images.push(image);
        }

        let barriers: Vec<Barrier> = images
            .iter()
            .map(|&image| Barrier::image_init_shader_read(image))
            .collect();
        device.one_shot(&mut |cmd| {
            cmd.pipeline_barrier(
                PipelineStages::TOP_OF_PIPE,
                PipelineStages::FRAGMENT_SHADER,
                &barriers,
            );
            Ok(())
        })?;

        let sampler = device.create_sampler(
            &SamplerDesc {
                filter: SamplerFilter::Nearest,
            },
            "vt_page_table_sampler",
        )?;

        // Sized for the whole table so every dirty mip packs at its own offset.
        let staging_size = (total_entries * std::mem::size_of::<u32>()) as u64;
        let staging = FrameSlots::try_new(frames_in_flight, |i| {
            device.create_buffer(
                &BufferDesc::staging(staging_size),
                &format!("vt_page_table_staging{}", i),
            )
        })?;

        log::info!(
            "VirtualTexturePageTable initialized: {} mip levels, {} total entries, {} staging buffers",
            config.max_mip_levels,
            total_entries,
            staging.len()
        );

        Ok(Self {
            config,
            entries: vec![PageTableEntry::default(); total_entries],
            mip_offsets,
            mip_dirty: SmallVec::from_elem(false, config.max_mip_levels as usize),
            dirty: false,
            images,
            sampler,
            staging,
        })
    }

    /// Flat index of `id`, or `None` when out of range
    pub fn entry_index(&self, id: TileId) -> Option<usize> {
        let mip = u32::from(id.mip_level);
        if mip >= self.config.max_mip_levels {
            return None;
        }
        let n = self.config.tiles_at_mip(mip) as usize;
        let (x, y) = (id.x as usize, id.y as usize);
        if x >= n || y >= n {
            return None;
        }
        Some(self.mip_offsets[mip as usize] + y * n + x)
    }

    /// Map `id` to cache slot `(cache_x, cache_y)`; out-of-range ids are ignored
    pub fn set_entry(&mut self, id: TileId, cache_x: u16, cache_y: u16) {
        if let Some(index) = self.entry_index(id) {
            self.entries[index] = PageTableEntry {
                cache_x,
                cache_y,
                valid: true,
            };
            self.mark_dirty(id.mip_level);
        }
    }

    /// Invalidate `id`; out-of-range ids are ignored
    pub fn clear_entry(&mut self, id: TileId) {
        if let Some(index) = self.entry_index(id) {
            self.entries[index] = PageTableEntry::default();
            self.mark_dirty(id.mip_level);
        }
    }

    fn mark_dirty(&mut self, mip: u8) {
        self.mip_dirty[mip as usize] = true;
        self.dirty = true;
    }

    /// Entry for `id`, default (invalid) when out of range
    pub fn entry(&self, id: TileId) -> PageTableEntry {
        self.entry_index(id)
            .map(|i| self.entries[i])
            .unwrap_or_default()
    }

    /// Whether any entry changed since the last upload
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether `mip` changed since the last upload
    pub fn is_mip_dirty(&self, mip: u32) -> bool {
        self.mip_dirty.get(mip as usize).copied().unwrap_or(false)
    }

    /// Number of entries across all mips
    pub fn total_entries(&self) -> usize {
        self.entries.len()
    }

    /// Offset of `mip`'s first entry
    pub fn mip_offset(&self, mip: u32) -> Option<usize> {
        self.mip_offsets.get(mip as usize).copied()
    }

    /// Page table image for `mip`
    pub fn image(&self, mip: u32) -> Option<ImageHandle> {
        self.images.get(mip as usize).copied()
    }

    /// All page table images, finest mip first
    pub fn images(&self) -> &[ImageHandle] {
        &self.images
    }

    /// Nearest-filtering sampler for the page table
    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// Staging buffer used by `frame_index`
    pub fn staging_buffer(&self, frame_index: u32) -> BufferHandle {
        *self.staging.get(frame_index)
    }

    /// Pack dirty mips into this frame's staging buffer and record their uploads.
    /// Returns the number of mips uploaded.
    pub fn record_upload(
        &mut self,
        device: &mut dyn GpuDevice,
        cmd: &mut dyn CommandRecorder,
        frame_index: u32,
    ) -> RendererResult<u32> {
        if !self.dirty {
            return Ok(0);
        }

        let staging = *self.staging.get(frame_index);
        let mut uploaded = 0;

        for mip in 0..self.config.max_mip_levels {
            if !self.mip_dirty[mip as usize] {
                continue;
            }

            let n = self.config.tiles_at_mip(mip);
            let offset = self.mip_offsets[mip as usize];
            let count = (n * n) as usize;

            let mapped = device.mapped_mut(staging)?;
            let dst = &mut mapped[offset * 4..(offset + count) * 4];
            for (texel, entry) in dst
                .chunks_exact_mut(4)
                .zip(&self.entries[offset..offset + count])
            {
                texel.copy_from_slice(&entry.pack_rgba8().to_le_bytes());
            }

            let image = self.images[mip as usize];
            cmd.pipeline_barrier(
                PipelineStages::FRAGMENT_SHADER,
                PipelineStages::TRANSFER,
                &[Barrier::image_to_transfer_dst(image)],
            );
            cmd.copy_buffer_to_image(
                staging,
                image,
                ImageLayout::TransferDst,
                &[BufferImageCopy {
                    buffer_offset: (offset * 4) as u64,
                    image_offset: [0, 0],
                    image_extent: [n, n],
                }],
            );
            cmd.pipeline_barrier(
                PipelineStages::TRANSFER,
                PipelineStages::FRAGMENT_SHADER,
                &[Barrier::image_to_shader_read(image)],
            );

            self.mip_dirty[mip as usize] = false;
            uploaded += 1;
        }

        self.dirty = false;
        log::debug!("VT page table: uploaded {} mip levels", uploaded);
        Ok(uploaded)
    }

    /// Release GPU resources
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        for &image in &self.images {
            device.destroy_image(image);
        }
        self.images.clear();
        for &buffer in self.staging.iter() {
            device.destroy_buffer(buffer);
        }
        device.destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{CommandList, HeadlessDevice};

    fn small_config() -> VirtualTextureConfig {
        VirtualTextureConfig {
            virtual_size_pixels: 1024,
            tile_size_pixels: 128,
            cache_size_pixels: 512,
            border_pixels: 4,
            max_mip_levels: 4,
        }
    }

    fn texel(device: &HeadlessDevice, image: ImageHandle, n: u32, x: u32, y: u32) -> u32 {
        let data = device.image_data(image).unwrap();
        let i = ((y * n + x) * 4) as usize;
        u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]])
    }

    #[test]
    fn test_layout_and_offsets() {
        let mut device = HeadlessDevice::new();
        let table = VirtualTexturePageTable::new(&mut device, small_config(), 2).unwrap();

        // 8x8 + 4x4 + 2x2 + 1x1
        assert_eq!(table.total_entries(), 85);
        assert_eq!(table.mip_offset(0), Some(0));
        assert_eq!(table.mip_offset(1), Some(64));
        assert_eq!(table.mip_offset(2), Some(80));
        assert_eq!(table.mip_offset(3), Some(84));
        assert_eq!(table.entry_index(TileId::new(2, 3, 1)), Some(64 + 3 * 4 + 2));
        assert_eq!(table.images().len(), 4);
        for &image in table.images() {
            assert_eq!(device.image_layout(image).unwrap(), ImageLayout::ShaderReadOnly);
        }
        assert!(!table.is_dirty());
    }

    #[test]
    fn test_set_and_clear_entry() {
        let mut device = HeadlessDevice::new();
        let mut table = VirtualTexturePageTable::new(&mut device, small_config(), 2).unwrap();

        let id = TileId::new(2, 3, 1);
        table.set_entry(id, 5, 7);
        assert_eq!(
            table.entry(id),
            PageTableEntry {
                cache_x: 5,
                cache_y: 7,
                valid: true
            }
        );
        assert!(table.is_dirty());
        assert!(table.is_mip_dirty(1));
        assert!(!table.is_mip_dirty(0));

        table.clear_entry(id);
        assert_eq!(table.entry(id), PageTableEntry::default());
    }

    #[test]
    fn test_out_of_range_ignored() {
        let mut device = HeadlessDevice::new();
        let mut table = VirtualTexturePageTable::new(&mut device, small_config(), 2).unwrap();

        table.set_entry(TileId::new(4, 0, 1), 1, 1);
        table.set_entry(TileId::new(0, 0, 4), 1, 1);
        assert!(!table.is_dirty());
        assert_eq!(table.entry(TileId::new(4, 0, 1)), PageTableEntry::default());
    }

    #[test]
    fn test_clean_upload_is_noop() {
        let mut device = HeadlessDevice::new();
        let mut table = VirtualTexturePageTable::new(&mut device, small_config(), 2).unwrap();

        let mut cmd = CommandList::new();
        assert_eq!(table.record_upload(&mut device, &mut cmd, 0).unwrap(), 0);
        assert!(cmd.is_empty());
        assert!(device.mapped(table.staging_buffer(0)).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_upload_dirty_mips_only() {
        let mut device = HeadlessDevice::new();
        let mut table = VirtualTexturePageTable::new(&mut device, small_config(), 2).unwrap();

        table.set_entry(TileId::new(1, 2, 0), 3, 1);
        table.set_entry(TileId::new(1, 1, 2), 2, 2);

        let mut cmd = CommandList::new();
        assert_eq!(table.record_upload(&mut device, &mut cmd, 1).unwrap(), 2);
        // barrier + copy + barrier per mip
        assert_eq!(cmd.len(), 6);
        assert!(!table.is_dirty());
        assert!(!table.is_mip_dirty(0));

        device.submit(&cmd).unwrap();
        let mip0 = table.image(0).unwrap();
        let mip2 = table.image(2).unwrap();
        assert_eq!(texel(&device, mip0, 8, 1, 2), 0x0100_0103);
        assert_eq!(texel(&device, mip0, 8, 0, 0), 0);
        assert_eq!(texel(&device, mip2, 2, 1, 1), 0x0100_0202);

        // Both mips packed at their own offsets in the same staging buffer
        let staging = device.mapped(table.staging_buffer(1)).unwrap();
        let at = |i: usize| u32::from_le_bytes([staging[i * 4], staging[i * 4 + 1], staging[i * 4 + 2], staging[i * 4 + 3]]);
        assert_eq!(at(2 * 8 + 1), 0x0100_0103);
        assert_eq!(at(80 + 2 + 1), 0x0100_0202);

        let mut again = CommandList::new();
        assert_eq!(table.record_upload(&mut device, &mut again, 0).unwrap(), 0);
        assert!(again.is_empty());
    }

    #[test]
    fn test_cleared_entry_uploads_invalid() {
        let mut device = HeadlessDevice::new();
        let mut table = VirtualTexturePageTable::new(&mut device, small_config(), 1).unwrap();
        let id = TileId::new(0, 0, 3);

        table.set_entry(id, 1, 1);
        let mut cmd = CommandList::new();
        table.record_upload(&mut device, &mut cmd, 0).unwrap();
        device.submit(&cmd).unwrap();
        assert_eq!(texel(&device, table.image(3).unwrap(), 1, 0, 0), 0x0100_0101);

        table.clear_entry(id);
        let mut cmd = CommandList::new();
        table.record_upload(&mut device, &mut cmd, 0).unwrap();
        device.submit(&cmd).unwrap();
        assert_eq!(texel(&device, table.image(3).unwrap(), 1, 0, 0), 0);
    }
}
