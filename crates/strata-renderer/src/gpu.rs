//! GPU Backend Boundary
//!
//! The streaming systems never talk to a graphics API directly. They create
//! resources through [`GpuDevice`] and record transfer work through
//! [`CommandRecorder`]. A native backend implements both traits out of tree;
//! [`HeadlessDevice`] implements them on CPU memory so the whole pipeline can
//! run without a GPU (tests, benchmarks, the `simulate` command).

use ahash::AHashMap;
use bitflags::bitflags;
use smallvec::SmallVec;
use strata_core::{CoreResult, FrameFence};

use crate::{RendererError, RendererResult};

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(u32);

/// Handle to a GPU image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(u32);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(u32);

bitflags! {
    /// Buffer usage
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const STORAGE = 1 << 2;
        const UNIFORM = 1 << 3;
    }
}

bitflags! {
    /// Image usage
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsage: u32 {
        const TRANSFER_DST = 1 << 0;
        const SAMPLED = 1 << 1;
    }
}

bitflags! {
    /// Memory access types for barriers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        const TRANSFER_READ = 1 << 0;
        const TRANSFER_WRITE = 1 << 1;
        const SHADER_READ = 1 << 2;
        const SHADER_WRITE = 1 << 3;
        const HOST_READ = 1 << 4;
        const HOST_WRITE = 1 << 5;
    }
}

bitflags! {
    /// Pipeline stages for barriers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const TRANSFER = 1 << 1;
        const FRAGMENT_SHADER = 1 << 2;
        const COMPUTE_SHADER = 1 << 3;
        const HOST = 1 << 4;
    }
}

/// Where a buffer's memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// GPU-only memory
    DeviceLocal,
    /// CPU-mapped memory (staging and readback)
    HostVisible,
}

/// Image formats used by the streaming systems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    /// 8-bit RGBA, sRGB encoded
    Rgba8Srgb,
    /// 8-bit RGBA, unsigned integer (page tables)
    Rgba8Uint,
    /// BC1 RGB, sRGB encoded
    Bc1RgbSrgb,
    /// 32-bit float single channel (heightmaps)
    R32Float,
}

impl ImageFormat {
    /// Width and height of one compression block in texels
    pub fn block_dim(&self) -> u32 {
        match self {
            ImageFormat::Bc1RgbSrgb => 4,
            _ => 1,
        }
    }

    /// Bytes per block (per texel for uncompressed formats)
    pub fn block_bytes(&self) -> usize {
        match self {
            ImageFormat::Rgba8Srgb | ImageFormat::Rgba8Uint | ImageFormat::R32Float => 4,
            ImageFormat::Bc1RgbSrgb => 8,
        }
    }

    /// Whether this is a block-compressed format
    pub fn is_compressed(&self) -> bool {
        self.block_dim() > 1
    }

    /// Bytes needed for a `width` x `height` region
    pub fn data_size(&self, width: u32, height: u32) -> usize {
        let dim = self.block_dim();
        let blocks_x = width.div_ceil(dim) as usize;
        let blocks_y = height.div_ceil(dim) as usize;
        blocks_x * blocks_y * self.block_bytes()
    }
}

/// Image layouts tracked across barriers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    /// Contents undefined; valid as a source layout only
    Undefined,
    /// Destination of transfer writes
    TransferDst,
    /// Sampled by shaders
    ShaderReadOnly,
}

/// Sampler filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerFilter {
    /// Point sampling (page tables)
    Nearest,
    /// Bilinear sampling (cache atlas, heightmaps)
    Linear,
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub size: u64,
    pub usage: BufferUsage,
    pub memory: MemoryLocation,
}

impl BufferDesc {
    /// Host-visible transfer source
    pub fn staging(size: u64) -> Self {
        Self {
            size,
            usage: BufferUsage::TRANSFER_SRC,
            memory: MemoryLocation::HostVisible,
        }
    }

    /// Device-local storage buffer that can be filled and copied from
    pub fn storage(size: u64) -> Self {
        Self {
            size,
            usage: BufferUsage::STORAGE | BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            memory: MemoryLocation::DeviceLocal,
        }
    }

    /// Host-visible transfer destination
    pub fn readback(size: u64) -> Self {
        Self {
            size,
            usage: BufferUsage::TRANSFER_DST,
            memory: MemoryLocation::HostVisible,
        }
    }
}

/// Image creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub usage: ImageUsage,
}

impl ImageDesc {
    /// Sampled image written by transfers
    pub fn sampled(width: u32, height: u32, format: ImageFormat) -> Self {
        Self {
            width,
            height,
            format,
            usage: ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED,
        }
    }
}

/// Sampler creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    pub filter: SamplerFilter,
}

/// Buffer-to-buffer copy region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}

/// Buffer-to-image copy region; buffer data is tightly packed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub image_offset: [u32; 2],
    pub image_extent: [u32; 2],
}

/// Memory dependency recorded by [`CommandRecorder::pipeline_barrier`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Global memory barrier
    Memory {
        src_access: AccessFlags,
        dst_access: AccessFlags,
    },
    /// Whole-buffer barrier
    Buffer {
        buffer: BufferHandle,
        src_access: AccessFlags,
        dst_access: AccessFlags,
    },
    /// Image barrier with layout transition
    Image {
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
        src_access: AccessFlags,
        dst_access: AccessFlags,
    },
}

impl Barrier {
    /// Transition `image` from shader-read to transfer-dst ahead of a copy
    pub fn image_to_transfer_dst(image: ImageHandle) -> Self {
        Barrier::Image {
            image,
            old_layout: ImageLayout::ShaderReadOnly,
            new_layout: ImageLayout::TransferDst,
            src_access: AccessFlags::SHADER_READ,
            dst_access: AccessFlags::TRANSFER_WRITE,
        }
    }

    /// Transition `image` from transfer-dst back to shader-read after a copy
    pub fn image_to_shader_read(image: ImageHandle) -> Self {
        Barrier::Image {
            image,
            old_layout: ImageLayout::TransferDst,
            new_layout: ImageLayout::ShaderReadOnly,
            src_access: AccessFlags::TRANSFER_WRITE,
            dst_access: AccessFlags::SHADER_READ,
        }
    }

    /// Initial transition of a freshly created image to shader-read
    pub fn image_init_shader_read(image: ImageHandle) -> Self {
        Barrier::Image {
            image,
            old_layout: ImageLayout::Undefined,
            new_layout: ImageLayout::ShaderReadOnly,
            src_access: AccessFlags::empty(),
            dst_access: AccessFlags::SHADER_READ,
        }
    }
}

/// Records transfer and synchronization commands into a command buffer
pub trait CommandRecorder {
    /// Fill `size` bytes at `offset` with the repeated 32-bit `value`
    fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32);

    /// Copy regions between buffers
    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopy]);

    /// Copy regions from a buffer into an image in `layout`
    fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        dst: ImageHandle,
        layout: ImageLayout,
        regions: &[BufferImageCopy],
    );

    /// Record a pipeline barrier
    fn pipeline_barrier(
        &mut self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        barriers: &[Barrier],
    );
}

/// Resource creation and host memory access
pub trait GpuDevice {
    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDesc, label: &str) -> RendererResult<BufferHandle>;

    /// Create a 2D image with one mip level
    fn create_image(&mut self, desc: &ImageDesc, label: &str) -> RendererResult<ImageHandle>;

    /// Create a clamp-to-edge sampler
    fn create_sampler(&mut self, desc: &SamplerDesc, label: &str) -> RendererResult<SamplerHandle>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Destroy an image
    fn destroy_image(&mut self, image: ImageHandle);

    /// Destroy a sampler
    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    /// Read access to a host-visible buffer
    fn mapped(&self, buffer: BufferHandle) -> RendererResult<&[u8]>;

    /// Write access to a host-visible buffer
    fn mapped_mut(&mut self, buffer: BufferHandle) -> RendererResult<&mut [u8]>;

    /// Record commands into a one-time command buffer, submit it and wait for completion
    fn one_shot(
        &mut self,
        record: &mut dyn FnMut(&mut dyn CommandRecorder) -> RendererResult<()>,
    ) -> RendererResult<()>;

    /// Copy `data` into a host-visible buffer at `offset`
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RendererResult<()> {
        let mapped = self.mapped_mut(buffer)?;
        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(RendererError::OutOfBounds(format!(
                "write of {} bytes at offset {} exceeds buffer of {} bytes",
                data.len(),
                offset,
                mapped.len()
            )));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }
}

/// One recorded command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    FillBuffer {
        buffer: BufferHandle,
        offset: u64,
        size: u64,
        value: u32,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        regions: SmallVec<[BufferCopy; 2]>,
    },
    CopyBufferToImage {
        src: BufferHandle,
        dst: ImageHandle,
        layout: ImageLayout,
        regions: SmallVec<[BufferImageCopy; 1]>,
    },
    PipelineBarrier {
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        barriers: SmallVec<[Barrier; 2]>,
    },
}

/// CPU-side command buffer
#[derive(Debug, Default, Clone)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    /// Create an empty command list
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded commands in order
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Number of recorded commands
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Whether nothing has been recorded
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Reset for reuse
    pub fn clear(&mut self) {
        self.commands.clear();
    }
}

impl CommandRecorder for CommandList {
    fn fill_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64, value: u32) {
        self.commands.push(Command::FillBuffer {
            buffer,
            offset,
            size,
            value,
        });
    }

    fn copy_buffer(&mut self, src: BufferHandle, dst: BufferHandle, regions: &[BufferCopy]) {
        self.commands.push(Command::CopyBuffer {
            src,
            dst,
            regions: SmallVec::from_slice(regions),
        });
    }

    fn copy_buffer_to_image(
        &mut self,
        src: BufferHandle,
        dst: ImageHandle,
        layout: ImageLayout,
        regions: &[BufferImageCopy],
    ) {
        self.commands.push(Command::CopyBufferToImage {
            src,
            dst,
            layout,
            regions: SmallVec::from_slice(regions),
        });
    }

    fn pipeline_barrier(
        &mut self,
        src_stages: PipelineStages,
        dst_stages: PipelineStages,
        barriers: &[Barrier],
    ) {
        self.commands.push(Command::PipelineBarrier {
            src_stages,
            dst_stages,
            barriers: SmallVec::from_slice(barriers),
        });
    }
}

#[derive(Debug)]
struct HeadlessBuffer {
    desc: BufferDesc,
    label: String,
    data: Vec<u8>,
}

#[derive(Debug)]
struct HeadlessImage {
    desc: ImageDesc,
    label: String,
    layout: ImageLayout,
    data: Vec<u8>,
}

/// CPU-memory implementation of [`GpuDevice`]
///
/// Submission executes recorded commands immediately, validating bounds and
/// image layouts the way a validation layer would, so every frame's fence is
/// already signalled by the time `submit` returns.
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    buffers: AHashMap<u32, HeadlessBuffer>,
    images: AHashMap<u32, HeadlessImage>,
    samplers: AHashMap<u32, SamplerDesc>,
    next_handle: u32,
    submissions: u64,
}

impl HeadlessDevice {
    /// Create an empty device
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_handle(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }

    /// Number of command lists executed so far
    pub fn submission_count(&self) -> u64 {
        self.submissions
    }

    /// Number of live buffers
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Total bytes held by live buffers and images
    pub fn allocated_bytes(&self) -> usize {
        self.buffers.values().map(|b| b.data.len()).sum::<usize>()
            + self.images.values().map(|i| i.data.len()).sum::<usize>()
    }

    /// Contents of any buffer, regardless of memory location
    pub fn buffer_data(&self, buffer: BufferHandle) -> RendererResult<&[u8]> {
        Ok(&self.buffer(buffer)?.data)
    }

    /// Mutable contents of any buffer; stands in for shader writes
    pub fn buffer_data_mut(&mut self, buffer: BufferHandle) -> RendererResult<&mut [u8]> {
        Ok(&mut self.buffer_mut(buffer)?.data)
    }

    /// Contents of an image, rows of blocks packed top to bottom
    pub fn image_data(&self, image: ImageHandle) -> RendererResult<&[u8]> {
        Ok(&self.image(image)?.data)
    }

    /// Current layout of an image
    pub fn image_layout(&self, image: ImageHandle) -> RendererResult<ImageLayout> {
        Ok(self.image(image)?.layout)
    }

    /// Creation parameters of an image
    pub fn image_desc(&self, image: ImageHandle) -> RendererResult<ImageDesc> {
        Ok(self.image(image)?.desc)
    }

    /// Label given to a buffer at creation
    pub fn buffer_label(&self, buffer: BufferHandle) -> RendererResult<&str> {
        Ok(&self.buffer(buffer)?.label)
    }

    fn buffer(&self, handle: BufferHandle) -> RendererResult<&HeadlessBuffer> {
        self.buffers
            .get(&handle.0)
            .ok_or_else(|| RendererError::InvalidHandle(format!("{:?}", handle)))
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> RendererResult<&mut HeadlessBuffer> {
        self.buffers
            .get_mut(&handle.0)
            .ok_or_else(|| RendererError::InvalidHandle(format!("{:?}", handle)))
    }

    fn image(&self, handle: ImageHandle) -> RendererResult<&HeadlessImage> {
        self.images
            .get(&handle.0)
            .ok_or_else(|| RendererError::InvalidHandle(format!("{:?}", handle)))
    }

    fn image_mut(&mut self, handle: ImageHandle) -> RendererResult<&mut HeadlessImage> {
        self.images
            .get_mut(&handle.0)
            .ok_or_else(|| RendererError::InvalidHandle(format!("{:?}", handle)))
    }

    /// Execute a recorded command list
    pub fn submit(&mut self, list: &CommandList) -> RendererResult<()> {
        for command in list.commands() {
            self.execute(command)?;
        }
        self.submissions += 1;
        Ok(())
    }

    fn execute(&mut self, command: &Command) -> RendererResult<()> {
        match command {
            Command::FillBuffer {
                buffer,
                offset,
                size,
                value,
            } => {
                let data = &mut self.buffer_mut(*buffer)?.data;
                let range = checked_range(*offset, *size, data.len())?;
                if offset % 4 != 0 || size % 4 != 0 {
                    return Err(RendererError::OutOfBounds(
                        "fill offset and size must be multiples of 4".into(),
                    ));
                }
                for word in data[range].chunks_exact_mut(4) {
                    word.copy_from_slice(&value.to_le_bytes());
                }
            }
            Command::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let src_data = &self.buffer(*src)?.data;
                    let src_range = checked_range(region.src_offset, region.size, src_data.len())?;
                    let bytes = src_data[src_range].to_vec();
                    let dst_data = &mut self.buffer_mut(*dst)?.data;
                    let dst_range = checked_range(region.dst_offset, region.size, dst_data.len())?;
                    dst_data[dst_range].copy_from_slice(&bytes);
                }
            }
            Command::CopyBufferToImage {
                src,
                dst,
                layout,
                regions,
            } => {
                if *layout != ImageLayout::TransferDst {
                    return Err(RendererError::InvalidLayout(format!(
                        "copy destination must be TransferDst, got {:?}",
                        layout
                    )));
                }
                for region in regions {
                    let src_data = self.buffer(*src)?.data.clone();
                    let image = self.image_mut(*dst)?;
                    copy_region_to_image(&src_data, image, region)?;
                }
            }
            Command::PipelineBarrier { barriers, .. } => {
                for barrier in barriers {
                    match barrier {
                        Barrier::Memory { .. } => {}
                        Barrier::Buffer { buffer, .. } => {
                            self.buffer(*buffer)?;
                        }
                        Barrier::Image {
                            image,
                            old_layout,
                            new_layout,
                            ..
                        } => {
                            let image = self.image_mut(*image)?;
                            if *old_layout != ImageLayout::Undefined && *old_layout != image.layout {
                                return Err(RendererError::InvalidLayout(format!(
                                    "image '{}' is in {:?}, barrier expects {:?}",
                                    image.label, image.layout, old_layout
                                )));
                            }
                            image.layout = *new_layout;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn checked_range(offset: u64, size: u64, len: usize) -> RendererResult<std::ops::Range<usize>> {
    let start = offset as usize;
    let end = start
        .checked_add(size as usize)
        .ok_or_else(|| RendererError::OutOfBounds("range overflow".into()))?;
    if end > len {
        return Err(RendererError::OutOfBounds(format!(
            "range {}..{} exceeds {} bytes",
            start, end, len
        )));
    }
    Ok(start..end)
}

fn copy_region_to_image(
    src: &[u8],
    image: &mut HeadlessImage,
    region: &BufferImageCopy,
) -> RendererResult<()> {
    let format = image.desc.format;
    let dim = format.block_dim();
    let [x, y] = region.image_offset;
    let [w, h] = region.image_extent;

    if x + w > image.desc.width || y + h > image.desc.height {
        return Err(RendererError::OutOfBounds(format!(
            "region {}x{} at ({}, {}) exceeds image '{}' of {}x{}",
            w, h, x, y, image.label, image.desc.width, image.desc.height
        )));
    }
    if x % dim != 0 || y % dim != 0 {
        return Err(RendererError::OutOfBounds(format!(
            "region offset ({}, {}) is not block aligned",
            x, y
        )));
    }

    let block_bytes = format.block_bytes();
    let src_row_bytes = w.div_ceil(dim) as usize * block_bytes;
    let src_rows = h.div_ceil(dim) as usize;
    let dst_pitch = image.desc.width.div_ceil(dim) as usize * block_bytes;
    let src_start = region.buffer_offset as usize;

    checked_range(region.buffer_offset, (src_row_bytes * src_rows) as u64, src.len())?;

    for row in 0..src_rows {
        let s = src_start + row * src_row_bytes;
        let d = ((y / dim) as usize + row) * dst_pitch + (x / dim) as usize * block_bytes;
        image.data[d..d + src_row_bytes].copy_from_slice(&src[s..s + src_row_bytes]);
    }
    Ok(())
}

impl GpuDevice for HeadlessDevice {
    fn create_buffer(&mut self, desc: &BufferDesc, label: &str) -> RendererResult<BufferHandle> {
        if desc.size == 0 {
            return Err(RendererError::ResourceCreation(format!(
                "buffer '{}' has zero size",
                label
            )));
        }
        let id = self.allocate_handle();
        self.buffers.insert(
            id,
            HeadlessBuffer {
                desc: *desc,
                label: label.to_string(),
                data: vec![0; desc.size as usize],
            },
        );
        Ok(BufferHandle(id))
    }

    fn create_image(&mut self, desc: &ImageDesc, label: &str) -> RendererResult<ImageHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(RendererError::ResourceCreation(format!(
                "image '{}' has zero extent",
                label
            )));
        }
        let id = self.allocate_handle();
        self.images.insert(
            id,
            HeadlessImage {
                desc: *desc,
                label: label.to_string(),
                layout: ImageLayout::Undefined,
                data: vec![0; desc.format.data_size(desc.width, desc.height)],
            },
        );
        Ok(ImageHandle(id))
    }

    fn create_sampler(&mut self, desc: &SamplerDesc, _label: &str) -> RendererResult<SamplerHandle> {
        let id = self.allocate_handle();
        self.samplers.insert(id, *desc);
        Ok(SamplerHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.images.remove(&image.0);
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(&sampler.0);
    }

    fn mapped(&self, buffer: BufferHandle) -> RendererResult<&[u8]> {
        let buffer_ref = self.buffer(buffer)?;
        if buffer_ref.desc.memory != MemoryLocation::HostVisible {
            return Err(RendererError::NotHostVisible(buffer_ref.label.clone()));
        }
        Ok(&buffer_ref.data)
    }

    fn mapped_mut(&mut self, buffer: BufferHandle) -> RendererResult<&mut [u8]> {
        let buffer_ref = self.buffer_mut(buffer)?;
        if buffer_ref.desc.memory != MemoryLocation::HostVisible {
            return Err(RendererError::NotHostVisible(buffer_ref.label.clone()));
        }
        Ok(&mut buffer_ref.data)
    }

    fn one_shot(
        &mut self,
        record: &mut dyn FnMut(&mut dyn CommandRecorder) -> RendererResult<()>,
    ) -> RendererResult<()> {
        let mut list = CommandList::new();
        record(&mut list)?;
        self.submit(&list)
    }
}

impl FrameFence for HeadlessDevice {
    fn wait_complete(&self, _frame_index: u32) -> CoreResult<()> {
        // Submission is synchronous.
        Ok(())
    }
}
