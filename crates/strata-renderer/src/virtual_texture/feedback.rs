//! GPU Feedback Readback
//!
//! Fragment shaders append the packed id of every tile they needed but found
//! invalid in the page table to a storage buffer, indexed through an atomic
//! counter. At the end of the frame both buffers are copied into host-visible
//! readback buffers; the CPU reads them once that frame's fence has been waited.

use ahash::AHashSet;
use strata_core::{FrameCompletion, FrameSlots};

use super::TileId;
use crate::gpu::{
    AccessFlags, Barrier, BufferCopy, BufferDesc, BufferHandle, CommandRecorder, GpuDevice,
    PipelineStages,
};
use crate::{RendererError, RendererResult};

/// Default capacity of each feedback buffer in tile ids
pub const DEFAULT_MAX_ENTRIES: u32 = 4096;

const COUNTER_BYTES: u64 = 4;

#[derive(Debug, Clone, Copy)]
struct FeedbackBuffers {
    storage: BufferHandle,
    counter: BufferHandle,
    readback: BufferHandle,
    counter_readback: BufferHandle,
}

/// Per-frame tile request buffers and the last readback result
pub struct VirtualTextureFeedback {
    frames: FrameSlots<FeedbackBuffers>,
    max_entries: u32,
    requested: Vec<TileId>,
}

impl VirtualTextureFeedback {
    /// Create storage, counter and readback buffers for each frame in flight
    pub fn new(
        device: &mut dyn GpuDevice,
        max_entries: u32,
        frames_in_flight: u32,
    ) -> RendererResult<Self> {
        if max_entries == 0 {
            return Err(RendererError::InvalidConfig(
                "feedback buffer needs at least one entry".into(),
            ));
        }

        let storage_bytes = u64::from(max_entries) * 4;
        let frames = FrameSlots::try_new(frames_in_flight, |i| -> RendererResult<_> {
            Ok(FeedbackBuffers {
                storage: device
                    .create_buffer(&BufferDesc::storage(storage_bytes), &format!("vt_feedback{}", i))?,
                counter: device.create_buffer(
                    &BufferDesc::storage(COUNTER_BYTES),
                    &format!("vt_feedback_counter{}", i),
                )?,
                readback: device.create_buffer(
                    &BufferDesc::readback(storage_bytes),
                    &format!("vt_feedback_readback{}", i),
                )?,
                counter_readback: device.create_buffer(
                    &BufferDesc::readback(COUNTER_BYTES),
                    &format!("vt_feedback_counter_readback{}", i),
                )?,
            })
        })?;

        log::info!(
            "VirtualTextureFeedback initialized: {} entries x {} frames",
            max_entries,
            frames.len()
        );

        Ok(Self {
            frames,
            max_entries,
            requested: Vec::new(),
        })
    }

    /// Reset this frame's counter before rendering
    pub fn clear(&self, cmd: &mut dyn CommandRecorder, frame_index: u32) {
        let buffers = self.frames.get(frame_index);
        cmd.fill_buffer(buffers.counter, 0, COUNTER_BYTES, 0);
        cmd.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::FRAGMENT_SHADER,
            &[Barrier::Memory {
                src_access: AccessFlags::TRANSFER_WRITE,
                dst_access: AccessFlags::SHADER_READ | AccessFlags::SHADER_WRITE,
            }],
        );
    }

    /// Copy this frame's requests into its readback buffers after rendering
    pub fn record_copy_to_readback(&self, cmd: &mut dyn CommandRecorder, frame_index: u32) {
        let buffers = self.frames.get(frame_index);

        cmd.pipeline_barrier(
            PipelineStages::FRAGMENT_SHADER,
            PipelineStages::TRANSFER,
            &[Barrier::Memory {
                src_access: AccessFlags::SHADER_WRITE,
                dst_access: AccessFlags::TRANSFER_READ,
            }],
        );
        cmd.copy_buffer(
            buffers.storage,
            buffers.readback,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: u64::from(self.max_entries) * 4,
            }],
        );
        cmd.copy_buffer(
            buffers.counter,
            buffers.counter_readback,
            &[BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: COUNTER_BYTES,
            }],
        );
        cmd.pipeline_barrier(
            PipelineStages::TRANSFER,
            PipelineStages::HOST,
            &[
                Barrier::Buffer {
                    buffer: buffers.readback,
                    src_access: AccessFlags::TRANSFER_WRITE,
                    dst_access: AccessFlags::HOST_READ,
                },
                Barrier::Buffer {
                    buffer: buffers.counter_readback,
                    src_access: AccessFlags::TRANSFER_WRITE,
                    dst_access: AccessFlags::HOST_READ,
                },
            ],
        );
    }

    /// Read the requests of the frame `completion` was waited for.
    ///
    /// Ids are deduplicated, the zero id is treated as empty, and the result is
    /// stably sorted finest mip first.
    pub fn readback(
        &mut self,
        device: &dyn GpuDevice,
        completion: &FrameCompletion,
    ) -> RendererResult<&[TileId]> {
        let buffers = *self.frames.get(completion.frame_index());

        let counter = device.mapped(buffers.counter_readback)?;
        let raw_count = u32::from_le_bytes([counter[0], counter[1], counter[2], counter[3]]);
        let count = raw_count.min(self.max_entries) as usize;
        if raw_count > self.max_entries {
            log::debug!(
                "VT feedback: {} requests overflowed the {} entry buffer",
                raw_count,
                self.max_entries
            );
        }

        let data = device.mapped(buffers.readback)?;
        let mut seen = AHashSet::with_capacity(count);
        self.requested.clear();
        for word in data[..count * 4].chunks_exact(4) {
            let packed = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            if packed != 0 && seen.insert(packed) {
                self.requested.push(TileId::unpack(packed));
            }
        }
        self.requested.sort_by_key(|id| id.mip_level);

        Ok(&self.requested)
    }

    /// Result of the last [`readback`](Self::readback)
    pub fn requested_tiles(&self) -> &[TileId] {
        &self.requested
    }

    /// Capacity of each storage buffer in tile ids
    pub fn max_entries(&self) -> u32 {
        self.max_entries
    }

    /// Storage buffer shaders append to for `frame_index`
    pub fn storage_buffer(&self, frame_index: u32) -> BufferHandle {
        self.frames.get(frame_index).storage
    }

    /// Atomic counter buffer for `frame_index`
    pub fn counter_buffer(&self, frame_index: u32) -> BufferHandle {
        self.frames.get(frame_index).counter
    }

    /// Host-visible copy of `frame_index`'s storage buffer
    pub fn readback_buffer(&self, frame_index: u32) -> BufferHandle {
        self.frames.get(frame_index).readback
    }

    /// Host-visible copy of `frame_index`'s counter
    pub fn counter_readback_buffer(&self, frame_index: u32) -> BufferHandle {
        self.frames.get(frame_index).counter_readback
    }

    /// Release GPU resources
    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        for buffers in self.frames.iter() {
            device.destroy_buffer(buffers.storage);
            device.destroy_buffer(buffers.counter);
            device.destroy_buffer(buffers.readback);
            device.destroy_buffer(buffers.counter_readback);
        }
    }
}
