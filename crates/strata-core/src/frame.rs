//! Frame Pipelining
//!
//! The CPU records frame `n + 1` while the GPU may still be executing frame `n`.
//! Every resource the GPU writes or reads asynchronously is therefore duplicated
//! once per frame in flight and addressed by `frame_index % frames_in_flight`.
//!
//! Reading GPU-written data back requires a [`FrameCompletion`] token, which can
//! only be produced by waiting on that frame slot's fence.

use crate::{CoreError, CoreResult};

/// One value per frame in flight, addressed by frame index
#[derive(Debug, Clone)]
pub struct FrameSlots<T> {
    slots: Vec<T>,
}

impl<T> FrameSlots<T> {
    /// Build `frames_in_flight` slots with `make(slot)`
    pub fn new(frames_in_flight: u32, make: impl FnMut(usize) -> T) -> Self {
        Self {
            slots: (0..frames_in_flight.max(1) as usize).map(make).collect(),
        }
    }

    /// Build slots with a fallible constructor, stopping at the first error
    pub fn try_new<E>(
        frames_in_flight: u32,
        make: impl FnMut(usize) -> Result<T, E>,
    ) -> Result<Self, E> {
        let slots = (0..frames_in_flight.max(1) as usize)
            .map(make)
            .collect::<Result<Vec<_>, E>>()?;
        Ok(Self { slots })
    }

    /// Number of frames in flight
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; at least one slot exists
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot index used by `frame_index`
    pub fn slot_index(&self, frame_index: u32) -> usize {
        frame_index as usize % self.slots.len()
    }

    /// Slot for `frame_index`
    pub fn get(&self, frame_index: u32) -> &T {
        &self.slots[self.slot_index(frame_index)]
    }

    /// Mutable slot for `frame_index`
    pub fn get_mut(&mut self, frame_index: u32) -> &mut T {
        let index = self.slot_index(frame_index);
        &mut self.slots[index]
    }

    /// Iterate over all slots
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.slots.iter()
    }

    /// Consume into the slot values
    pub fn into_inner(self) -> Vec<T> {
        self.slots
    }
}

/// A per-frame fence the CPU can block on
pub trait FrameFence {
    /// Block until the most recent GPU submission for `frame_index`'s slot has completed
    fn wait_complete(&self, frame_index: u32) -> CoreResult<()>;
}

/// Proof that the GPU has finished the work last submitted for a frame slot
#[derive(Debug)]
pub struct FrameCompletion {
    frame_index: u32,
}

impl FrameCompletion {
    /// Wait on `fence` for `frame_index` and return the completion token
    pub fn wait<F: FrameFence + ?Sized>(fence: &F, frame_index: u32) -> CoreResult<Self> {
        fence.wait_complete(frame_index)?;
        Ok(Self { frame_index })
    }

    /// Frame index the fence was waited for
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Check that this token covers the slot used by `frame_index`
    pub fn covers(&self, frame_index: u32, frames_in_flight: u32) -> bool {
        let n = frames_in_flight.max(1);
        self.frame_index % n == frame_index % n
    }

    /// Fail unless this token covers `frame_index`'s slot
    pub fn ensure_covers(&self, frame_index: u32, frames_in_flight: u32) -> CoreResult<()> {
        if self.covers(frame_index, frames_in_flight) {
            Ok(())
        } else {
            Err(CoreError::FenceWait {
                frame_index,
                reason: format!("completion token is for frame {}", self.frame_index),
            })
        }
    }
}

/// Monotonic frame counter with a wrapping frame-in-flight index
#[derive(Debug, Clone)]
pub struct FrameCounter {
    frames_in_flight: u32,
    frame_index: u32,
    frame_number: u64,
}

impl FrameCounter {
    /// Create a counter for `frames_in_flight` slots
    pub fn new(frames_in_flight: u32) -> Self {
        Self {
            frames_in_flight: frames_in_flight.max(1),
            frame_index: 0,
            frame_number: 0,
        }
    }

    /// Current slot index in `0..frames_in_flight`
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Total frames advanced so far
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    /// Number of frames in flight
    pub fn frames_in_flight(&self) -> u32 {
        self.frames_in_flight
    }

    /// Move to the next frame and return its slot index
    pub fn advance(&mut self) -> u32 {
        self.frame_number += 1;
        self.frame_index = (self.frame_index + 1) % self.frames_in_flight;
        self.frame_index
    }
}
