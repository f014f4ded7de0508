// One entry of the queue's slot table and the shared buffer object it binds.

use crate::Core::alloc::BufferAllocator;
use crate::Core::fence::Fence;
use crate::Core::handle::BufferHandle;
use crate::Queue::Structs::Buffer_Structs::{
    ExtraData, HdrMetaData, PresentTimestamp, Rect, RequestConfig, ScalingMode,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle of a slot.
///
/// `Free -> Requested -> Dirty -> Acquired -> Free`. `Attached` is a
/// producer-held slot that entered through `attach_buffer` rather than a
/// request; it flushes and cancels like `Requested`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Requested,
    Dirty,
    Acquired,
    Attached,
}

impl SlotState {
    /// Held by the producer between request/attach and flush/cancel.
    pub fn is_producer_held(self) -> bool {
        matches!(self, SlotState::Requested | SlotState::Attached)
    }

    /// Owned by either endpoint rather than resting in a queue list.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            SlotState::Requested | SlotState::Attached | SlotState::Acquired
        )
    }
}

/// A graphics buffer: the native descriptor plus per-buffer metadata.
///
/// Shared between the queue and both endpoints as `Arc<SurfaceBuffer>`;
/// identity is pointer identity. The descriptor is immutable and its
/// descriptors close when the last reference drops.
pub struct SurfaceBuffer {
    pub(crate) seq: u32,
    pub(crate) handle: BufferHandle,
    pub(crate) config: RequestConfig,
    pub(crate) metadata: Mutex<BTreeMap<u32, Vec<u8>>>,
    pub(crate) extra: Mutex<ExtraData>,
    pub(crate) allocator: Option<Arc<dyn BufferAllocator>>,
}

/// Queue-side bookkeeping for one buffer.
pub struct Slot {
    pub buffer: Arc<SurfaceBuffer>,
    pub state: SlotState,
    /// Destroy instead of returning to the free list on the next transition to `Free`.
    pub is_deleting: bool,
    pub config: RequestConfig,
    /// Producer's "done writing" fence, handed to the consumer on acquire.
    pub acquire_fence: Fence,
    /// Consumer's "done reading" fences, merged until the producer takes them.
    pub release_fence: Fence,
    pub damages: Vec<Rect>,
    pub timestamp: i64,
    pub desired_present_timestamp: i64,
    pub is_auto_timestamp: bool,
    pub ui_timestamp: u64,
    pub present_timestamp: Option<PresentTimestamp>,
    pub scaling_mode: ScalingMode,
    pub hdr_metadata: Vec<HdrMetaData>,
    pub hdr_metadata_set: Option<(u32, Vec<u8>)>,
    pub is_preallocated: bool,
    /// The producer already holds this descriptor, so requests may omit it.
    pub transferred: bool,
}
