use super::Buffer::{Slot, SlotState, SurfaceBuffer};
use crate::Core::alloc::BufferAllocator;
use crate::Core::fence::Fence;
use crate::Core::handle::BufferHandle;
use crate::error::{GSError, GSResult};
use crate::Queue::Structs::Buffer_Structs::{
    ExtraData, HdrMetadataType, RequestConfig, ScalingMode,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

impl SurfaceBuffer {
    /// Wrap a descriptor produced by `allocator` (or by an external party when
    /// `allocator` is `None`).
    pub fn new(
        seq: u32,
        handle: BufferHandle,
        config: RequestConfig,
        allocator: Option<Arc<dyn BufferAllocator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            seq,
            handle,
            config,
            metadata: Mutex::new(BTreeMap::new()),
            extra: Mutex::new(ExtraData::new()),
            allocator,
        })
    }

    pub fn seq_num(&self) -> u32 {
        self.seq
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub fn request_config(&self) -> &RequestConfig {
        &self.config
    }

    pub fn width(&self) -> i32 {
        self.handle.width
    }

    pub fn height(&self) -> i32 {
        self.handle.height
    }

    pub fn stride(&self) -> i32 {
        self.handle.stride
    }

    pub fn size(&self) -> i32 {
        self.handle.size
    }

    pub fn set_metadata(&self, key: u32, value: Vec<u8>) {
        self.metadata.lock().insert(key, value);
    }

    pub fn get_metadata(&self, key: u32) -> GSResult<Vec<u8>> {
        self.metadata
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| GSError::NoEntry(format!("metadata key {key}")))
    }

    pub fn erase_metadata(&self, key: u32) {
        self.metadata.lock().remove(&key);
    }

    pub fn set_extra_data(&self, extra: ExtraData) {
        *self.extra.lock() = extra;
    }

    pub fn extra_data(&self) -> ExtraData {
        self.extra.lock().clone()
    }
}

impl Drop for SurfaceBuffer {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            allocator.free(&self.handle);
        }
        // descriptors close with `handle`
    }
}

impl Slot {
    pub fn new(buffer: Arc<SurfaceBuffer>, config: RequestConfig, state: SlotState) -> Self {
        Self {
            buffer,
            state,
            is_deleting: false,
            config,
            acquire_fence: Fence::invalid(),
            release_fence: Fence::invalid(),
            damages: Vec::new(),
            timestamp: 0,
            desired_present_timestamp: 0,
            is_auto_timestamp: false,
            ui_timestamp: 0,
            present_timestamp: None,
            scaling_mode: ScalingMode::default(),
            hdr_metadata: Vec::new(),
            hdr_metadata_set: None,
            is_preallocated: false,
            transferred: false,
        }
    }

    pub fn seq(&self) -> u32 {
        self.buffer.seq
    }

    /// Merge a consumer release fence with any not yet handed to the producer.
    pub fn merge_release_fence(&mut self, fence: &Fence) {
        self.release_fence = Fence::merge(&self.release_fence, fence);
    }

    /// Hand the accumulated release fence to the producer.
    pub fn take_release_fence(&mut self) -> Fence {
        std::mem::take(&mut self.release_fence)
    }

    pub fn metadata_type(&self) -> HdrMetadataType {
        if self.hdr_metadata_set.is_some() {
            HdrMetadataType::MetaDataSet
        } else if !self.hdr_metadata.is_empty() {
            HdrMetadataType::MetaData
        } else {
            HdrMetadataType::None
        }
    }

    /// Forget per-frame state when the slot returns to the free list.
    pub(crate) fn reset_frame_state(&mut self) {
        self.damages.clear();
        self.acquire_fence = Fence::invalid();
        self.present_timestamp = None;
    }
}
