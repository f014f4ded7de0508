use super::buffer_queue::{BufferQueue, DEFAULT_QUEUE_SIZE, MAX_NAME_LEN, MAX_QUEUE_SIZE};
use super::delegate::{NoopTelemetry, TelemetrySink};
use super::Structs::Buffer_Structs::{BufferUsage, SourceType};
use super::{Consumer, Producer};
use crate::Core::alloc::{BufferAllocator, SequenceGenerator, SharedMemoryAllocator};
use crate::error::{GSError, GSResult};
use std::sync::Arc;

pub struct BufferQueueBuilder {
    pub(crate) name: String,
    pub(crate) queue_size: u32,
    pub(crate) blocking: bool,
    pub(crate) priority_alloc: bool,
    pub(crate) source_type: SourceType,
    pub(crate) default_width: i32,
    pub(crate) default_height: i32,
    pub(crate) default_usage: BufferUsage,
    allocator: Option<Arc<dyn BufferAllocator>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    sequences: Option<Arc<SequenceGenerator>>,
}

impl Default for BufferQueueBuilder {
    fn default() -> Self {
        Self {
            name: "bufferqueue".to_owned(),
            queue_size: DEFAULT_QUEUE_SIZE,
            blocking: true,
            priority_alloc: false,
            source_type: SourceType::Default,
            default_width: 0,
            default_height: 0,
            default_usage: BufferUsage::CPU_READ | BufferUsage::CPU_WRITE | BufferUsage::MEM_DMA,
            allocator: None, // SharedMemoryAllocator
            telemetry: None, // NoopTelemetry
            sequences: None,
        }
    }
}

impl BufferQueueBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_queue_size(mut self, size: u32) -> Self {
        self.queue_size = size;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_priority_alloc(mut self, enabled: bool) -> Self {
        self.priority_alloc = enabled;
        self
    }

    pub fn with_source_type(mut self, source: SourceType) -> Self {
        self.source_type = source;
        self
    }

    pub fn with_default_size(mut self, width: i32, height: i32) -> Self {
        self.default_width = width;
        self.default_height = height;
        self
    }

    pub fn with_default_usage(mut self, usage: BufferUsage) -> Self {
        self.default_usage = usage;
        self
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Share a sequence generator between queues, or start numbering at a
    /// known value in tests.
    pub fn with_sequence_generator(mut self, sequences: Arc<SequenceGenerator>) -> Self {
        self.sequences = Some(sequences);
        self
    }

    pub fn build(mut self) -> GSResult<Arc<BufferQueue>> {
        if self.queue_size == 0 || self.queue_size > MAX_QUEUE_SIZE {
            return Err(GSError::InvalidArguments(format!(
                "queue size {} not in 1..={MAX_QUEUE_SIZE}",
                self.queue_size
            )));
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(GSError::OutOfRange(format!("queue name of {} bytes", self.name.len())));
        }
        if self.default_width < 0 || self.default_height < 0 {
            return Err(GSError::InvalidArguments(format!(
                "default size {}x{}",
                self.default_width, self.default_height
            )));
        }
        let allocator = self
            .allocator
            .take()
            .unwrap_or_else(|| Arc::new(SharedMemoryAllocator::default()));
        let telemetry = self.telemetry.take().unwrap_or_else(|| Arc::new(NoopTelemetry));
        let sequences = self
            .sequences
            .take()
            .unwrap_or_else(|| Arc::new(SequenceGenerator::new()));
        Ok(Arc::new(BufferQueue::from_builder(self, allocator, sequences, telemetry)))
    }

    /// Build a queue and both of its endpoints.
    pub fn build_pair(self) -> GSResult<(Producer, Consumer)> {
        let queue = self.build()?;
        Ok((Producer::new(Arc::clone(&queue)), Consumer::new(queue)))
    }
}
