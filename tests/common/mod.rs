// Shared fixtures for the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use surface_bufferqueue::Core::alloc::{BufferAllocator, SharedMemoryAllocator};
use surface_bufferqueue::Core::fence::Fence;
use surface_bufferqueue::Core::handle::BufferHandle;
use surface_bufferqueue::Queue::delegate::{ConsumerListener, SurfaceDelegator, TelemetrySink};
use surface_bufferqueue::Queue::Structs::{BufferUsage, PixelFormat, RequestConfig};
use surface_bufferqueue::{BufferQueueBuilder, GSError, GSResult};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn rgba(width: i32, height: i32) -> RequestConfig {
    RequestConfig::new(
        width,
        height,
        PixelFormat::Rgba8888,
        BufferUsage::CPU_READ | BufferUsage::CPU_WRITE | BufferUsage::MEM_DMA,
    )
}

/// The configuration used throughout the examples: 0x100 x 0x100 RGBA8888.
pub fn default_config() -> RequestConfig {
    rgba(0x100, 0x100)
}

pub fn queue_builder(size: u32) -> BufferQueueBuilder {
    init_logging();
    BufferQueueBuilder::new()
        .with_name("test-queue")
        .with_queue_size(size)
}

/// Number of descriptors currently open in this process.
pub fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|dir| dir.count())
        .unwrap_or(0)
}

/// Delegates to a real allocator until told to fail.
#[derive(Default)]
pub struct FlakyAllocator {
    inner: SharedMemoryAllocator,
    pub fail: std::sync::atomic::AtomicBool,
    pub calls: AtomicUsize,
}

impl FlakyAllocator {
    pub fn failing() -> Self {
        let a = Self::default();
        a.fail.store(true, Ordering::SeqCst);
        a
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl BufferAllocator for FlakyAllocator {
    fn allocate(&self, config: &RequestConfig) -> GSResult<BufferHandle> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(GSError::NoMemory);
        }
        self.inner.allocate(config)
    }

    fn free(&self, handle: &BufferHandle) {
        self.inner.free(handle);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DelegatorEvent {
    Dequeue(u32),
    Queue(u32),
    Release(u32),
    ClearSlot(u32),
}

/// Records every delegator callback; optionally fails all of them.
#[derive(Default)]
pub struct RecordingDelegator {
    pub events: Mutex<Vec<DelegatorEvent>>,
    pub fail: bool,
}

impl RecordingDelegator {
    fn record(&self, event: DelegatorEvent) -> GSResult<()> {
        self.events.lock().push(event);
        if self.fail {
            return Err(GSError::Unknown("delegator offline".into()));
        }
        Ok(())
    }

    pub fn events(&self) -> Vec<DelegatorEvent> {
        self.events.lock().clone()
    }
}

impl SurfaceDelegator for RecordingDelegator {
    fn on_dequeue(&self, seq: u32) -> GSResult<()> {
        self.record(DelegatorEvent::Dequeue(seq))
    }

    fn on_queue(&self, seq: u32, _fence: &Fence) -> GSResult<()> {
        self.record(DelegatorEvent::Queue(seq))
    }

    fn on_release(&self, seq: u32, _fence: &Fence) -> GSResult<()> {
        self.record(DelegatorEvent::Release(seq))
    }

    fn on_clear_slot(&self, seq: u32) -> GSResult<()> {
        self.record(DelegatorEvent::ClearSlot(seq))
    }
}

#[derive(Default)]
pub struct RecordingTelemetry {
    pub flushes: Mutex<Vec<u32>>,
    pub acquires: Mutex<Vec<u32>>,
}

impl TelemetrySink for RecordingTelemetry {
    fn on_flush(&self, _queue_name: &str, seq: u32, _timestamp: i64) {
        self.flushes.lock().push(seq);
    }

    fn on_acquire(&self, _queue_name: &str, seq: u32) {
        self.acquires.lock().push(seq);
    }
}

#[derive(Default)]
pub struct CountingListener {
    pub available: AtomicUsize,
    pub property_changes: AtomicUsize,
}

impl ConsumerListener for CountingListener {
    fn on_buffer_available(&self) {
        self.available.fetch_add(1, Ordering::SeqCst);
    }

    fn on_property_change(&self) {
        self.property_changes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects the sequences reported to a delete-buffer listener.
pub fn delete_recorder() -> (Arc<Mutex<Vec<u32>>>, Arc<dyn Fn(u32) + Send + Sync>) {
    let deleted = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&deleted);
    (deleted, Arc::new(move |seq| sink.lock().push(seq)))
}
