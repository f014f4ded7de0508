use crate::Core::handle::{allocate_buffer_handle, BufferHandle};
use crate::Core::SharedMemory::create_memfd;
use crate::error::{GSError, GSResult};
use crate::Queue::Structs::RequestConfig;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
mod debug;
mod getters;

// Use parking_lot's Mutex for better performance
use parking_lot::Mutex;

/// Default memory budget for one allocator instance.
pub const DEFAULT_MEMORY_LIMIT: u64 = 512 * 1024 * 1024;

/// Materializes native buffers for the queue.
///
/// Implementations may be slow; the queue calls `allocate` with its lock
/// released and revalidates afterwards.
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, config: &RequestConfig) -> GSResult<BufferHandle>;

    /// Called once when the last reference to a buffer from `allocate` drops,
    /// before its descriptors close.
    fn free(&self, _handle: &BufferHandle) {}
}

/// Hands out buffer sequence numbers. The high half carries the pid so
/// sequences from different processes do not collide; the low half wraps.
pub struct SequenceGenerator {
    base: u32,
    counter: AtomicU32,
}

impl Default for SequenceGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::starting_at((std::process::id() & 0xFFFF) << 16)
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            base: first & 0xFFFF_0000,
            counter: AtomicU32::new(first & 0xFFFF),
        }
    }

    pub fn next(&self) -> u32 {
        let low = self.counter.fetch_add(1, Ordering::Relaxed) & 0xFFFF;
        self.base | low
    }

    /// Next sequence for which `in_use` is false, or `None` once the whole
    /// 16-bit space is taken.
    pub fn next_unused(&self, in_use: impl Fn(u32) -> bool) -> Option<u32> {
        (0..=0xFFFF).map(|_| self.next()).find(|seq| !in_use(*seq))
    }
}

/// Allocator backing every buffer with an anonymous memfd.
pub struct SharedMemoryAllocator {
    memory_limit: u64,
    used_bytes: AtomicU64,
    allocation_count: AtomicU64,
    allocation_mutex: Mutex<()>, // serialises budget check + memfd creation
}

impl Default for SharedMemoryAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_LIMIT)
    }
}

impl SharedMemoryAllocator {
    // Create an allocator that refuses to hold more than `memory_limit` bytes at once
    pub fn new(memory_limit: u64) -> Self {
        Self {
            memory_limit,
            used_bytes: AtomicU64::new(0),
            allocation_count: AtomicU64::new(0),
            allocation_mutex: Mutex::new(()),
        }
    }

    /// Stride in bytes and total size for a request.
    pub fn compute_layout(config: &RequestConfig) -> GSResult<(i32, i32)> {
        config.validate()?;
        let align = config.stride_alignment as usize;
        let row = config.width as usize * config.format.bytes_per_pixel();
        let stride = (row + align - 1) & !(align - 1);
        let height = config.height as usize;
        let mut size = stride
            .checked_mul(height)
            .ok_or_else(|| GSError::InvalidArguments("buffer size overflow".into()))?;
        if config.format.is_yuv420() {
            size += size / 2;
        }
        if stride > i32::MAX as usize || size > i32::MAX as usize {
            return Err(GSError::InvalidArguments(format!(
                "buffer {}x{} too large",
                config.width, config.height
            )));
        }
        Ok((stride as i32, size as i32))
    }
}

impl BufferAllocator for SharedMemoryAllocator {
    fn allocate(&self, config: &RequestConfig) -> GSResult<BufferHandle> {
        let (stride, size) = Self::compute_layout(config)?;

        let _guard = self.allocation_mutex.lock();

        // Check if we have enough space
        let used = self.used_bytes.load(Ordering::Acquire);
        if used + size as u64 > self.memory_limit {
            log::warn!(
                "SharedMemoryAllocator: budget exhausted (used {used}, requested {size}, limit {})",
                self.memory_limit
            );
            return Err(GSError::NoMemory);
        }

        let fd = create_memfd(size as usize, "surface_buffer").map_err(|e| match e.raw_os_error() {
            Some(libc::ENOMEM) | Some(libc::ENOSPC) => GSError::NoMemory,
            _ => GSError::Unknown(format!("memfd allocation failed: {e}")),
        })?;

        let mut handle = allocate_buffer_handle(0, 0)
            .ok_or_else(|| GSError::Unknown("descriptor allocation".into()))?;
        handle.fd = fd;
        handle.width = config.width;
        handle.stride = stride;
        handle.height = config.height;
        handle.size = size;
        handle.format = config.format.raw();
        handle.usage = config.usage.bits();

        self.used_bytes.fetch_add(size as u64, Ordering::AcqRel);
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn free(&self, handle: &BufferHandle) {
        let size = handle.size.max(0) as u64;
        let _ = self
            .used_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(size)));
    }
}
