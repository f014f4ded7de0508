use super::*;
use std::sync::atomic::Ordering;

/// Getter methods for SharedMemoryAllocator
///
/// These expose the allocator's accounting for debugging and monitoring.
impl SharedMemoryAllocator {
    /// Maximum number of bytes this allocator will keep alive at once
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    /// Bytes currently held by live buffers
    pub fn used_memory(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    /// Bytes that can still be allocated before the budget is exhausted
    pub fn available_memory(&self) -> u64 {
        self.memory_limit.saturating_sub(self.used_memory())
    }

    /// Total number of successful allocations since creation
    ///
    /// Loaded with relaxed ordering since this is only used for monitoring.
    pub fn allocation_count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }
}
