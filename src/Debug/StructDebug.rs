use crate::Core::alloc::SharedMemoryAllocator;
use crate::Core::handle::{BufferHandle, OwnedHandle};
#[cfg(target_os = "linux")]
use crate::Core::SharedMemory::{LinuxSharedMemory, SharedMemoryBackend};
use crate::Lpp::ring::LppRing;
use crate::Queue::Buffer::SurfaceBuffer;
use std::fmt;

/// Debug function for SharedMemoryAllocator
///
/// Shows the memory budget and current accounting.
pub fn debug_shared_memory_allocator(allocator: &SharedMemoryAllocator, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SharedMemoryAllocator")
        .field("memory_limit", &allocator.memory_limit())
        .field("used_memory", &allocator.used_memory())
        .field("allocation_count", &allocator.allocation_count())
        .finish()
}

/// Debug function for LinuxSharedMemory
///
/// Safely displays the mapping location without dereferencing
#[cfg(target_os = "linux")]
pub fn debug_linux_shared_memory(shm: &LinuxSharedMemory, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LinuxSharedMemory")
        .field("ptr", &format_args!("{:p}", shm.as_ptr()))
        .field("size", &shm.size())
        .field("raw_handle", &shm.raw_handle())
        .finish()
}

/// Debug function for BufferHandle
///
/// Reserved ints are summarised; fds are shown as raw numbers.
pub fn debug_buffer_handle(handle: &BufferHandle, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BufferHandle")
        .field("fd", &handle.fd.as_raw())
        .field("width", &handle.width)
        .field("stride", &handle.stride)
        .field("height", &handle.height)
        .field("size", &handle.size)
        .field("format", &handle.format)
        .field("usage", &format_args!("{:#x}", handle.usage))
        .field("phy_addr", &format_args!("{:#x}", handle.phy_addr))
        .field("reserve_fds", &handle.reserve_fd_count())
        .field("reserve_ints", &handle.reserve_int_count())
        .finish()
}

pub fn debug_surface_buffer(buffer: &SurfaceBuffer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("SurfaceBuffer")
        .field("seq", &buffer.seq_num())
        .field("handle", buffer.handle())
        .field("format", &buffer.request_config().format)
        .finish_non_exhaustive()
}

/// Debug function for LppRing
///
/// Reads the shared offsets; does not touch ring entries.
pub fn debug_lpp_ring(ring: &LppRing, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let (read, write) = ring.offsets();
    f.debug_struct("LppRing")
        .field("read_offset", &read)
        .field("write_offset", &write)
        .field("last_write_offset", &ring.last_write_offset())
        .field("frame_rate", &ring.frame_rate())
        .finish()
}

// Debug proxy implementations that call the standalone debug functions above

impl fmt::Debug for OwnedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OwnedHandle").field(&self.as_raw()).finish()
    }
}

#[cfg(target_os = "linux")]
impl fmt::Debug for LinuxSharedMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_linux_shared_memory(self, f)
    }
}

impl fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_buffer_handle(self, f)
    }
}

impl fmt::Debug for SurfaceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_surface_buffer(self, f)
    }
}

impl fmt::Debug for LppRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        debug_lpp_ring(self, f)
    }
}
