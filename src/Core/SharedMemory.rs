// Shared memory backend for buffer storage and the LPP ring.
// Regions are anonymous memfds; other processes reach them through fd passing.

use super::handle::OwnedHandle;
use std::fmt::Debug;
use std::io;
use std::ptr::NonNull;

/// Shared memory backend trait for memory mapped regions
pub trait SharedMemoryBackend: Send + Sync + Debug {
    /// Get a pointer to the mapped memory region
    fn as_ptr(&self) -> *mut u8;

    /// Get the size of the mapped region in bytes
    fn size(&self) -> usize;

    /// Get the underlying file descriptor
    fn raw_handle(&self) -> RawHandle;

    /// Duplicate the backing descriptor so it can be handed to another process
    fn share_handle(&self) -> io::Result<OwnedHandle>;
}

/// Platform-specific handle type
#[derive(Debug, Clone, Copy)]
pub enum RawHandle {
    /// Unix file descriptor (Linux)
    Fd(i32),
}

/// Create a new anonymous shared memory region of `size` bytes.
///
/// # Arguments
/// * `size` - Size of the region in bytes, must be non-zero
/// * `name` - Debug name shown in /proc/<pid>/fd
#[cfg(target_os = "linux")]
pub fn create_shared_memory(size: usize, name: Option<&str>) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::create(size, name)?))
}

/// Map a region received from another process.
///
/// The handle is consumed; it is closed when the mapping is dropped or when
/// mapping fails. The region must be at least `min_size` bytes.
#[cfg(target_os = "linux")]
pub fn attach_shared_memory(handle: OwnedHandle, min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Ok(Box::new(LinuxSharedMemory::attach(handle, min_size)?))
}

/// Create an anonymous memfd of `size` bytes without mapping it.
#[cfg(target_os = "linux")]
pub fn create_memfd(size: usize, name: &str) -> io::Result<OwnedHandle> {
    let c_name = std::ffi::CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "memfd name contains NUL"))?;
    let fd = unsafe { libc::memfd_create(c_name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // Owned from here on so every early return closes it.
    let handle = unsafe { OwnedHandle::from_raw(fd) };
    if unsafe { libc::ftruncate(handle.as_raw(), size as libc::off_t) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(handle)
}

#[cfg(not(target_os = "linux"))]
pub fn create_shared_memory(_size: usize, _name: Option<&str>) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn attach_shared_memory(_handle: OwnedHandle, _min_size: usize) -> io::Result<Box<dyn SharedMemoryBackend>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(not(target_os = "linux"))]
pub fn create_memfd(_size: usize, _name: &str) -> io::Result<OwnedHandle> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "Shared memory only supported on Linux",
    ))
}

#[cfg(target_os = "linux")]
pub struct LinuxSharedMemory {
    ptr: NonNull<u8>,
    size: usize,
    fd: OwnedHandle,
}

#[cfg(target_os = "linux")]
unsafe impl Send for LinuxSharedMemory {}
#[cfg(target_os = "linux")]
unsafe impl Sync for LinuxSharedMemory {}

#[cfg(target_os = "linux")]
impl LinuxSharedMemory {
    /// Create and map a fresh zero-filled region.
    pub fn create(size: usize, name: Option<&str>) -> io::Result<Self> {
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "shared memory size must be non-zero",
            ));
        }
        let fd = create_memfd(size, name.unwrap_or("bufferqueue_shm"))?;
        Self::map(fd, size)
    }

    /// Map an existing region, checking it is large enough.
    pub fn attach(fd: OwnedHandle, min_size: usize) -> io::Result<Self> {
        if !fd.is_valid() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid shared memory fd"));
        }

        let actual_size = unsafe {
            let mut stat: libc::stat = std::mem::zeroed();
            if libc::fstat(fd.as_raw(), &mut stat) != 0 {
                return Err(io::Error::last_os_error());
            }
            stat.st_size as usize
        };

        if actual_size < min_size || actual_size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Shared memory too small: expected at least {}, got {}",
                    min_size, actual_size
                ),
            ));
        }

        Self::map(fd, actual_size)
    }

    fn map(fd: OwnedHandle, size: usize) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, size, fd })
    }
}

#[cfg(target_os = "linux")]
impl Drop for LinuxSharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
        }
        // fd closes through OwnedHandle
    }
}

#[cfg(target_os = "linux")]
impl SharedMemoryBackend for LinuxSharedMemory {
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn size(&self) -> usize {
        self.size
    }

    fn raw_handle(&self) -> RawHandle {
        RawHandle::Fd(self.fd.as_raw())
    }

    fn share_handle(&self) -> io::Result<OwnedHandle> {
        self.fd.duplicate()
    }
}
