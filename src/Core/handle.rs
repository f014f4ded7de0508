// Owned file descriptors and the native buffer descriptor built on them.

use crate::error::{GSError, GSResult};
use std::io;
use std::os::unix::io::RawFd;

/// Upper bound on `reserve_fds` / `reserve_ints` accepted anywhere a
/// descriptor is built or decoded.
pub const MAX_RESERVE_COUNT: u32 = 1024;

/// Sentinel stored in every fd slot that does not own a descriptor.
pub const INVALID_FD: RawFd = -1;

/// A move-only file descriptor.
///
/// The descriptor is closed exactly once: by `close()` or on drop, whichever
/// comes first. Copies are only made through `duplicate()`.
pub struct OwnedHandle {
    fd: RawFd,
}

impl OwnedHandle {
    /// Take ownership of a raw descriptor. Negative values produce an invalid handle.
    ///
    /// # Safety
    /// `fd` must not be owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: if fd < 0 { INVALID_FD } else { fd },
        }
    }

    pub fn invalid() -> Self {
        Self { fd: INVALID_FD }
    }

    pub fn is_valid(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Duplicate the descriptor with close-on-exec set.
    /// Duplicating an invalid handle yields another invalid handle.
    pub fn duplicate(&self) -> io::Result<OwnedHandle> {
        if !self.is_valid() {
            return Ok(OwnedHandle::invalid());
        }
        let fd = unsafe { libc::fcntl(self.fd, libc::F_DUPFD_CLOEXEC, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(OwnedHandle { fd })
    }

    /// Close the descriptor now. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = INVALID_FD;
        }
    }

    /// Give up ownership without closing.
    pub fn into_raw(mut self) -> RawFd {
        let fd = self.fd;
        self.fd = INVALID_FD;
        fd
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Native descriptor of one graphics buffer: backing memory fd plus the
/// geometry the allocator produced.
pub struct BufferHandle {
    pub fd: OwnedHandle,
    pub width: i32,
    pub stride: i32,
    pub height: i32,
    pub size: i32,
    pub format: i32,
    pub usage: u64,
    pub phy_addr: u64,
    pub reserve_fds: Vec<OwnedHandle>,
    pub reserve_ints: Vec<i32>,
}

/// Allocate an empty descriptor with room for the given reserved fds/ints.
///
/// Returns `None` without allocating when either count exceeds
/// `MAX_RESERVE_COUNT`. Reserved fd slots start as `INVALID_FD`.
pub fn allocate_buffer_handle(reserve_fds: u32, reserve_ints: u32) -> Option<BufferHandle> {
    if reserve_fds > MAX_RESERVE_COUNT || reserve_ints > MAX_RESERVE_COUNT {
        log::error!(
            "allocate_buffer_handle: reserve counts too large (fds {reserve_fds}, ints {reserve_ints})"
        );
        return None;
    }
    Some(BufferHandle {
        fd: OwnedHandle::invalid(),
        width: 0,
        stride: 0,
        height: 0,
        size: 0,
        format: 0,
        usage: 0,
        phy_addr: 0,
        reserve_fds: (0..reserve_fds).map(|_| OwnedHandle::invalid()).collect(),
        reserve_ints: vec![0; reserve_ints as usize],
    })
}

/// Release every descriptor owned by `handle`. `None` is a successful no-op.
pub fn free_buffer_handle(handle: Option<BufferHandle>) -> GSResult<()> {
    if let Some(mut handle) = handle {
        handle.close();
    }
    Ok(())
}

impl BufferHandle {
    pub fn reserve_fd_count(&self) -> u32 {
        self.reserve_fds.len() as u32
    }

    pub fn reserve_int_count(&self) -> u32 {
        self.reserve_ints.len() as u32
    }

    /// Close the main fd and every reserved fd. Idempotent.
    pub fn close(&mut self) {
        self.fd.close();
        for fd in self.reserve_fds.iter_mut() {
            fd.close();
        }
    }

    /// Deep copy with freshly duplicated descriptors. On failure the
    /// descriptors duplicated so far are closed before returning.
    pub fn duplicate(&self) -> GSResult<BufferHandle> {
        let mut copy = allocate_buffer_handle(self.reserve_fd_count(), self.reserve_int_count())
            .ok_or_else(|| GSError::OutOfRange("reserve counts".into()))?;
        copy.fd = self.fd.duplicate()?;
        copy.width = self.width;
        copy.stride = self.stride;
        copy.height = self.height;
        copy.size = self.size;
        copy.format = self.format;
        copy.usage = self.usage;
        copy.phy_addr = self.phy_addr;
        for (dst, src) in copy.reserve_fds.iter_mut().zip(self.reserve_fds.iter()) {
            *dst = src.duplicate()?;
        }
        copy.reserve_ints.copy_from_slice(&self.reserve_ints);
        Ok(copy)
    }
}
