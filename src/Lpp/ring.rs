// Consumer-side view of the shared low-power ring.

use super::layout::{LppSlotEntry, LppSlotInfo, LPP_SLOT_SIZE};
use crate::Core::handle::OwnedHandle;
use crate::Core::SharedMemory::{attach_shared_memory, SharedMemoryBackend};
use crate::error::{GSError, GSResult};
use std::io;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

/// Latest frame taken from the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LppFrame {
    pub entry: LppSlotEntry,
    /// Value of `write_offset` the frame was read at.
    pub write_offset: u32,
    /// Frames published since the previous read that were never shown.
    pub skipped: u32,
}

/// Mapping of an `LppSlotInfo` region plus reader bookkeeping.
///
/// Dropping the ring unmaps the region and closes its descriptor.
pub struct LppRing {
    shm: Box<dyn SharedMemoryBackend>,
    last_write_offset: u32,
}

impl LppRing {
    /// Map the region behind `handle`. Fails if it cannot hold an `LppSlotInfo`.
    pub fn bind(handle: OwnedHandle) -> io::Result<Self> {
        let shm = attach_shared_memory(handle, size_of::<LppSlotInfo>())?;
        if (shm.as_ptr() as usize) % std::mem::align_of::<LppSlotInfo>() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "LPP region not properly aligned",
            ));
        }
        let mut ring = Self {
            shm,
            last_write_offset: 0,
        };
        ring.last_write_offset = ring.info().write_offset.load(Acquire);
        Ok(ring)
    }

    /// Raw pointer into the mapping, for the non-atomic entry array.
    #[inline]
    fn raw(&self) -> *mut LppSlotInfo {
        self.shm.as_ptr() as *mut LppSlotInfo
    }

    #[inline]
    pub fn info(&self) -> &LppSlotInfo {
        // Safety: size and alignment were checked in `bind`; the mapping lives
        // as long as `self`.
        unsafe { &*self.raw() }
    }

    pub fn offsets(&self) -> (u32, u32) {
        let info = self.info();
        (info.read_offset.load(Acquire), info.write_offset.load(Acquire))
    }

    /// Offsets as published, or `InvalidArguments` when they cannot describe a ring.
    /// Both counters wrap at `u32::MAX`; only their distance is meaningful.
    pub fn checked_offsets(&self) -> GSResult<(u32, u32)> {
        let (read, write) = self.offsets();
        if write.wrapping_sub(read) as usize > LPP_SLOT_SIZE {
            return Err(GSError::InvalidArguments(format!(
                "lpp offsets read {read} write {write}"
            )));
        }
        Ok((read, write))
    }

    pub fn last_write_offset(&self) -> u32 {
        self.last_write_offset
    }

    /// Entry most recently published, provided a frame arrived since the last
    /// call that returned successfully.
    pub fn peek_latest(&self) -> GSResult<LppFrame> {
        let (_, write) = self.checked_offsets()?;
        let fresh = write.wrapping_sub(self.last_write_offset);
        if fresh == 0 || fresh > i32::MAX as u32 {
            return Err(GSError::NoBuffer);
        }
        let index = write.wrapping_sub(1) as usize % LPP_SLOT_SIZE;
        let entry = unsafe { ptr::read_volatile(ptr::addr_of!((*self.raw()).slot[index])) };
        Ok(LppFrame {
            entry,
            write_offset: write,
            skipped: fresh - 1,
        })
    }

    /// Record that `frame` was handed out.
    pub fn mark_read(&mut self, frame: &LppFrame) {
        self.last_write_offset = frame.write_offset;
    }

    /// Move the read offset up to `write`; never backwards.
    pub fn consume_to(&self, write: u32) {
        let _ = self
            .info()
            .read_offset
            .fetch_update(Release, Acquire, |read| {
                let ahead = write.wrapping_sub(read);
                (ahead != 0 && ahead <= LPP_SLOT_SIZE as u32).then_some(write)
            });
    }

    /// Producer-side publish used when a flush is absorbed by the ring.
    /// `NoBuffer` when all entries are still unread.
    pub fn publish(&self, entry: LppSlotEntry) -> GSResult<u32> {
        let (read, write) = self.checked_offsets()?;
        if write.wrapping_sub(read) as usize >= LPP_SLOT_SIZE {
            return Err(GSError::NoBuffer);
        }
        let index = write as usize % LPP_SLOT_SIZE;
        // Safety: the entry lies inside the mapping; readers only look at it
        // after the `write_offset` store below.
        unsafe {
            ptr::write_volatile(ptr::addr_of_mut!((*self.raw()).slot[index]), entry);
        }
        let next = write.wrapping_add(1);
        self.info().write_offset.store(next, Release);
        Ok(next)
    }

    pub fn frame_rate(&self) -> i32 {
        self.info().frame_rate.load(Relaxed)
    }

    pub fn set_stop_shb_draw(&self, stop: bool) {
        self.info().is_stop_shb_draw.store(stop as u32, Release);
    }

    pub fn is_stop_shb_draw(&self) -> bool {
        self.info().is_stop_shb_draw.load(Acquire) != 0
    }
}
