use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI32, AtomicU32};

/// Number of entries in the low-power ring.
pub const LPP_SLOT_SIZE: usize = 8;

/// One frame published by a low-power video producer.
///
/// Plain integers only; the entry is published by the release store of
/// `LppSlotInfo::write_offset` that follows the write.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LppSlotEntry {
    /// Sequence number of a buffer registered with the queue.
    pub seq_id: u32,
    pub reserved: u32,
    pub timestamp: i64,
    /// Crop rectangle: x, y, w, h.
    pub crop: [i32; 4],
}

/// Shared-memory header of the low-power ring.
///
/// Lives at offset 0 of the region bound with `set_lpp_share_fd`; the
/// producer process maps the same fd. Offsets are monotonic counters, the
/// entry for counter `n` sits at `slot[n % LPP_SLOT_SIZE]`. A consistent ring
/// satisfies `read_offset <= write_offset <= read_offset + LPP_SLOT_SIZE`.
#[repr(C, align(128))]
pub struct LppSlotInfo {
    /// Next entry the consumer side will read.
    pub read_offset: CachePadded<AtomicU32>,

    /// Next entry the producer will write.
    pub write_offset: CachePadded<AtomicU32>,

    pub slot: [LppSlotEntry; LPP_SLOT_SIZE],

    /// Producer frame rate hint in frames per second.
    pub frame_rate: AtomicI32,

    /// Non-zero asks the hardware path to stop drawing.
    pub is_stop_shb_draw: AtomicU32,
}
