//! The buffer queue core: slot table, free/dirty lists and every producer and
//! consumer operation.
//!
//! ### Concurrency Design:
//! - All queue state lives behind one `parking_lot::Mutex`.
//! - Producers blocked in `request_buffer`/`attach_buffer` wait on
//!   `free_cond`; consumers that choose to wait use `dirty_cond`. Waiters
//!   always re-evaluate their predicate after waking.
//! - The allocator runs with the lock released; the slot being provisioned is
//!   reserved beforehand and the queue is revalidated afterwards.
//! - Delete listeners, the delegator, the consumer listener and telemetry are
//!   called after the lock is dropped. Buffers removed from the table are
//!   dropped last, so native descriptors close outside the lock too.

use super::builder::BufferQueueBuilder;
use super::delegate::{
    notify_delegator, ConsumerListener, DeleteBufferListener, SurfaceDelegator, TelemetrySink,
};
use super::Buffer::{Slot, SlotState, SurfaceBuffer};
use super::Structs::Buffer_Structs::{
    BufferOwner, BufferUsage, ExtraData, FlushConfig, HdrMetaData, HdrMetadataType, PresentTimestamp,
    PresentTimestampType, Rect, RequestConfig, ScalingMode, SourceType, TransformType,
    TunnelHandle, MAX_METADATA_SET_SIZE,
};
use crate::Core::alloc::{BufferAllocator, SequenceGenerator};
use crate::Core::fence::Fence;
use crate::Core::handle::{BufferHandle, OwnedHandle};
use crate::error::{GSError, GSResult};
use crate::Lpp::layout::LppSlotEntry;
use crate::Lpp::ring::LppRing;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const MAX_QUEUE_SIZE: u32 = 64;
pub const DEFAULT_QUEUE_SIZE: u32 = 3;
pub const MAX_NAME_LEN: usize = 256;

/// A frame whose desired present time is further than this past the
/// compositor's expected present time is not ready yet.
const PRESENT_LOOKAHEAD_NS: i64 = 1_000_000_000;

/// Current CLOCK_MONOTONIC time in nanoseconds; the clock used for flush and
/// present timestamps.
pub fn monotonic_now_ns() -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64
}

/// Result of `request_buffer`.
pub struct RequestBufferReturn {
    pub sequence: u32,
    /// `None` when the producer already holds this buffer from an earlier request.
    pub buffer: Option<Arc<SurfaceBuffer>>,
    /// Consumer release fence to wait on before writing.
    pub fence: Fence,
    /// Sequences destroyed since the previous request; the producer drops them
    /// from its cache.
    pub deleting_buffers: Vec<u32>,
}

/// Result of `acquire_buffer`.
pub struct AcquireBufferReturn {
    pub buffer: Arc<SurfaceBuffer>,
    /// Producer fence to wait on before reading.
    pub fence: Fence,
    pub timestamp: i64,
    pub damages: Vec<Rect>,
    pub desired_present_timestamp: i64,
    pub is_auto_timestamp: bool,
}

/// Frame handed out by `acquire_lpp_buffer`.
pub struct LppAcquired {
    pub buffer: Arc<SurfaceBuffer>,
    pub timestamp: i64,
    pub crop: Rect,
    /// Frames published since the previous acquisition that were never shown.
    pub skipped: u32,
}

enum Selection {
    Reuse(u32),
    Grow,
    Realloc(u32),
    Full,
}

/// Work to run once the lock is released.
#[derive(Default)]
struct Deferred {
    deleted: Vec<Arc<SurfaceBuffer>>,
    listeners: Vec<DeleteBufferListener>,
    delegator: Option<Arc<dyn SurfaceDelegator>>,
}

impl Deferred {
    fn run(self, queue_name: &str) {
        for buffer in &self.deleted {
            let seq = buffer.seq_num();
            for listener in &self.listeners {
                listener(seq);
            }
            if let Some(delegator) = &self.delegator {
                notify_delegator(queue_name, "clear slot", || delegator.on_clear_slot(seq));
            }
        }
        // `deleted` drops here, closing descriptors nobody else references.
    }
}

pub(crate) struct QueueState {
    slots: BTreeMap<u32, Slot>,
    free_list: VecDeque<u32>,
    dirty_list: VecDeque<u32>,
    /// Destroyed sequences not yet reported to the producer.
    deleting_list: Vec<u32>,
    deleted: Vec<Arc<SurfaceBuffer>>,
    queue_size: u32,
    /// Allocations in progress with the lock released; they count as used.
    pending_allocs: u32,
    status: bool,
    blocking: bool,
    priority_alloc: bool,
    source_type: SourceType,
    transform: TransformType,
    default_width: i32,
    default_height: i32,
    default_usage: BufferUsage,
    tunnel_handle: Option<TunnelHandle>,
    last_flushed: Option<u32>,
    delegator: Option<Arc<dyn SurfaceDelegator>>,
    delete_listeners: Vec<DeleteBufferListener>,
    consumer_listener: Option<Arc<dyn ConsumerListener>>,
    lpp_ring: Option<LppRing>,
    lpp_cache: BTreeMap<u32, Arc<SurfaceBuffer>>,
    is_rs_draw_lpp: bool,
    is_shb_draw_lpp: bool,
}

impl QueueState {
    fn used_size(&self) -> u32 {
        self.slots.len() as u32 + self.pending_allocs
    }

    fn slot(&self, seq: u32) -> GSResult<&Slot> {
        self.slots
            .get(&seq)
            .ok_or_else(|| GSError::NoEntry(format!("sequence {seq}")))
    }

    fn slot_mut(&mut self, seq: u32) -> GSResult<&mut Slot> {
        self.slots
            .get_mut(&seq)
            .ok_or_else(|| GSError::NoEntry(format!("sequence {seq}")))
    }

    fn is_lpp(&self) -> bool {
        self.source_type == SourceType::LowPowerVideo
    }

    /// Remove a slot from every list and queue its buffer for destruction.
    fn delete_slot(&mut self, seq: u32) {
        if let Some(slot) = self.slots.remove(&seq) {
            self.free_list.retain(|s| *s != seq);
            self.dirty_list.retain(|s| *s != seq);
            self.lpp_cache.remove(&seq);
            if self.last_flushed == Some(seq) {
                self.last_flushed = None;
            }
            self.deleting_list.push(seq);
            self.deleted.push(slot.buffer);
        }
    }

    /// Transition a slot back to `Free`, or destroy it if it was marked
    /// deleting or the queue holds more buffers than its capacity.
    fn return_to_free(&mut self, seq: u32) {
        let over_capacity = self.slots.len() as u32 > self.queue_size;
        let deleting = match self.slots.get_mut(&seq) {
            Some(slot) if slot.is_deleting || over_capacity => true,
            Some(slot) => {
                slot.state = SlotState::Free;
                slot.reset_frame_state();
                false
            }
            None => return,
        };
        if deleting {
            self.delete_slot(seq);
        } else {
            self.free_list.push_back(seq);
        }
    }

    fn select_slot(&self, config: &RequestConfig) -> Selection {
        let matching = |seq: &u32| {
            self.slots
                .get(seq)
                .map_or(false, |s| s.config.same_allocation(config))
        };
        let hit = if self.priority_alloc {
            self.free_list.iter().rev().find(|s| matching(s))
        } else {
            self.free_list.iter().find(|s| matching(s))
        };
        if let Some(seq) = hit {
            return Selection::Reuse(*seq);
        }
        if self.used_size() < self.queue_size {
            return Selection::Grow;
        }
        let stale = if self.priority_alloc {
            self.free_list.back()
        } else {
            self.free_list.front()
        };
        match stale {
            Some(seq) => Selection::Realloc(*seq),
            None => Selection::Full,
        }
    }

    fn take_deferred(&mut self) -> Deferred {
        if self.deleted.is_empty() {
            return Deferred::default();
        }
        Deferred {
            deleted: std::mem::take(&mut self.deleted),
            listeners: self.delete_listeners.clone(),
            delegator: self.delegator.clone(),
        }
    }

    fn take_deleting_list(&mut self) -> Vec<u32> {
        let n = self.deleting_list.len().min(MAX_QUEUE_SIZE as usize);
        self.deleting_list.drain(..n).collect()
    }
}

/// Fixed-capacity producer/consumer buffer queue.
pub struct BufferQueue {
    name: String,
    unique_id: u64,
    state: Mutex<QueueState>,
    free_cond: Condvar,
    dirty_cond: Condvar,
    allocator: Arc<dyn BufferAllocator>,
    sequences: Arc<SequenceGenerator>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl BufferQueue {
    pub(crate) fn from_builder(
        builder: BufferQueueBuilder,
        allocator: Arc<dyn BufferAllocator>,
        sequences: Arc<SequenceGenerator>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let unique_id = ((std::process::id() as u64) << 32) | sequences.next() as u64;
        log::info!(
            "[{}] created: queue size {}, blocking {}, source {:?}",
            builder.name,
            builder.queue_size,
            builder.blocking,
            builder.source_type
        );
        Self {
            name: builder.name,
            unique_id,
            state: Mutex::new(QueueState {
                slots: BTreeMap::new(),
                free_list: VecDeque::new(),
                dirty_list: VecDeque::new(),
                deleting_list: Vec::new(),
                deleted: Vec::new(),
                queue_size: builder.queue_size,
                pending_allocs: 0,
                status: true,
                blocking: builder.blocking,
                priority_alloc: builder.priority_alloc,
                source_type: builder.source_type,
                transform: TransformType::default(),
                default_width: builder.default_width,
                default_height: builder.default_height,
                default_usage: builder.default_usage,
                tunnel_handle: None,
                last_flushed: None,
                delegator: None,
                delete_listeners: Vec::new(),
                consumer_listener: None,
                lpp_ring: None,
                lpp_cache: BTreeMap::new(),
                is_rs_draw_lpp: false,
                is_shb_draw_lpp: true,
            }),
            free_cond: Condvar::new(),
            dirty_cond: Condvar::new(),
            allocator,
            sequences,
            telemetry,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    /// Release the lock and then run deferred notifications.
    fn finish(&self, mut state: MutexGuard<'_, QueueState>) {
        let deferred = state.take_deferred();
        drop(state);
        deferred.run(&self.name);
    }

    /// Block on `free_cond` until woken or `deadline` passes.
    /// Returns false when the wait cannot (or can no longer) be made.
    fn wait_for_free(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        deadline: Option<Instant>,
    ) -> bool {
        if !state.blocking {
            return false;
        }
        match deadline {
            Some(deadline) => {
                if Instant::now() >= deadline {
                    return false;
                }
                self.free_cond.wait_until(state, deadline);
            }
            None => self.free_cond.wait(state),
        }
        true
    }

    /// Give back a handle the queue allocated but will not keep.
    fn discard_handle(&self, handle: BufferHandle) {
        self.allocator.free(&handle);
    }

    /// Allocate a buffer for `config` into a new slot in the `Requested` state.
    ///
    /// `replacing` names a free slot whose stale buffer the new one replaces;
    /// it is reserved during allocation and destroyed only on success.
    fn allocate_slot(
        &self,
        state: &mut MutexGuard<'_, QueueState>,
        config: &RequestConfig,
        replacing: Option<u32>,
    ) -> GSResult<u32> {
        let free_pos = match replacing {
            Some(seq) => {
                let pos = state.free_list.iter().position(|s| *s == seq);
                state.free_list.retain(|s| *s != seq);
                if let Some(slot) = state.slots.get_mut(&seq) {
                    slot.state = SlotState::Requested;
                }
                pos
            }
            None => {
                state.pending_allocs += 1;
                None
            }
        };

        let allocated = MutexGuard::unlocked(state, || self.allocator.allocate(config));

        // Undo the reservation; the queue may have changed while unlocked.
        match replacing {
            Some(seq) => {
                let restore = allocated.is_err() || !state.status;
                if restore {
                    match state.slots.get(&seq).map(|s| s.is_deleting) {
                        Some(true) => state.delete_slot(seq),
                        Some(false) => {
                            if let Some(slot) = state.slots.get_mut(&seq) {
                                slot.state = SlotState::Free;
                            }
                            let pos = free_pos.unwrap_or(0).min(state.free_list.len());
                            state.free_list.insert(pos, seq);
                        }
                        None => {}
                    }
                } else {
                    state.delete_slot(seq);
                }
            }
            None => state.pending_allocs -= 1,
        }

        let handle = allocated.map_err(|e| {
            log::error!("[{}] buffer allocation failed: {e}", self.name);
            e
        })?;
        if !state.status {
            self.discard_handle(handle);
            return Err(GSError::NoConsumer);
        }

        let Some(seq) = self
            .sequences
            .next_unused(|seq| state.slots.contains_key(&seq))
        else {
            self.discard_handle(handle);
            return Err(GSError::Unknown("sequence space exhausted".into()));
        };
        let buffer = SurfaceBuffer::new(seq, handle, config.clone(), Some(Arc::clone(&self.allocator)));
        // If capacity shrank meanwhile, the slot is destroyed when it comes back.
        state
            .slots
            .insert(seq, Slot::new(buffer, config.clone(), SlotState::Requested));
        log::debug!(
            "[{}] allocated seq {seq} ({}x{} {:?})",
            self.name,
            config.width,
            config.height,
            config.format
        );
        Ok(seq)
    }

    // -----------------------------------------------------------------------
    // Producer side
    // -----------------------------------------------------------------------

    /// Hand a free buffer to the producer, allocating or blocking as needed.
    pub fn request_buffer(
        &self,
        config: &RequestConfig,
        extra: &ExtraData,
    ) -> GSResult<RequestBufferReturn> {
        config.validate()?;
        extra.validate()?;

        let deadline = config.timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        let seq = loop {
            if !state.status {
                log::warn!("[{}] request_buffer: queue disabled", self.name);
                return Err(GSError::NoConsumer);
            }
            match state.select_slot(config) {
                Selection::Reuse(seq) => {
                    state.free_list.retain(|s| *s != seq);
                    let slot = state.slot_mut(seq)?;
                    slot.state = SlotState::Requested;
                    slot.config = config.clone();
                    break seq;
                }
                Selection::Grow => match self.allocate_slot(&mut state, config, None) {
                    Ok(seq) => break seq,
                    Err(e) => {
                        self.finish(state);
                        return Err(e);
                    }
                },
                Selection::Realloc(stale) => {
                    match self.allocate_slot(&mut state, config, Some(stale)) {
                        Ok(seq) => break seq,
                        Err(e) => {
                            self.finish(state);
                            return Err(e);
                        }
                    }
                }
                Selection::Full => {
                    if !self.wait_for_free(&mut state, deadline) {
                        log::debug!("[{}] request_buffer: no free slot", self.name);
                        return Err(GSError::NoBuffer);
                    }
                }
            }
        };

        let is_lpp = state.is_lpp();
        let slot = state.slot_mut(seq)?;
        let buffer = if slot.transferred {
            None
        } else {
            slot.transferred = true;
            Some(Arc::clone(&slot.buffer))
        };
        let fence = slot.take_release_fence();
        slot.buffer.set_extra_data(extra.clone());
        let shared = Arc::clone(&slot.buffer);
        if is_lpp {
            state.lpp_cache.insert(seq, shared);
        }
        let deleting_buffers = state.take_deleting_list();
        let delegator = state.delegator.clone();
        log::debug!(
            "[{}] request_buffer: seq {seq}, used {}/{}",
            self.name,
            state.used_size(),
            state.queue_size
        );
        self.finish(state);

        if let Some(delegator) = delegator {
            notify_delegator(&self.name, "dequeue", || delegator.on_dequeue(seq));
        }

        Ok(RequestBufferReturn {
            sequence: seq,
            buffer,
            fence,
            deleting_buffers,
        })
    }

    /// Return a requested buffer unused.
    pub fn cancel_buffer(&self, seq: u32, extra: &ExtraData) -> GSResult<()> {
        extra.validate()?;
        let mut state = self.state.lock();
        let slot = state.slot_mut(seq)?;
        if !slot.state.is_producer_held() {
            log::warn!(
                "[{}] cancel_buffer: seq {seq} is {:?}",
                self.name,
                slot.state
            );
            return Err(GSError::InvalidOperating(format!(
                "cancel of seq {seq} in state {:?}",
                slot.state
            )));
        }
        slot.buffer.set_extra_data(extra.clone());
        state.return_to_free(seq);
        self.free_cond.notify_all();
        log::debug!("[{}] cancel_buffer: seq {seq}", self.name);
        self.finish(state);
        Ok(())
    }

    fn check_flushable(&self, state: &QueueState, seq: u32) -> GSResult<()> {
        if !state.status {
            return Err(GSError::NoConsumer);
        }
        let slot = state.slot(seq)?;
        if !slot.state.is_producer_held() {
            log::warn!("[{}] flush_buffer: seq {seq} is {:?}", self.name, slot.state);
            return Err(GSError::InvalidOperating(format!(
                "flush of seq {seq} in state {:?}",
                slot.state
            )));
        }
        Ok(())
    }

    /// Submit a filled buffer to the consumer.
    pub fn flush_buffer(
        &self,
        seq: u32,
        extra: &ExtraData,
        fence: Fence,
        flush_config: &FlushConfig,
    ) -> GSResult<()> {
        flush_config.validate()?;
        extra.validate()?;

        let mut state = self.state.lock();
        self.check_flushable(&state, seq)?;
        let delegator = state.delegator.clone();

        let now = monotonic_now_ns();
        let timestamp = if flush_config.timestamp != 0 {
            flush_config.timestamp
        } else {
            now
        };

        if state.is_lpp() && state.lpp_ring.is_some() {
            let write_done = fence.clone();
            self.flush_to_lpp(state, seq, fence, flush_config, timestamp)?;
            if let Some(delegator) = delegator {
                notify_delegator(&self.name, "queue", || delegator.on_queue(seq, &write_done));
            }
            return Ok(());
        }

        let slot = state.slot_mut(seq)?;
        let full = Rect {
            x: 0,
            y: 0,
            w: slot.buffer.width(),
            h: slot.buffer.height(),
        };
        slot.damages = if flush_config.damages.is_empty() {
            vec![full]
        } else {
            flush_config.damages.clone()
        };
        slot.acquire_fence = fence.clone();
        slot.timestamp = timestamp;
        if flush_config.desired_present_timestamp > 0 {
            slot.desired_present_timestamp = flush_config.desired_present_timestamp;
            slot.is_auto_timestamp = false;
        } else {
            slot.desired_present_timestamp = now;
            slot.is_auto_timestamp = true;
        }
        slot.state = SlotState::Dirty;
        slot.buffer.set_extra_data(extra.clone());

        state.dirty_list.push_back(seq);
        state.last_flushed = Some(seq);
        let listener = state.consumer_listener.clone();
        let dirty = state.dirty_list.len();
        self.dirty_cond.notify_all();
        drop(state);

        log::debug!("[{}] flush_buffer: seq {seq}, {dirty} dirty", self.name);
        if let Some(delegator) = delegator {
            notify_delegator(&self.name, "queue", || delegator.on_queue(seq, &fence));
        }
        if let Some(listener) = listener {
            listener.on_buffer_available();
        }
        self.telemetry.on_flush(&self.name, seq, timestamp);
        Ok(())
    }

    /// Flush absorbed by the low-power ring: publish the frame and return the
    /// slot to the free list.
    fn flush_to_lpp(
        &self,
        mut state: MutexGuard<'_, QueueState>,
        seq: u32,
        fence: Fence,
        flush_config: &FlushConfig,
        timestamp: i64,
    ) -> GSResult<()> {
        let slot = state.slot(seq)?;
        let crop = flush_config.damages.first().copied().unwrap_or(Rect {
            x: 0,
            y: 0,
            w: slot.buffer.width(),
            h: slot.buffer.height(),
        });
        let buffer = Arc::clone(&slot.buffer);
        let entry = LppSlotEntry {
            seq_id: seq,
            reserved: 0,
            timestamp,
            crop: [crop.x, crop.y, crop.w, crop.h],
        };
        let write = match state.lpp_ring.as_ref() {
            Some(ring) => ring.publish(entry)?,
            None => return Err(GSError::NoBuffer),
        };
        state.lpp_cache.insert(seq, buffer);
        if let Some(slot) = state.slots.get_mut(&seq) {
            // The next writer must wait for this frame's producer fence.
            slot.merge_release_fence(&fence);
            slot.timestamp = timestamp;
        }
        state.return_to_free(seq);
        self.free_cond.notify_all();
        log::debug!("[{}] flush_buffer: seq {seq} published to lpp ring at {write}", self.name);
        self.finish(state);
        self.telemetry.on_flush(&self.name, seq, timestamp);
        Ok(())
    }

    fn attach_inner(
        &self,
        buffer: Arc<SurfaceBuffer>,
        owner: BufferOwner,
        timeout: Option<Duration>,
    ) -> GSResult<()> {
        buffer.request_config().validate()?;
        let seq = buffer.seq_num();
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();

        loop {
            if !state.status {
                return Err(GSError::NoConsumer);
            }
            if state.slots.contains_key(&seq) {
                return Err(GSError::InvalidOperating(format!("seq {seq} already attached")));
            }
            if state.used_size() < state.queue_size {
                break;
            }
            if let Some(evict) = state.free_list.front().copied() {
                log::debug!("[{}] attach_buffer: evicting free seq {evict}", self.name);
                state.delete_slot(evict);
                break;
            }
            if !self.wait_for_free(&mut state, deadline) {
                return Err(GSError::NoBuffer);
            }
        }

        let slot_state = match owner {
            BufferOwner::Producer => SlotState::Attached,
            BufferOwner::Consumer => SlotState::Acquired,
        };
        let mut slot = Slot::new(Arc::clone(&buffer), buffer.request_config().clone(), slot_state);
        slot.transferred = owner == BufferOwner::Producer;
        state.slots.insert(seq, slot);
        if state.is_lpp() {
            state.lpp_cache.insert(seq, buffer);
        }
        log::debug!("[{}] attach_buffer: seq {seq} as {slot_state:?}", self.name);
        self.finish(state);
        Ok(())
    }

    /// Inject an externally allocated buffer as producer-held, waiting up to
    /// `timeout` for capacity (`None` waits indefinitely).
    pub fn attach_buffer(&self, buffer: Arc<SurfaceBuffer>, timeout: Option<Duration>) -> GSResult<()> {
        self.attach_inner(buffer, BufferOwner::Producer, timeout)
    }

    /// Inject a buffer on behalf of either endpoint without blocking.
    /// A consumer-side attach lands in the `Acquired` state.
    pub fn attach_buffer_to_queue(&self, buffer: Arc<SurfaceBuffer>, owner: BufferOwner) -> GSResult<()> {
        self.attach_inner(buffer, owner, Some(Duration::ZERO))
    }

    fn detach_inner(&self, seq: u32, owner: BufferOwner, identity: Option<&SurfaceBuffer>) -> GSResult<()> {
        let mut state = self.state.lock();
        let slot = state.slot(seq)?;
        if let Some(buffer) = identity {
            if !std::ptr::eq(Arc::as_ptr(&slot.buffer), buffer) {
                return Err(GSError::InvalidArguments(format!("seq {seq} is a different buffer")));
            }
        }
        let allowed = match owner {
            BufferOwner::Producer => slot.state.is_producer_held(),
            BufferOwner::Consumer => slot.state == SlotState::Acquired,
        };
        if !allowed {
            return Err(GSError::InvalidOperating(format!(
                "detach of seq {seq} in state {:?}",
                slot.state
            )));
        }
        state.slots.remove(&seq);
        state.lpp_cache.remove(&seq);
        if state.last_flushed == Some(seq) {
            state.last_flushed = None;
        }
        let delegator = state.delegator.clone();
        self.free_cond.notify_all();
        log::debug!("[{}] detach_buffer: seq {seq}", self.name);
        self.finish(state);
        if let Some(delegator) = delegator {
            notify_delegator(&self.name, "clear slot", || delegator.on_clear_slot(seq));
        }
        Ok(())
    }

    /// Withdraw a producer-held buffer from the queue; the caller keeps it.
    pub fn detach_buffer(&self, buffer: &SurfaceBuffer) -> GSResult<()> {
        self.detach_inner(buffer.seq_num(), BufferOwner::Producer, Some(buffer))
    }

    pub fn detach_buffer_from_queue(&self, seq: u32, owner: BufferOwner) -> GSResult<()> {
        self.detach_inner(seq, owner, None)
    }

    /// Allocate up to `count` free buffers for `config` ahead of time.
    /// Returns how many were added; fewer than `count` when capacity runs out.
    pub fn pre_alloc_buffers(&self, config: &RequestConfig, count: u32) -> GSResult<u32> {
        config.validate()?;
        if count == 0 || count > MAX_QUEUE_SIZE {
            return Err(GSError::InvalidArguments(format!("pre-alloc count {count}")));
        }

        let mut state = self.state.lock();
        if !state.status {
            return Err(GSError::NoConsumer);
        }
        let room = state.queue_size.saturating_sub(state.used_size());
        let wanted = count.min(room);
        if wanted == 0 {
            return Ok(0);
        }

        state.pending_allocs += wanted;
        let results: Vec<GSResult<_>> = MutexGuard::unlocked(&mut state, || {
            let mut out = Vec::with_capacity(wanted as usize);
            for _ in 0..wanted {
                let r = self.allocator.allocate(config);
                let failed = r.is_err();
                out.push(r);
                if failed {
                    break;
                }
            }
            out
        });
        state.pending_allocs -= wanted;

        let mut added = 0;
        let mut failure = None;
        for result in results {
            let handle = match result {
                Ok(handle) => handle,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            if !state.status || state.used_size() >= state.queue_size {
                self.discard_handle(handle);
                continue;
            }
            let Some(seq) = self.sequences.next_unused(|seq| state.slots.contains_key(&seq)) else {
                self.discard_handle(handle);
                continue;
            };
            let buffer = SurfaceBuffer::new(seq, handle, config.clone(), Some(Arc::clone(&self.allocator)));
            let mut slot = Slot::new(buffer, config.clone(), SlotState::Free);
            slot.is_preallocated = true;
            state.slots.insert(seq, slot);
            state.free_list.push_back(seq);
            added += 1;
        }
        if added > 0 {
            self.free_cond.notify_all();
        }
        log::info!("[{}] pre-allocated {added}/{count} buffers", self.name);
        let status = state.status;
        drop(state);

        match failure {
            _ if !status => Err(GSError::NoConsumer),
            Some(e) if added == 0 => Err(e),
            _ => Ok(added),
        }
    }

    /// Change the capacity. Shrinking destroys idle buffers now; in-flight
    /// ones are destroyed as they come back until the queue fits again.
    pub fn set_queue_size(&self, size: u32) -> GSResult<()> {
        if size == 0 || size > MAX_QUEUE_SIZE {
            return Err(GSError::InvalidArguments(format!("queue size {size}")));
        }
        let mut state = self.state.lock();
        let old = state.queue_size;
        state.queue_size = size;

        let mut excess = (state.slots.len() as u32).saturating_sub(size);
        while excess > 0 {
            match state.free_list.front().copied() {
                Some(seq) => {
                    state.delete_slot(seq);
                    excess -= 1;
                }
                None => break,
            }
        }
        if size > old {
            self.free_cond.notify_all();
        }
        log::info!("[{}] queue size {old} -> {size}", self.name);
        self.finish(state);
        Ok(())
    }

    pub fn get_queue_size(&self) -> u32 {
        self.state.lock().queue_size
    }

    /// Buffers currently allocated (including ones marked for deletion).
    pub fn get_used_size(&self) -> u32 {
        self.state.lock().used_size()
    }

    // -----------------------------------------------------------------------
    // Consumer side
    // -----------------------------------------------------------------------

    fn acquire_head(&self, state: &mut QueueState) -> GSResult<AcquireBufferReturn> {
        let seq = state.dirty_list.pop_front().ok_or(GSError::NoBuffer)?;
        let slot = state.slot_mut(seq)?;
        slot.state = SlotState::Acquired;
        Ok(AcquireBufferReturn {
            buffer: Arc::clone(&slot.buffer),
            fence: slot.acquire_fence.clone(),
            timestamp: slot.timestamp,
            damages: slot.damages.clone(),
            desired_present_timestamp: slot.desired_present_timestamp,
            is_auto_timestamp: slot.is_auto_timestamp,
        })
    }

    /// Take the oldest flushed buffer. Never blocks.
    pub fn acquire_buffer(&self) -> GSResult<AcquireBufferReturn> {
        let mut state = self.state.lock();
        let acquired = self.acquire_head(&mut state)?;
        drop(state);
        let seq = acquired.buffer.seq_num();
        log::debug!("[{}] acquire_buffer: seq {seq}", self.name);
        self.telemetry.on_acquire(&self.name, seq);
        Ok(acquired)
    }

    /// Acquire the frame to show at `expect_present_ts`.
    ///
    /// Older frames are dropped while a newer one is already due. Fails with
    /// `NoBufferReady` (queue untouched) if the candidate frame wants to be
    /// shown more than a second after `expect_present_ts`.
    pub fn acquire_buffer_for_present(&self, expect_present_ts: i64) -> GSResult<AcquireBufferReturn> {
        let mut state = self.state.lock();
        if state.dirty_list.is_empty() {
            return Err(GSError::NoBuffer);
        }

        let due = |slot: &Slot| slot.is_auto_timestamp || slot.desired_present_timestamp <= expect_present_ts;
        let mut drop_count = 0;
        while drop_count + 1 < state.dirty_list.len() {
            let next = state.dirty_list[drop_count + 1];
            match state.slots.get(&next) {
                Some(slot) if due(slot) => drop_count += 1,
                _ => break,
            }
        }

        let candidate = state.slot(state.dirty_list[drop_count])?;
        if !candidate.is_auto_timestamp
            && candidate.desired_present_timestamp > expect_present_ts.saturating_add(PRESENT_LOOKAHEAD_NS)
        {
            return Err(GSError::NoBufferReady);
        }

        for _ in 0..drop_count {
            if let Some(seq) = state.dirty_list.pop_front() {
                log::debug!("[{}] dropping late frame seq {seq}", self.name);
                // Nobody waited on the producer fence; the next writer must.
                if let Some(slot) = state.slots.get_mut(&seq) {
                    let written = slot.acquire_fence.clone();
                    slot.merge_release_fence(&written);
                }
                state.return_to_free(seq);
            }
        }
        if drop_count > 0 {
            self.free_cond.notify_all();
        }
        let acquired = self.acquire_head(&mut state)?;
        self.finish(state);
        self.telemetry.on_acquire(&self.name, acquired.buffer.seq_num());
        Ok(acquired)
    }

    /// Wait until a flushed buffer is available. Returns false on timeout or
    /// when the queue is disabled first.
    pub fn wait_for_dirty(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        while state.dirty_list.is_empty() {
            if !state.status {
                return false;
            }
            match deadline {
                Some(deadline) => {
                    if self.dirty_cond.wait_until(&mut state, deadline).timed_out() {
                        return !state.dirty_list.is_empty();
                    }
                }
                None => self.dirty_cond.wait(&mut state),
            }
        }
        true
    }

    /// Give an acquired buffer back. `fence` signals when the consumer is done reading.
    pub fn release_buffer(&self, buffer: &SurfaceBuffer, fence: Fence) -> GSResult<()> {
        let seq = buffer.seq_num();
        let mut state = self.state.lock();
        let slot = state.slot_mut(seq)?;
        if !std::ptr::eq(Arc::as_ptr(&slot.buffer), buffer) {
            return Err(GSError::InvalidArguments(format!("seq {seq} is a different buffer")));
        }
        if slot.state != SlotState::Acquired {
            log::warn!("[{}] release_buffer: seq {seq} is {:?}", self.name, slot.state);
            return Err(GSError::InvalidOperating(format!(
                "release of seq {seq} in state {:?}",
                slot.state
            )));
        }
        slot.merge_release_fence(&fence);
        state.return_to_free(seq);
        let delegator = state.delegator.clone();
        self.free_cond.notify_all();
        log::debug!("[{}] release_buffer: seq {seq}", self.name);
        self.finish(state);

        if let Some(delegator) = delegator {
            notify_delegator(&self.name, "release", || delegator.on_release(seq, &fence));
        }
        Ok(())
    }

    /// True if a request could be served right now without blocking.
    pub fn query_if_buffer_available(&self) -> bool {
        let state = self.state.lock();
        state.status && (!state.free_list.is_empty() || state.used_size() < state.queue_size)
    }

    /// Destroy every idle (free or flushed) buffer and report their sequences.
    /// With `destroy_in_flight`, buffers held by either endpoint are destroyed
    /// when they come back.
    pub fn clean_cache(&self, destroy_in_flight: bool) -> GSResult<Vec<u32>> {
        let mut state = self.state.lock();
        let idle: Vec<u32> = state
            .slots
            .iter()
            .filter(|(_, s)| matches!(s.state, SlotState::Free | SlotState::Dirty))
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &idle {
            state.delete_slot(*seq);
        }
        if destroy_in_flight {
            for slot in state.slots.values_mut() {
                slot.is_deleting = true;
            }
        }
        self.free_cond.notify_all();
        log::info!("[{}] clean_cache: removed {} buffers", self.name, idle.len());
        self.finish(state);
        Ok(idle)
    }

    /// Enable or disable the queue. Disabling wakes every blocked requester,
    /// which then fails with `NoConsumer`.
    pub fn set_status(&self, status: bool) {
        let mut state = self.state.lock();
        state.status = status;
        if !status {
            self.free_cond.notify_all();
            self.dirty_cond.notify_all();
        }
        log::info!("[{}] status -> {status}", self.name);
    }

    pub fn get_status(&self) -> bool {
        self.state.lock().status
    }

    /// Consumer went away: disable, drop the listener and destroy all buffers.
    pub fn on_consumer_died(&self) {
        {
            let mut state = self.state.lock();
            state.consumer_listener = None;
        }
        self.set_status(false);
        if let Err(e) = self.clean_cache(true) {
            log::warn!("[{}] clean_cache after consumer death failed: {e}", self.name);
        }
    }

    pub fn set_blocking(&self, blocking: bool) {
        self.state.lock().blocking = blocking;
        if !blocking {
            self.free_cond.notify_all();
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.state.lock().blocking
    }

    pub fn set_priority_alloc(&self, enabled: bool) {
        self.state.lock().priority_alloc = enabled;
    }

    // -----------------------------------------------------------------------
    // Collaborators
    // -----------------------------------------------------------------------

    pub fn register_surface_delegator(&self, delegator: Arc<dyn SurfaceDelegator>) {
        self.state.lock().delegator = Some(delegator);
    }

    pub fn register_delete_buffer_listener(&self, listener: DeleteBufferListener) {
        self.state.lock().delete_listeners.push(listener);
    }

    pub fn register_consumer_listener(&self, listener: Arc<dyn ConsumerListener>) {
        self.state.lock().consumer_listener = Some(listener);
    }

    pub fn unregister_consumer_listener(&self) {
        self.state.lock().consumer_listener = None;
    }

    fn notify_property_change(&self, state: MutexGuard<'_, QueueState>) {
        let listener = state.consumer_listener.clone();
        drop(state);
        if let Some(listener) = listener {
            listener.on_property_change();
        }
    }

    // -----------------------------------------------------------------------
    // Properties and per-buffer metadata
    // -----------------------------------------------------------------------

    pub fn set_transform(&self, transform: TransformType) {
        let mut state = self.state.lock();
        if state.transform == transform {
            return;
        }
        state.transform = transform;
        self.notify_property_change(state);
    }

    pub fn get_transform(&self) -> TransformType {
        self.state.lock().transform
    }

    pub fn set_default_width_and_height(&self, width: i32, height: i32) -> GSResult<()> {
        if width <= 0 || height <= 0 {
            return Err(GSError::InvalidArguments(format!("default size {width}x{height}")));
        }
        let mut state = self.state.lock();
        state.default_width = width;
        state.default_height = height;
        Ok(())
    }

    pub fn get_default_width_and_height(&self) -> (i32, i32) {
        let state = self.state.lock();
        (state.default_width, state.default_height)
    }

    pub fn set_default_usage(&self, usage: BufferUsage) {
        self.state.lock().default_usage = usage;
    }

    pub fn get_default_usage(&self) -> BufferUsage {
        self.state.lock().default_usage
    }

    pub fn set_tunnel_handle(&self, handle: Option<TunnelHandle>) -> GSResult<()> {
        let mut state = self.state.lock();
        if state.tunnel_handle == handle {
            return Ok(());
        }
        state.tunnel_handle = handle;
        self.notify_property_change(state);
        Ok(())
    }

    pub fn get_tunnel_handle(&self) -> GSResult<TunnelHandle> {
        self.state
            .lock()
            .tunnel_handle
            .clone()
            .ok_or_else(|| GSError::NoEntry("tunnel handle".into()))
    }

    pub fn set_source_type(&self, source: SourceType) {
        let mut state = self.state.lock();
        if state.source_type == source {
            return;
        }
        if state.source_type == SourceType::LowPowerVideo {
            state.lpp_ring = None;
            state.lpp_cache.clear();
        }
        state.source_type = source;
        log::info!("[{}] source type -> {source:?}", self.name);
    }

    pub fn get_source_type(&self) -> SourceType {
        self.state.lock().source_type
    }

    pub fn set_scaling_mode(&self, seq: u32, mode: ScalingMode) -> GSResult<()> {
        self.state.lock().slot_mut(seq)?.scaling_mode = mode;
        Ok(())
    }

    pub fn get_scaling_mode(&self, seq: u32) -> GSResult<ScalingMode> {
        Ok(self.state.lock().slot(seq)?.scaling_mode)
    }

    pub fn set_metadata(&self, seq: u32, metadata: Vec<HdrMetaData>) -> GSResult<()> {
        if metadata.is_empty() {
            return Err(GSError::InvalidArguments("empty HDR metadata".into()));
        }
        let mut state = self.state.lock();
        let slot = state.slot_mut(seq)?;
        slot.hdr_metadata = metadata;
        slot.hdr_metadata_set = None;
        Ok(())
    }

    pub fn set_metadata_set(&self, seq: u32, key: u32, blob: Vec<u8>) -> GSResult<()> {
        if blob.is_empty() {
            return Err(GSError::InvalidArguments("empty HDR metadata set".into()));
        }
        if blob.len() > MAX_METADATA_SET_SIZE {
            return Err(GSError::OutOfRange(format!("HDR metadata set of {} bytes", blob.len())));
        }
        let mut state = self.state.lock();
        let slot = state.slot_mut(seq)?;
        slot.hdr_metadata_set = Some((key, blob));
        slot.hdr_metadata.clear();
        Ok(())
    }

    pub fn query_metadata_type(&self, seq: u32) -> GSResult<HdrMetadataType> {
        Ok(self.state.lock().slot(seq)?.metadata_type())
    }

    pub fn get_metadata(&self, seq: u32) -> GSResult<Vec<HdrMetaData>> {
        let state = self.state.lock();
        let slot = state.slot(seq)?;
        if slot.hdr_metadata.is_empty() {
            return Err(GSError::NoEntry(format!("HDR metadata of seq {seq}")));
        }
        Ok(slot.hdr_metadata.clone())
    }

    pub fn get_metadata_set(&self, seq: u32) -> GSResult<(u32, Vec<u8>)> {
        let state = self.state.lock();
        state
            .slot(seq)?
            .hdr_metadata_set
            .clone()
            .ok_or_else(|| GSError::NoEntry(format!("HDR metadata set of seq {seq}")))
    }

    pub fn set_present_timestamp(&self, seq: u32, timestamp: PresentTimestamp) -> GSResult<()> {
        if timestamp.kind == PresentTimestampType::Unsupported {
            return Err(GSError::InvalidArguments("unsupported present timestamp type".into()));
        }
        self.state.lock().slot_mut(seq)?.present_timestamp = Some(timestamp);
        Ok(())
    }

    pub fn get_present_timestamp(&self, seq: u32, kind: PresentTimestampType) -> GSResult<i64> {
        if kind == PresentTimestampType::Unsupported {
            return Err(GSError::InvalidArguments("unsupported present timestamp type".into()));
        }
        let state = self.state.lock();
        match state.slot(seq)?.present_timestamp {
            Some(ts) if ts.kind == kind => Ok(ts.time),
            _ => Err(GSError::NoEntry(format!("present timestamp of seq {seq}"))),
        }
    }

    pub fn set_ui_timestamp(&self, seq: u32, timestamp: u64) -> GSResult<()> {
        self.state.lock().slot_mut(seq)?.ui_timestamp = timestamp;
        Ok(())
    }

    pub fn get_ui_timestamp(&self, seq: u32) -> GSResult<u64> {
        Ok(self.state.lock().slot(seq)?.ui_timestamp)
    }

    /// Most recently flushed buffer and its producer fence.
    pub fn get_last_flushed_buffer(&self) -> GSResult<(Arc<SurfaceBuffer>, Fence)> {
        let state = self.state.lock();
        let seq = state
            .last_flushed
            .ok_or_else(|| GSError::NoEntry("no flushed buffer".into()))?;
        let slot = state.slot(seq)?;
        Ok((Arc::clone(&slot.buffer), slot.acquire_fence.clone()))
    }

    /// State of a slot, for diagnostics.
    pub fn slot_state(&self, seq: u32) -> GSResult<SlotState> {
        Ok(self.state.lock().slot(seq)?.state)
    }

    pub(crate) fn cached_buffer(&self, seq: u32) -> GSResult<Arc<SurfaceBuffer>> {
        Ok(Arc::clone(&self.state.lock().slot(seq)?.buffer))
    }

    pub fn sequences(&self) -> &Arc<SequenceGenerator> {
        &self.sequences
    }

    // -----------------------------------------------------------------------
    // Low-power path
    // -----------------------------------------------------------------------

    /// Bind (`bind == true`) or unbind the shared region backing the LPP ring.
    /// Unbinding unmaps the region and closes its descriptor.
    pub fn set_lpp_share_fd(&self, handle: Option<OwnedHandle>, bind: bool) -> GSResult<()> {
        let mut state = self.state.lock();
        if !bind {
            let had = state.lpp_ring.take().is_some();
            drop(handle);
            log::info!("[{}] lpp ring unbound (was bound: {had})", self.name);
            return Ok(());
        }
        if !state.is_lpp() {
            return Err(GSError::InvalidOperating(format!(
                "lpp ring on {:?} source",
                state.source_type
            )));
        }
        let handle = match handle {
            Some(h) if h.is_valid() => h,
            _ => return Err(GSError::InvalidArguments("invalid lpp share fd".into())),
        };
        let ring = LppRing::bind(handle).map_err(|e| {
            log::error!("[{}] binding lpp ring failed: {e}", self.name);
            GSError::InvalidArguments(format!("lpp share fd: {e}"))
        })?;
        ring.set_stop_shb_draw(!state.is_shb_draw_lpp);
        state.lpp_ring = Some(ring);
        log::info!("[{}] lpp ring bound", self.name);
        Ok(())
    }

    /// Latest frame published on the LPP ring.
    pub fn acquire_lpp_buffer(&self) -> GSResult<LppAcquired> {
        let mut state = self.state.lock();
        if !state.is_lpp() {
            return Err(GSError::InvalidOperating("not a low-power video source".into()));
        }
        let is_rs_draw = state.is_rs_draw_lpp;
        let QueueState {
            lpp_ring, lpp_cache, ..
        } = &mut *state;
        let ring = lpp_ring.as_mut().ok_or(GSError::NoBuffer)?;
        let frame = ring.peek_latest()?;
        let buffer = match lpp_cache.get(&frame.entry.seq_id) {
            Some(buffer) => Arc::clone(buffer),
            None => {
                log::warn!(
                    "[{}] lpp ring names unregistered seq {}",
                    self.name,
                    frame.entry.seq_id
                );
                return Err(GSError::NoBuffer);
            }
        };
        ring.mark_read(&frame);
        if is_rs_draw {
            ring.consume_to(frame.write_offset);
        }
        let [x, y, w, h] = frame.entry.crop;
        Ok(LppAcquired {
            buffer,
            timestamp: frame.entry.timestamp,
            crop: Rect { x, y, w, h },
            skipped: frame.skipped,
        })
    }

    /// Hardware-path acknowledgement: everything written so far is consumed.
    pub fn flush_lpp_buffer(&self) -> GSResult<()> {
        let state = self.state.lock();
        let ring = state.lpp_ring.as_ref().ok_or(GSError::NoBuffer)?;
        if state.is_rs_draw_lpp {
            return Err(GSError::InvalidOperating("compositor drives the lpp ring".into()));
        }
        let (_, write) = ring.checked_offsets()?;
        ring.consume_to(write);
        Ok(())
    }

    /// Choose who draws LPP frames: the hardware path (`is_shb_draw`) and/or
    /// the compositor (`is_rs_draw`, which then advances the read offset).
    pub fn set_lpp_draw_source(&self, is_shb_draw: bool, is_rs_draw: bool) {
        let mut state = self.state.lock();
        state.is_shb_draw_lpp = is_shb_draw;
        state.is_rs_draw_lpp = is_rs_draw;
        if let Some(ring) = state.lpp_ring.as_ref() {
            ring.set_stop_shb_draw(!is_shb_draw);
        }
    }

    pub fn lpp_frame_rate(&self) -> GSResult<i32> {
        let state = self.state.lock();
        state
            .lpp_ring
            .as_ref()
            .map(LppRing::frame_rate)
            .ok_or_else(|| GSError::NoEntry("lpp ring".into()))
    }
}

impl Drop for BufferQueue {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.status = false;
        let all: Vec<u32> = state.slots.keys().copied().collect();
        for seq in all {
            state.delete_slot(seq);
        }
        state.lpp_ring = None;
        state.lpp_cache.clear();
        self.finish(state);
    }
}
