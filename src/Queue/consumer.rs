use super::buffer_queue::{AcquireBufferReturn, BufferQueue, LppAcquired};
use super::delegate::ConsumerListener;
use super::Buffer::SurfaceBuffer;
use crate::Core::fence::Fence;
use crate::Core::handle::OwnedHandle;
use crate::error::{GSError, GSResult};
use std::sync::Arc;
use std::time::Duration;

/// Consumer endpoint of a queue.
///
/// Dropping the consumer counts as the consumer dying: the queue is disabled,
/// blocked producers fail with `NoConsumer` and every buffer is destroyed once
/// it is no longer in flight.
pub struct Consumer {
    queue: Arc<BufferQueue>,
}

impl Consumer {
    pub fn new(queue: Arc<BufferQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }

    /// Take the oldest flushed buffer if there is one.
    pub fn acquire_buffer(&self) -> GSResult<AcquireBufferReturn> {
        self.queue.acquire_buffer()
    }

    /// Wait up to `timeout` (`None` forever) for a flushed buffer.
    pub fn acquire_timeout(&self, timeout: Option<Duration>) -> GSResult<AcquireBufferReturn> {
        if !self.queue.wait_for_dirty(timeout) {
            if !self.queue.get_status() {
                return Err(GSError::NoConsumer);
            }
            return Err(GSError::NoBuffer);
        }
        self.queue.acquire_buffer()
    }

    pub fn acquire_buffer_for_present(&self, expect_present_ts: i64) -> GSResult<AcquireBufferReturn> {
        self.queue.acquire_buffer_for_present(expect_present_ts)
    }

    pub fn release_buffer(&self, buffer: &SurfaceBuffer, fence: Fence) -> GSResult<()> {
        self.queue.release_buffer(buffer, fence)
    }

    pub fn register_listener(&self, listener: Arc<dyn ConsumerListener>) {
        self.queue.register_consumer_listener(listener);
    }

    pub fn unregister_listener(&self) {
        self.queue.unregister_consumer_listener();
    }

    pub fn set_lpp_share_fd(&self, handle: Option<OwnedHandle>, bind: bool) -> GSResult<()> {
        self.queue.set_lpp_share_fd(handle, bind)
    }

    pub fn acquire_lpp_buffer(&self) -> GSResult<LppAcquired> {
        self.queue.acquire_lpp_buffer()
    }

    pub fn flush_lpp_buffer(&self) -> GSResult<()> {
        self.queue.flush_lpp_buffer()
    }

    pub fn set_lpp_draw_source(&self, is_shb_draw: bool, is_rs_draw: bool) {
        self.queue.set_lpp_draw_source(is_shb_draw, is_rs_draw);
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        log::info!("[{}] consumer dropped", self.queue.name());
        self.queue.on_consumer_died();
    }
}
