// Collaborators notified by the queue. All of them are invoked with the queue
// lock released; their failures are logged and never fail the queue operation.

use crate::Core::fence::Fence;
use crate::error::GSResult;
use std::sync::Arc;

/// Mirrors queue lifecycle events to a secondary process.
pub trait SurfaceDelegator: Send + Sync {
    fn on_dequeue(&self, seq: u32) -> GSResult<()>;
    fn on_queue(&self, seq: u32, fence: &Fence) -> GSResult<()>;
    fn on_release(&self, seq: u32, fence: &Fence) -> GSResult<()>;
    fn on_clear_slot(&self, seq: u32) -> GSResult<()>;
}

/// Consumer-side notification that a flushed buffer is waiting.
pub trait ConsumerListener: Send + Sync {
    fn on_buffer_available(&self);

    /// Queue properties (transform, tunnel handle, ...) changed.
    fn on_property_change(&self) {}
}

/// Called with the sequence of every buffer about to be destroyed, before its
/// native resources are released.
pub type DeleteBufferListener = Arc<dyn Fn(u32) + Send + Sync>;

/// Optional frame-report capability. Absence is the no-op implementation.
pub trait TelemetrySink: Send + Sync {
    fn on_flush(&self, queue_name: &str, seq: u32, timestamp: i64);

    fn on_acquire(&self, _queue_name: &str, _seq: u32) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTelemetry;

impl TelemetrySink for NoopTelemetry {
    fn on_flush(&self, _queue_name: &str, _seq: u32, _timestamp: i64) {}
}

/// Run a delegator callback, logging instead of propagating failure.
pub(crate) fn notify_delegator<F>(queue_name: &str, event: &str, f: F)
where
    F: FnOnce() -> GSResult<()>,
{
    if let Err(e) = f() {
        log::warn!("[{queue_name}] delegator {event} failed: {e}");
    }
}
