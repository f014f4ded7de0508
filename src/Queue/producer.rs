use super::buffer_queue::{BufferQueue, RequestBufferReturn};
use super::Buffer::SurfaceBuffer;
use super::Structs::Buffer_Structs::{ExtraData, FlushConfig, RequestConfig};
use crate::Core::fence::Fence;
use crate::error::{GSError, GSResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Producer endpoint of a queue.
///
/// Keeps every buffer it has been handed keyed by sequence, so requests that
/// reuse a buffer the producer already holds need not carry it again. The
/// queue reports destroyed sequences with each request and they are purged
/// here.
pub struct Producer {
    queue: Arc<BufferQueue>,
    cache: Mutex<HashMap<u32, Arc<SurfaceBuffer>>>,
}

impl Producer {
    pub fn new(queue: Arc<BufferQueue>) -> Self {
        Self {
            queue,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }

    /// Request a buffer; returns it with the fence to wait on before writing.
    pub fn request_buffer(&self, config: &RequestConfig) -> GSResult<(Arc<SurfaceBuffer>, Fence)> {
        self.request_buffer_with_extra(config, &ExtraData::new())
    }

    pub fn request_buffer_with_extra(
        &self,
        config: &RequestConfig,
        extra: &ExtraData,
    ) -> GSResult<(Arc<SurfaceBuffer>, Fence)> {
        let RequestBufferReturn {
            sequence,
            buffer,
            fence,
            deleting_buffers,
        } = self.queue.request_buffer(config, extra)?;

        let mut cache = self.cache.lock();
        for seq in &deleting_buffers {
            cache.remove(seq);
        }
        let buffer = match buffer {
            Some(buffer) => {
                cache.insert(sequence, Arc::clone(&buffer));
                buffer
            }
            None => match cache.get(&sequence) {
                Some(buffer) => Arc::clone(buffer),
                None => {
                    // Handed to another endpoint of the same queue.
                    let buffer = self.queue.cached_buffer(sequence)?;
                    cache.insert(sequence, Arc::clone(&buffer));
                    buffer
                }
            },
        };
        Ok((buffer, fence))
    }

    pub fn flush_buffer(&self, buffer: &SurfaceBuffer, fence: Fence, config: &FlushConfig) -> GSResult<()> {
        self.queue
            .flush_buffer(buffer.seq_num(), &ExtraData::new(), fence, config)
    }

    pub fn flush_buffer_with_extra(
        &self,
        buffer: &SurfaceBuffer,
        extra: &ExtraData,
        fence: Fence,
        config: &FlushConfig,
    ) -> GSResult<()> {
        self.queue.flush_buffer(buffer.seq_num(), extra, fence, config)
    }

    pub fn cancel_buffer(&self, buffer: &SurfaceBuffer) -> GSResult<()> {
        self.queue.cancel_buffer(buffer.seq_num(), &ExtraData::new())
    }

    pub fn attach_buffer(&self, buffer: Arc<SurfaceBuffer>, timeout: Option<Duration>) -> GSResult<()> {
        let seq = buffer.seq_num();
        self.queue.attach_buffer(Arc::clone(&buffer), timeout)?;
        self.cache.lock().insert(seq, buffer);
        Ok(())
    }

    pub fn detach_buffer(&self, buffer: &SurfaceBuffer) -> GSResult<()> {
        self.queue.detach_buffer(buffer)?;
        self.cache.lock().remove(&buffer.seq_num());
        Ok(())
    }

    pub fn pre_alloc_buffers(&self, config: &RequestConfig, count: u32) -> GSResult<u32> {
        self.queue.pre_alloc_buffers(config, count)
    }

    pub fn set_queue_size(&self, size: u32) -> GSResult<()> {
        self.queue.set_queue_size(size)
    }

    pub fn get_queue_size(&self) -> u32 {
        self.queue.get_queue_size()
    }

    /// Destroy idle buffers on the queue and forget them locally.
    pub fn clean_cache(&self) -> GSResult<Vec<u32>> {
        let removed = self.queue.clean_cache(false)?;
        let mut cache = self.cache.lock();
        for seq in &removed {
            cache.remove(seq);
        }
        Ok(removed)
    }

    /// Buffers held in the local cache.
    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_cached(&self, seq: u32) -> bool {
        self.cache.lock().contains_key(&seq)
    }

    pub fn name(&self) -> &str {
        self.queue.name()
    }

    pub fn unique_id(&self) -> u64 {
        self.queue.unique_id()
    }

    /// Look up a cached buffer by sequence.
    pub fn buffer(&self, seq: u32) -> GSResult<Arc<SurfaceBuffer>> {
        self.cache
            .lock()
            .get(&seq)
            .cloned()
            .ok_or_else(|| GSError::NoEntry(format!("sequence {seq} not cached")))
    }
}
