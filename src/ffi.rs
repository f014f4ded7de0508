use crate::error::{GSError, GSResult, GSERROR_INVALID_ARGUMENTS, GSERROR_OK};
use crate::Core::fence::Fence;
use crate::Core::handle::OwnedHandle;
use crate::Queue::builder::BufferQueueBuilder;
use crate::Queue::Buffer::SurfaceBuffer;
use crate::Queue::Structs::Buffer_Structs::{
    BufferUsage, ExtraData, FlushConfig, PixelFormat, RequestConfig,
};
use crate::Queue::{Consumer, Producer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

/// Opaque queue handle: both endpoints plus the buffers currently handed
/// across the C boundary, keyed by sequence.
pub struct QueueHandle {
    producer: Producer,
    consumer: Consumer,
    acquired: Mutex<HashMap<u32, Arc<SurfaceBuffer>>>,
}

/// Buffer description filled in by `bq_request_buffer` / `bq_acquire_buffer`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct BqBufferInfo {
    pub sequence: u32,
    pub fd: i32,
    pub width: i32,
    pub height: i32,
    pub stride: i32,
    pub size: i32,
    pub format: i32,
    /// Fence fd to wait on, or -1. Owned by the caller.
    pub fence_fd: i32,
}

fn code_of(result: GSResult<()>) -> i32 {
    match result {
        Ok(()) => GSERROR_OK,
        Err(e) => e.code(),
    }
}

fn fence_into_raw(fence: &Fence) -> i32 {
    match fence.file_handle().map(OwnedHandle::duplicate) {
        Some(Ok(fd)) => fd.into_raw(),
        _ => -1,
    }
}

fn fence_from_raw(fd: i32) -> Fence {
    // Safety: the caller hands over ownership of `fd`.
    Fence::from_handle(unsafe { OwnedHandle::from_raw(fd) })
}

fn fill_info(out: &mut BqBufferInfo, buffer: &SurfaceBuffer, fence: &Fence) {
    let handle = buffer.handle();
    *out = BqBufferInfo {
        sequence: buffer.seq_num(),
        fd: handle.fd.as_raw(),
        width: handle.width,
        height: handle.height,
        stride: handle.stride,
        size: handle.size,
        format: handle.format,
        fence_fd: fence_into_raw(fence),
    };
}

/// Create a queue with `queue_size` slots.
///
/// # Returns
/// * Pointer to `QueueHandle`, or NULL on failure.
#[no_mangle]
pub extern "C" fn bq_queue_new(queue_size: u32) -> *mut QueueHandle {
    match BufferQueueBuilder::new()
        .with_name("ffi")
        .with_queue_size(queue_size)
        .build_pair()
    {
        Ok((producer, consumer)) => Box::into_raw(Box::new(QueueHandle {
            producer,
            consumer,
            acquired: Mutex::new(HashMap::new()),
        })),
        Err(e) => {
            log::error!("bq_queue_new: {e}");
            ptr::null_mut()
        }
    }
}

/// Free a queue handle.
#[no_mangle]
pub extern "C" fn bq_queue_free(handle: *mut QueueHandle) {
    if !handle.is_null() {
        unsafe {
            drop(Box::from_raw(handle));
        }
    }
}

/// Request a buffer. `timeout_ms < 0` waits indefinitely, 0 never blocks.
///
/// # Returns
/// * 0 on success with `out` filled in, otherwise a status code.
#[no_mangle]
pub extern "C" fn bq_request_buffer(
    handle: *mut QueueHandle,
    width: i32,
    height: i32,
    format: i32,
    usage: u64,
    timeout_ms: i64,
    out: *mut BqBufferInfo,
) -> i32 {
    if handle.is_null() || out.is_null() {
        return GSERROR_INVALID_ARGUMENTS;
    }
    let queue = unsafe { &*handle };
    let out = unsafe { &mut *out };

    let result = (|| -> GSResult<()> {
        let format = PixelFormat::from_raw(format)
            .ok_or_else(|| GSError::InvalidArguments(format!("pixel format {format}")))?;
        let usage = BufferUsage::from_bits(usage)
            .ok_or_else(|| GSError::InvalidArguments(format!("usage bits {usage:#x}")))?;
        let mut config = RequestConfig::new(width, height, format, usage);
        config.timeout = (timeout_ms >= 0).then(|| Duration::from_millis(timeout_ms as u64));
        let (buffer, fence) = queue.producer.request_buffer(&config)?;
        fill_info(out, &buffer, &fence);
        Ok(())
    })();
    code_of(result)
}

/// Flush a requested buffer. Takes ownership of `fence_fd` (-1 for none).
#[no_mangle]
pub extern "C" fn bq_flush_buffer(handle: *mut QueueHandle, sequence: u32, fence_fd: i32, timestamp: i64) -> i32 {
    let fence = fence_from_raw(fence_fd);
    if handle.is_null() {
        return GSERROR_INVALID_ARGUMENTS;
    }
    let queue = unsafe { &*handle };
    let config = FlushConfig {
        timestamp,
        ..FlushConfig::default()
    };
    code_of(
        queue
            .producer
            .queue()
            .flush_buffer(sequence, &ExtraData::new(), fence, &config),
    )
}

#[no_mangle]
pub extern "C" fn bq_cancel_buffer(handle: *mut QueueHandle, sequence: u32) -> i32 {
    if handle.is_null() {
        return GSERROR_INVALID_ARGUMENTS;
    }
    let queue = unsafe { &*handle };
    code_of(queue.producer.queue().cancel_buffer(sequence, &ExtraData::new()))
}

/// Acquire the oldest flushed buffer without blocking.
#[no_mangle]
pub extern "C" fn bq_acquire_buffer(handle: *mut QueueHandle, out: *mut BqBufferInfo) -> i32 {
    if handle.is_null() || out.is_null() {
        return GSERROR_INVALID_ARGUMENTS;
    }
    let queue = unsafe { &*handle };
    let out = unsafe { &mut *out };
    let result = queue.consumer.acquire_buffer().map(|acquired| {
        fill_info(out, &acquired.buffer, &acquired.fence);
        queue
            .acquired
            .lock()
            .insert(acquired.buffer.seq_num(), acquired.buffer);
    });
    code_of(result)
}

/// Release an acquired buffer. Takes ownership of `fence_fd` (-1 for none).
#[no_mangle]
pub extern "C" fn bq_release_buffer(handle: *mut QueueHandle, sequence: u32, fence_fd: i32) -> i32 {
    let fence = fence_from_raw(fence_fd);
    if handle.is_null() {
        return GSERROR_INVALID_ARGUMENTS;
    }
    let queue = unsafe { &*handle };
    let buffer = match queue.acquired.lock().remove(&sequence) {
        Some(buffer) => buffer,
        None => return GSError::NoEntry(format!("sequence {sequence}")).code(),
    };
    let result = queue.consumer.release_buffer(&buffer, fence);
    if result.is_err() {
        queue.acquired.lock().insert(sequence, buffer);
    }
    code_of(result)
}
