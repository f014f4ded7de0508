// Server side of the producer IPC surface.
//
// Every reply starts with an i32 status (0 on success) followed by the
// operation's payload. A request is decoded completely before the queue is
// touched, so a malformed payload fails with `ProtocolError` and leaves the
// queue as it was.

use super::parcel::{
    read_buffer_handle, read_extra_data, read_fence, read_flush_config, read_request_config,
    write_buffer_handle, write_fence, Parcel,
};
use crate::Core::handle::MAX_RESERVE_COUNT;
use crate::error::{GSError, GSResult, GSERROR_OK};
use crate::Queue::buffer_queue::BufferQueue;
use crate::Queue::Buffer::SurfaceBuffer;
use crate::Queue::Structs::Buffer_Structs::{BufferOwner, TransformType, TunnelHandle};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestCode {
    RequestBuffer = 1,
    CancelBuffer = 2,
    FlushBuffer = 3,
    AttachBuffer = 4,
    DetachBuffer = 5,
    SetQueueSize = 6,
    GetQueueSize = 7,
    SetTunnelHandle = 8,
    GetTransform = 9,
    SetTransform = 10,
    GetName = 11,
    GetUniqueId = 12,
    CleanCache = 13,
}

impl RequestCode {
    pub fn from_raw(code: u32) -> Option<RequestCode> {
        use RequestCode::*;
        Some(match code {
            1 => RequestBuffer,
            2 => CancelBuffer,
            3 => FlushBuffer,
            4 => AttachBuffer,
            5 => DetachBuffer,
            6 => SetQueueSize,
            7 => GetQueueSize,
            8 => SetTunnelHandle,
            9 => GetTransform,
            10 => SetTransform,
            11 => GetName,
            12 => GetUniqueId,
            13 => CleanCache,
            _ => return None,
        })
    }
}

pub struct ProducerStub {
    queue: Arc<BufferQueue>,
}

impl ProducerStub {
    pub fn new(queue: Arc<BufferQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<BufferQueue> {
        &self.queue
    }

    /// Dispatch one request and build its reply.
    pub fn on_remote_request(&self, code: u32, data: &mut Parcel) -> Parcel {
        let mut payload = Parcel::new();
        let result = match RequestCode::from_raw(code) {
            Some(code) => self.dispatch(code, data, &mut payload),
            None => Err(GSError::InvalidArguments(format!("unknown request code {code}"))),
        };
        let mut reply = Parcel::new();
        match result {
            Ok(()) => {
                reply.write_i32(GSERROR_OK);
                reply.append(payload);
            }
            Err(e) => {
                if matches!(e, GSError::ProtocolError(_)) {
                    log::warn!("[{}] request {code}: {e}", self.queue.name());
                }
                reply.write_i32(e.code());
            }
        }
        reply
    }

    fn dispatch(&self, code: RequestCode, data: &mut Parcel, reply: &mut Parcel) -> GSResult<()> {
        match code {
            RequestCode::RequestBuffer => self.request_buffer(data, reply),
            RequestCode::CancelBuffer => {
                let seq = data.read_u32()?;
                let extra = read_extra_data(data)?;
                self.queue.cancel_buffer(seq, &extra)
            }
            RequestCode::FlushBuffer => {
                let seq = data.read_u32()?;
                let extra = read_extra_data(data)?;
                let fence = read_fence(data)?;
                let config = read_flush_config(data)?;
                self.queue.flush_buffer(seq, &extra, fence, &config)
            }
            RequestCode::AttachBuffer => self.attach_buffer(data),
            RequestCode::DetachBuffer => {
                let seq = data.read_u32()?;
                self.queue.detach_buffer_from_queue(seq, BufferOwner::Producer)
            }
            RequestCode::SetQueueSize => {
                let size = data.read_u32()?;
                self.queue.set_queue_size(size)
            }
            RequestCode::GetQueueSize => {
                reply.write_u32(self.queue.get_queue_size());
                Ok(())
            }
            RequestCode::SetTunnelHandle => {
                let handle = if data.read_bool()? {
                    let tunnel_id = data.read_i32()?;
                    let count = data.read_u32()?;
                    if count > MAX_RESERVE_COUNT {
                        return Err(GSError::ProtocolError(format!("{count} tunnel reserve ints")));
                    }
                    let mut reserve_ints = Vec::with_capacity(count as usize);
                    for _ in 0..count {
                        reserve_ints.push(data.read_i32()?);
                    }
                    Some(TunnelHandle {
                        tunnel_id,
                        reserve_ints,
                    })
                } else {
                    None
                };
                self.queue.set_tunnel_handle(handle)
            }
            RequestCode::GetTransform => {
                reply.write_i32(self.queue.get_transform() as i32);
                Ok(())
            }
            RequestCode::SetTransform => {
                let raw = data.read_i32()?;
                let transform = TransformType::from_raw(raw)
                    .ok_or_else(|| GSError::InvalidArguments(format!("transform {raw}")))?;
                self.queue.set_transform(transform);
                Ok(())
            }
            RequestCode::GetName => {
                reply.write_string(self.queue.name());
                Ok(())
            }
            RequestCode::GetUniqueId => {
                reply.write_u64(self.queue.unique_id());
                Ok(())
            }
            RequestCode::CleanCache => {
                let destroy_in_flight = data.read_bool()?;
                let removed = self.queue.clean_cache(destroy_in_flight)?;
                reply.write_u32(removed.len() as u32);
                for seq in removed {
                    reply.write_u32(seq);
                }
                Ok(())
            }
        }
    }

    fn request_buffer(&self, data: &mut Parcel, reply: &mut Parcel) -> GSResult<()> {
        let config = read_request_config(data)?;
        let extra = read_extra_data(data)?;
        let ret = self.queue.request_buffer(&config, &extra)?;

        // Encode into a scratch parcel so a failed fd duplication can still
        // hand the slot back.
        let mut out = Parcel::new();
        let encoded = (|| -> GSResult<()> {
            out.write_u32(ret.sequence);
            out.write_bool(ret.buffer.is_some());
            if let Some(buffer) = &ret.buffer {
                write_buffer_handle(&mut out, buffer.handle())?;
            }
            write_fence(&mut out, &ret.fence)?;
            out.write_u32(ret.deleting_buffers.len() as u32);
            for seq in &ret.deleting_buffers {
                out.write_u32(*seq);
            }
            Ok(())
        })();
        if let Err(e) = encoded {
            let _ = self.queue.cancel_buffer(ret.sequence, &Default::default());
            return Err(e);
        }
        reply.append(out);
        Ok(())
    }

    fn attach_buffer(&self, data: &mut Parcel) -> GSResult<()> {
        let seq = data.read_u32()?;
        let config = read_request_config(data)?;
        let handle = read_buffer_handle(data)
            .ok_or_else(|| GSError::ProtocolError("malformed buffer handle".into()))?;
        let timeout_ms = data.read_i64()?;
        let timeout = (timeout_ms >= 0).then(|| Duration::from_millis(timeout_ms as u64));
        let buffer = SurfaceBuffer::new(seq, handle, config, None);
        self.queue.attach_buffer(buffer, timeout)
    }
}
