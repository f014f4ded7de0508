//! Byte-and-descriptor parcels and the wire codecs built on them.
//!
//! A `Parcel` is a little-endian byte stream plus a side vector of file
//! descriptors, the shape an fd-passing transport delivers. Reads advance a
//! cursor and fail with `ProtocolError` past the end; fds read out of a
//! parcel are duplicates, so the parcel keeps (and eventually closes) its own
//! copies.

use crate::Core::fence::Fence;
use crate::Core::handle::{allocate_buffer_handle, BufferHandle, OwnedHandle, MAX_RESERVE_COUNT};
use crate::error::{GSError, GSResult};
use crate::Queue::Structs::Buffer_Structs::{
    BufferUsage, ExtraData, ExtraValue, FlushConfig, PixelFormat, Rect, RequestConfig,
    TransformType, MAX_EXTRA_ENTRIES,
};
use std::time::Duration;

/// Upper bound on damage rectangles decoded from one flush.
pub const MAX_DAMAGE_RECTS: u32 = 64;

#[derive(Default)]
pub struct Parcel {
    data: Vec<u8>,
    fds: Vec<OwnedHandle>,
    read_pos: usize,
    fd_pos: usize,
}

fn truncated(what: &str) -> GSError {
    GSError::ProtocolError(format!("truncated parcel reading {what}"))
}

impl Parcel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(data: Vec<u8>, fds: Vec<OwnedHandle>) -> Self {
        Self {
            data,
            fds,
            read_pos: 0,
            fd_pos: 0,
        }
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<OwnedHandle>) {
        (self.data, self.fds)
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.read_pos
    }

    /// Drop everything past `len` bytes.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
        self.read_pos = self.read_pos.min(len);
    }

    /// Move all of `other`'s bytes and fds to the end of this parcel.
    pub fn append(&mut self, other: Parcel) {
        let (data, fds) = other.into_parts();
        self.data.extend_from_slice(&data);
        self.fds.extend(fds);
    }

    fn take(&mut self, n: usize, what: &str) -> GSResult<&[u8]> {
        if self.remaining() < n {
            return Err(truncated(what));
        }
        let start = self.read_pos;
        self.read_pos += n;
        Ok(&self.data[start..start + n])
    }

    pub fn write_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_f64(&mut self, v: f64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bool(&mut self, v: bool) {
        self.data.push(v as u8);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
    }

    /// Queue a duplicate of `fd`. Invalid handles travel as invalid entries.
    pub fn write_fd(&mut self, fd: &OwnedHandle) -> GSResult<()> {
        let dup = if fd.is_valid() {
            fd.duplicate()?
        } else {
            OwnedHandle::invalid()
        };
        self.fds.push(dup);
        Ok(())
    }

    /// Queue `fd` itself.
    pub fn push_fd(&mut self, fd: OwnedHandle) {
        self.fds.push(fd);
    }

    pub fn read_u32(&mut self) -> GSResult<u32> {
        let b = self.take(4, "u32")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> GSResult<i32> {
        let b = self.take(4, "i32")?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> GSResult<u64> {
        let b = self.take(8, "u64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_i64(&mut self) -> GSResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f64(&mut self) -> GSResult<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_bool(&mut self) -> GSResult<bool> {
        match self.take(1, "bool")?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(GSError::ProtocolError(format!("bool byte {other}"))),
        }
    }

    pub fn read_string(&mut self) -> GSResult<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len, "string")?.to_vec();
        String::from_utf8(bytes).map_err(|_| GSError::ProtocolError("string is not utf-8".into()))
    }

    /// Duplicate of the next fd in the side vector.
    pub fn read_fd(&mut self) -> GSResult<OwnedHandle> {
        let fd = self.fds.get(self.fd_pos).ok_or_else(|| truncated("fd"))?;
        self.fd_pos += 1;
        if !fd.is_valid() {
            return Ok(OwnedHandle::invalid());
        }
        Ok(fd.duplicate()?)
    }
}

// ---------------------------------------------------------------------------
// Buffer descriptor
// ---------------------------------------------------------------------------

/// Encode a buffer descriptor. Field order:
/// reserve fd count, reserve int count, width, stride, height, size, format,
/// usage, physical address, has-fd flag, [fd], reserve fds, reserve ints.
pub fn write_buffer_handle(parcel: &mut Parcel, handle: &BufferHandle) -> GSResult<()> {
    parcel.write_u32(handle.reserve_fd_count());
    parcel.write_u32(handle.reserve_int_count());
    parcel.write_i32(handle.width);
    parcel.write_i32(handle.stride);
    parcel.write_i32(handle.height);
    parcel.write_i32(handle.size);
    parcel.write_i32(handle.format);
    parcel.write_i64(handle.usage as i64);
    parcel.write_u64(handle.phy_addr);
    parcel.write_bool(handle.fd.is_valid());
    if handle.fd.is_valid() {
        parcel.write_fd(&handle.fd)?;
    }
    for fd in &handle.reserve_fds {
        parcel.write_fd(fd)?;
    }
    for v in &handle.reserve_ints {
        parcel.write_i32(*v);
    }
    Ok(())
}

fn decode_buffer_handle(parcel: &mut Parcel) -> GSResult<BufferHandle> {
    let reserve_fds = parcel.read_u32()?;
    let reserve_ints = parcel.read_u32()?;
    if reserve_fds > MAX_RESERVE_COUNT || reserve_ints > MAX_RESERVE_COUNT {
        return Err(GSError::ProtocolError(format!(
            "reserve counts fds {reserve_fds} ints {reserve_ints}"
        )));
    }
    let mut handle = allocate_buffer_handle(reserve_fds, reserve_ints)
        .ok_or_else(|| GSError::ProtocolError("reserve counts".into()))?;
    handle.width = parcel.read_i32()?;
    handle.stride = parcel.read_i32()?;
    handle.height = parcel.read_i32()?;
    handle.size = parcel.read_i32()?;
    handle.format = parcel.read_i32()?;
    handle.usage = parcel.read_i64()? as u64;
    handle.phy_addr = parcel.read_u64()?;
    if parcel.read_bool()? {
        handle.fd = parcel.read_fd()?;
    }
    // On any failure below, dropping `handle` closes the fds taken so far.
    for slot in handle.reserve_fds.iter_mut() {
        *slot = parcel.read_fd()?;
    }
    for slot in handle.reserve_ints.iter_mut() {
        *slot = parcel.read_i32()?;
    }
    Ok(handle)
}

/// Decode a buffer descriptor. A malformed descriptor is rejected as a whole:
/// `None` is returned and every descriptor duplicated while decoding is closed.
pub fn read_buffer_handle(parcel: &mut Parcel) -> Option<BufferHandle> {
    match decode_buffer_handle(parcel) {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::warn!("rejecting buffer handle: {e}");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Fences, configs, extra data
// ---------------------------------------------------------------------------

/// Only fd-backed fences can cross a process boundary; a fence without one
/// travels as invalid.
pub fn write_fence(parcel: &mut Parcel, fence: &Fence) -> GSResult<()> {
    match fence.file_handle() {
        Some(fd) => {
            parcel.write_bool(true);
            parcel.write_fd(fd)
        }
        None => {
            if fence.is_valid() {
                log::debug!("software fence sent as invalid");
            }
            parcel.write_bool(false);
            Ok(())
        }
    }
}

pub fn read_fence(parcel: &mut Parcel) -> GSResult<Fence> {
    if parcel.read_bool()? {
        Ok(Fence::from_handle(parcel.read_fd()?))
    } else {
        Ok(Fence::invalid())
    }
}

pub fn write_request_config(parcel: &mut Parcel, config: &RequestConfig) {
    parcel.write_i32(config.width);
    parcel.write_i32(config.height);
    parcel.write_i32(config.stride_alignment);
    parcel.write_i32(config.format.raw());
    parcel.write_u64(config.usage.bits());
    parcel.write_i64(config.timeout.map_or(-1, |t| t.as_millis() as i64));
    parcel.write_i32(config.transform as i32);
}

/// Structural failures are `ProtocolError`; out-of-domain values are
/// `InvalidArguments`, like the same values passed in-process.
pub fn read_request_config(parcel: &mut Parcel) -> GSResult<RequestConfig> {
    let width = parcel.read_i32()?;
    let height = parcel.read_i32()?;
    let stride_alignment = parcel.read_i32()?;
    let format_raw = parcel.read_i32()?;
    let usage_raw = parcel.read_u64()?;
    let timeout_ms = parcel.read_i64()?;
    let transform_raw = parcel.read_i32()?;

    let format = PixelFormat::from_raw(format_raw)
        .ok_or_else(|| GSError::InvalidArguments(format!("pixel format {format_raw}")))?;
    let usage = BufferUsage::from_bits(usage_raw)
        .ok_or_else(|| GSError::InvalidArguments(format!("usage bits {usage_raw:#x}")))?;
    let transform = TransformType::from_raw(transform_raw)
        .ok_or_else(|| GSError::InvalidArguments(format!("transform {transform_raw}")))?;
    let mut config = RequestConfig::new(width, height, format, usage);
    config.stride_alignment = stride_alignment;
    config.timeout = (timeout_ms >= 0).then(|| Duration::from_millis(timeout_ms as u64));
    config.transform = transform;
    Ok(config)
}

pub fn write_flush_config(parcel: &mut Parcel, config: &FlushConfig) {
    parcel.write_u32(config.damages.len() as u32);
    for r in &config.damages {
        parcel.write_i32(r.x);
        parcel.write_i32(r.y);
        parcel.write_i32(r.w);
        parcel.write_i32(r.h);
    }
    parcel.write_i64(config.timestamp);
    parcel.write_i64(config.desired_present_timestamp);
}

pub fn read_flush_config(parcel: &mut Parcel) -> GSResult<FlushConfig> {
    let count = parcel.read_u32()?;
    if count > MAX_DAMAGE_RECTS {
        return Err(GSError::ProtocolError(format!("{count} damage rects")));
    }
    let mut damages = Vec::with_capacity(count as usize);
    for _ in 0..count {
        damages.push(Rect {
            x: parcel.read_i32()?,
            y: parcel.read_i32()?,
            w: parcel.read_i32()?,
            h: parcel.read_i32()?,
        });
    }
    Ok(FlushConfig {
        damages,
        timestamp: parcel.read_i64()?,
        desired_present_timestamp: parcel.read_i64()?,
    })
}

const EXTRA_INT32: u32 = 0;
const EXTRA_INT64: u32 = 1;
const EXTRA_DOUBLE: u32 = 2;
const EXTRA_STRING: u32 = 3;

pub fn write_extra_data(parcel: &mut Parcel, extra: &ExtraData) {
    parcel.write_u32(extra.len() as u32);
    for (key, value) in extra.iter() {
        parcel.write_string(key);
        match value {
            ExtraValue::Int32(v) => {
                parcel.write_u32(EXTRA_INT32);
                parcel.write_i32(*v);
            }
            ExtraValue::Int64(v) => {
                parcel.write_u32(EXTRA_INT64);
                parcel.write_i64(*v);
            }
            ExtraValue::Double(v) => {
                parcel.write_u32(EXTRA_DOUBLE);
                parcel.write_f64(*v);
            }
            ExtraValue::Str(v) => {
                parcel.write_u32(EXTRA_STRING);
                parcel.write_string(v);
            }
        }
    }
}

pub fn read_extra_data(parcel: &mut Parcel) -> GSResult<ExtraData> {
    let count = parcel.read_u32()?;
    if count as usize > MAX_EXTRA_ENTRIES {
        return Err(GSError::ProtocolError(format!("{count} extra data entries")));
    }
    let mut extra = ExtraData::new();
    for _ in 0..count {
        let key = parcel.read_string()?;
        let value = match parcel.read_u32()? {
            EXTRA_INT32 => ExtraValue::Int32(parcel.read_i32()?),
            EXTRA_INT64 => ExtraValue::Int64(parcel.read_i64()?),
            EXTRA_DOUBLE => ExtraValue::Double(parcel.read_f64()?),
            EXTRA_STRING => ExtraValue::Str(parcel.read_string()?),
            tag => return Err(GSError::ProtocolError(format!("extra data tag {tag}"))),
        };
        extra.set(&key, value)?;
    }
    Ok(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_past_end_are_protocol_errors() {
        let mut p = Parcel::new();
        p.write_u32(7);
        assert_eq!(p.read_u32().unwrap(), 7);
        assert!(matches!(p.read_u32(), Err(GSError::ProtocolError(_))));
        assert!(matches!(p.read_fd(), Err(GSError::ProtocolError(_))));
    }

    #[test]
    fn rejects_non_canonical_bool() {
        let mut p = Parcel::from_parts(vec![2], Vec::new());
        assert!(matches!(p.read_bool(), Err(GSError::ProtocolError(_))));
    }

    #[test]
    fn extra_data_survives_the_wire() {
        let mut extra = ExtraData::new();
        extra.set("frame", ExtraValue::Int64(42)).unwrap();
        extra.set("label", ExtraValue::Str("video".into())).unwrap();
        let mut p = Parcel::new();
        write_extra_data(&mut p, &extra);
        assert_eq!(read_extra_data(&mut p).unwrap(), extra);
    }

    #[test]
    fn oversized_string_length_is_rejected() {
        let mut p = Parcel::new();
        p.write_u32(u32::MAX);
        assert!(matches!(p.read_string(), Err(GSError::ProtocolError(_))));
    }
}
