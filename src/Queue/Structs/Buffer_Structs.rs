// Plain configuration and metadata types exchanged with the queue.

use crate::error::{GSError, GSResult};
use bitflags::bitflags;
use std::collections::BTreeMap;
use std::time::Duration;

pub const MIN_STRIDE_ALIGNMENT: i32 = 4;
pub const MAX_STRIDE_ALIGNMENT: i32 = 32;
pub const DEFAULT_STRIDE_ALIGNMENT: i32 = 8;
pub const MAX_EXTRA_KEY_LEN: usize = 128;
pub const MAX_EXTRA_ENTRIES: usize = 64;
pub const MAX_METADATA_SET_SIZE: usize = 4096;

/// Pixel formats the allocator understands. Discriminants are the wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PixelFormat {
    Rgb565 = 3,
    Rgbx8888 = 11,
    Rgba8888 = 12,
    Rgb888 = 13,
    Bgra8888 = 20,
    Ycbcr420Sp = 24,
    Ycrcb420Sp = 25,
    Ycbcr420P = 26,
    Rgba1010102 = 34,
    Ycbcr420Sp10 = 35,
}

impl PixelFormat {
    pub fn from_raw(raw: i32) -> Option<PixelFormat> {
        Some(match raw {
            3 => PixelFormat::Rgb565,
            11 => PixelFormat::Rgbx8888,
            12 => PixelFormat::Rgba8888,
            13 => PixelFormat::Rgb888,
            20 => PixelFormat::Bgra8888,
            24 => PixelFormat::Ycbcr420Sp,
            25 => PixelFormat::Ycrcb420Sp,
            26 => PixelFormat::Ycbcr420P,
            34 => PixelFormat::Rgba1010102,
            35 => PixelFormat::Ycbcr420Sp10,
            _ => return None,
        })
    }

    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Bytes per pixel of the luma/packed plane.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Rgb888 => 3,
            PixelFormat::Rgbx8888
            | PixelFormat::Rgba8888
            | PixelFormat::Bgra8888
            | PixelFormat::Rgba1010102 => 4,
            PixelFormat::Ycbcr420Sp | PixelFormat::Ycrcb420Sp | PixelFormat::Ycbcr420P => 1,
            PixelFormat::Ycbcr420Sp10 => 2,
        }
    }

    /// Planar YUV formats carry half a plane of chroma after the luma plane.
    pub fn is_yuv420(self) -> bool {
        matches!(
            self,
            PixelFormat::Ycbcr420Sp
                | PixelFormat::Ycrcb420Sp
                | PixelFormat::Ycbcr420P
                | PixelFormat::Ycbcr420Sp10
        )
    }
}

bitflags! {
    /// Buffer usage bits. Unknown bits make a request malformed.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u64 {
        const CPU_READ = 1 << 0;
        const CPU_WRITE = 1 << 1;
        const MEM_MMZ = 1 << 2;
        const MEM_DMA = 1 << 3;
        const MEM_SHARE = 1 << 4;
        const MEM_MMZ_CACHE = 1 << 5;
        const MEM_FB = 1 << 6;
        const ASSUME_CONTIGUOUS = 1 << 7;
        const HW_RENDER = 1 << 8;
        const HW_TEXTURE = 1 << 9;
        const HW_COMPOSER = 1 << 10;
        const PROTECTED = 1 << 11;
        const CAMERA_READ = 1 << 12;
        const CAMERA_WRITE = 1 << 13;
        const VIDEO_ENCODER = 1 << 14;
        const VIDEO_DECODER = 1 << 15;
        const CPU_READ_OFTEN = 1 << 16;
        const CPU_HW_BOTH = 1 << 17;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum TransformType {
    #[default]
    Rotate0 = 0,
    Rotate90 = 1,
    Rotate180 = 2,
    Rotate270 = 3,
    FlipH = 4,
    FlipV = 5,
    FlipHRot90 = 6,
    FlipVRot90 = 7,
}

impl TransformType {
    pub fn from_raw(raw: i32) -> Option<TransformType> {
        Some(match raw {
            0 => TransformType::Rotate0,
            1 => TransformType::Rotate90,
            2 => TransformType::Rotate180,
            3 => TransformType::Rotate270,
            4 => TransformType::FlipH,
            5 => TransformType::FlipV,
            6 => TransformType::FlipHRot90,
            7 => TransformType::FlipVRot90,
            _ => return None,
        })
    }
}

/// Parameters of a buffer request. Two requests share a cached buffer when
/// everything except `timeout` and `transform` matches.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub width: i32,
    pub height: i32,
    pub stride_alignment: i32,
    pub format: PixelFormat,
    pub usage: BufferUsage,
    /// `None` blocks until a slot frees up; `Some(ZERO)` never blocks.
    pub timeout: Option<Duration>,
    pub transform: TransformType,
}

impl RequestConfig {
    pub fn new(width: i32, height: i32, format: PixelFormat, usage: BufferUsage) -> Self {
        Self {
            width,
            height,
            stride_alignment: DEFAULT_STRIDE_ALIGNMENT,
            format,
            usage,
            timeout: None,
            transform: TransformType::Rotate0,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn validate(&self) -> GSResult<()> {
        if self.width <= 0 || self.height <= 0 {
            return Err(GSError::InvalidArguments(format!(
                "size {}x{}",
                self.width, self.height
            )));
        }
        let align = self.stride_alignment;
        if !(MIN_STRIDE_ALIGNMENT..=MAX_STRIDE_ALIGNMENT).contains(&align)
            || (align & (align - 1)) != 0
        {
            return Err(GSError::InvalidArguments(format!("stride alignment {align}")));
        }
        if BufferUsage::from_bits(self.usage.bits()).is_none() {
            return Err(GSError::InvalidArguments(format!(
                "usage bits {:#x}",
                self.usage.bits()
            )));
        }
        Ok(())
    }

    /// True when a buffer allocated for `other` can serve this request.
    pub fn same_allocation(&self, other: &RequestConfig) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.stride_alignment == other.stride_alignment
            && self.format == other.format
            && self.usage == other.usage
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

/// Parameters of a flush.
#[derive(Debug, Clone, Default)]
pub struct FlushConfig {
    pub damages: Vec<Rect>,
    /// Content timestamp in ns; 0 lets the queue stamp it.
    pub timestamp: i64,
    /// Desired present time in ns; 0 or negative means "as soon as possible".
    pub desired_present_timestamp: i64,
}

impl FlushConfig {
    pub fn validate(&self) -> GSResult<()> {
        for r in &self.damages {
            if r.w < 0 || r.h < 0 {
                return Err(GSError::InvalidArguments(format!("damage {r:?}")));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtraValue {
    Int32(i32),
    Int64(i64),
    Double(f64),
    Str(String),
}

/// Small key/value bag travelling with request, cancel and flush calls.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtraData {
    entries: BTreeMap<String, ExtraValue>,
}

impl ExtraData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: ExtraValue) -> GSResult<()> {
        if key.is_empty() || key.len() > MAX_EXTRA_KEY_LEN {
            return Err(GSError::OutOfRange(format!("extra data key length {}", key.len())));
        }
        if !self.entries.contains_key(key) && self.entries.len() >= MAX_EXTRA_ENTRIES {
            return Err(GSError::OutOfRange("extra data entry count".into()));
        }
        self.entries.insert(key.to_owned(), value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&ExtraValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ExtraValue)> {
        self.entries.iter()
    }

    /// Re-check limits on data that did not go through `set` (e.g. decoded).
    pub fn validate(&self) -> GSResult<()> {
        if self.entries.len() > MAX_EXTRA_ENTRIES {
            return Err(GSError::OutOfRange("extra data entry count".into()));
        }
        if let Some(k) = self.entries.keys().find(|k| k.is_empty() || k.len() > MAX_EXTRA_KEY_LEN) {
            return Err(GSError::OutOfRange(format!("extra data key length {}", k.len())));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScalingMode {
    Freeze,
    #[default]
    ScaleToWindow,
    ScaleCrop,
    NoScaleCrop,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HdrMetaData {
    pub key: u32,
    pub value: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrMetadataType {
    None,
    MetaData,
    MetaDataSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentTimestampType {
    Unsupported,
    Delay,
    Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresentTimestamp {
    pub kind: PresentTimestampType,
    pub time: i64,
}

/// What kind of producer feeds the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceType {
    #[default]
    Default,
    Ui,
    Game,
    Camera,
    Video,
    /// Low-power video: frames travel through the shared LPP ring.
    LowPowerVideo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelHandle {
    pub tunnel_id: i32,
    pub reserve_ints: Vec<i32>,
}

/// Which side of the queue holds a buffer being attached or detached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    Producer,
    Consumer,
}
