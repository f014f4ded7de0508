// Status taxonomy shared by the queue, the transport stub and the C ABI.

use std::io;
use thiserror::Error;

pub const GSERROR_OK: i32 = 0;
pub const GSERROR_INVALID_ARGUMENTS: i32 = 40001000;
pub const GSERROR_NO_BUFFER: i32 = 40601000;
pub const GSERROR_NO_ENTRY: i32 = 40602000;
pub const GSERROR_OUT_OF_RANGE: i32 = 40603000;
pub const GSERROR_NO_BUFFER_READY: i32 = 40605000;
pub const GSERROR_INVALID_OPERATING: i32 = 41201000;
pub const GSERROR_NO_CONSUMER: i32 = 41202000;
pub const GSERROR_UNKNOWN: i32 = 50001000;
pub const GSERROR_NO_MEM: i32 = 50002000;
pub const GSERROR_PROTOCOL: i32 = 50401000;

/// Errors returned by buffer queue operations.
///
/// `NoBuffer` and `NoBufferReady` are transient: the caller decides whether to
/// poll or block. `NoConsumer` means the queue was disabled or its consumer is
/// gone and only a reconnection recovers.
#[derive(Debug, Error)]
pub enum GSError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("no buffer available")]
    NoBuffer,

    #[error("no buffer ready for presentation")]
    NoBufferReady,

    #[error("no consumer")]
    NoConsumer,

    #[error("no entry: {0}")]
    NoEntry(String),

    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("invalid operation: {0}")]
    InvalidOperating(String),

    #[error("allocation failed: out of memory")]
    NoMemory,

    #[error("unknown failure: {0}")]
    Unknown(String),

    #[error("malformed payload: {0}")]
    ProtocolError(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type GSResult<T> = Result<T, GSError>;

impl GSError {
    /// Stable integer status code for this error.
    pub fn code(&self) -> i32 {
        match self {
            GSError::InvalidArguments(_) => GSERROR_INVALID_ARGUMENTS,
            GSError::NoBuffer => GSERROR_NO_BUFFER,
            GSError::NoBufferReady => GSERROR_NO_BUFFER_READY,
            GSError::NoConsumer => GSERROR_NO_CONSUMER,
            GSError::NoEntry(_) => GSERROR_NO_ENTRY,
            GSError::OutOfRange(_) => GSERROR_OUT_OF_RANGE,
            GSError::InvalidOperating(_) => GSERROR_INVALID_OPERATING,
            GSError::NoMemory => GSERROR_NO_MEM,
            GSError::Unknown(_) | GSError::Io(_) => GSERROR_UNKNOWN,
            GSError::ProtocolError(_) => GSERROR_PROTOCOL,
        }
    }

    /// Rebuild an error from a status code received over the transport.
    /// Returns `None` for `GSERROR_OK`.
    pub fn from_code(code: i32) -> Option<GSError> {
        let err = match code {
            GSERROR_OK => return None,
            GSERROR_INVALID_ARGUMENTS => GSError::InvalidArguments("remote".into()),
            GSERROR_NO_BUFFER => GSError::NoBuffer,
            GSERROR_NO_BUFFER_READY => GSError::NoBufferReady,
            GSERROR_NO_CONSUMER => GSError::NoConsumer,
            GSERROR_NO_ENTRY => GSError::NoEntry("remote".into()),
            GSERROR_OUT_OF_RANGE => GSError::OutOfRange("remote".into()),
            GSERROR_INVALID_OPERATING => GSError::InvalidOperating("remote".into()),
            GSERROR_NO_MEM => GSError::NoMemory,
            GSERROR_PROTOCOL => GSError::ProtocolError("remote".into()),
            other => GSError::Unknown(format!("status {other}")),
        };
        Some(err)
    }

    /// True for the errors a caller may retry without reconnecting.
    pub fn is_transient(&self) -> bool {
        matches!(self, GSError::NoBuffer | GSError::NoBufferReady)
    }
}

/// Collapse a result into the integer status used across process boundaries.
pub fn status_of<T>(result: &GSResult<T>) -> i32 {
    match result {
        Ok(_) => GSERROR_OK,
        Err(e) => e.code(),
    }
}
