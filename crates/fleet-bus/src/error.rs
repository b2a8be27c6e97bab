//! Bus and codec error types.

use thiserror::Error;

pub type BusResult<T> = Result<T, BusError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("string of {0} bytes exceeds the frame limit")]
    StringTooLong(usize),

    #[error("{0} entries exceed the frame limit")]
    TooManyEntries(usize),

    #[error("unexpected end of message")]
    UnexpectedEof,

    #[error("varint longer than 5 bytes")]
    VarIntTooLong,

    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    #[error("value {0} out of range for its field")]
    OutOfRange(u32),

    #[error("flag byte {0} is neither 0 nor 1")]
    InvalidFlag(u8),

    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection is down")]
    Disconnected,

    #[error("subscribe requires a tokio runtime")]
    NoRuntime,

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}
