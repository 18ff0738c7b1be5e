use crate::net::protocol::Status;
use std::error;
use std::fmt;
use std::io;

pub type CodecResult<T> = Result<T, CodecError>;
pub type ClientResult<T> = Result<T, Error>;

/// Errors raised while encoding or decoding values.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum CodecError {
    /// The input does not begin with the expected version tag.
    BadVersion,
    /// A value (or decoded tag) outside the supported universe.
    UnsupportedType,
    /// A write would grow the buffer past its ceiling.
    Overflow,
    /// A read would run past the end of valid input.
    Underflow,
    /// A 64-bit table size with the sign bit set.
    BadTableSize,
    /// A back-reference ordinal outside the table built so far.
    BadBackref(i64),
    /// The back-reference ordinal space is exhausted.
    TooManyTables,
    TooManyArrayElements,
    TooManyRecordElements,
    /// A decoded string length that cannot be materialized.
    StringTooLong(u64),
    /// Bytes remaining after the top-level value.
    TrailingData(usize),
    /// Aggregate nesting beyond the recursion bound.
    NestingTooDeep,
    /// The allocator refused to grow the buffer.
    OutOfMemory,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CodecError::BadVersion => write!(f, "bad codec version"),
            CodecError::UnsupportedType => write!(f, "unsupported value type"),
            CodecError::Overflow => write!(f, "buffer overflow"),
            CodecError::Underflow => write!(f, "buffer underflow"),
            CodecError::BadTableSize => write!(f, "bad table size"),
            CodecError::BadBackref(ordinal) => write!(f, "bad back-reference {}", ordinal),
            CodecError::TooManyTables => write!(f, "too many tables"),
            CodecError::TooManyArrayElements => write!(f, "too many array elements"),
            CodecError::TooManyRecordElements => write!(f, "too many record elements"),
            CodecError::StringTooLong(len) => write!(f, "string too long ({} bytes)", len),
            CodecError::TrailingData(count) => write!(f, "{} extra bytes in buffer", count),
            CodecError::NestingTooDeep => write!(f, "value nesting too deep"),
            CodecError::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

impl error::Error for CodecError {}

/// Errors surfaced by client operations. Missing keys, CAS conflicts and
/// non-numeric counters are first-class outcomes, not errors.
#[derive(Debug)]
pub enum Error {
    /// Key length outside `[1, 65535]`.
    BadKey(usize),
    /// Connect timeout of zero in the configuration.
    BadTimeout,
    /// Encoded value larger than the protocol body field can carry.
    ValueTooLong(usize),
    Codec(CodecError),
    /// Host/port resolution produced no usable address.
    Resolve(io::Error),
    /// Every candidate address failed; holds the last OS error.
    Connect(io::Error),
    /// The peer closed the stream mid-transfer.
    SocketClosed,
    Socket(io::Error),
    /// Response magic mismatch.
    BadResponse(u8),
    /// Unexpected frame shape.
    Protocol(&'static str),
    /// A status the operation has no domain mapping for.
    Server(Status),
    /// Operation on a closed client.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::BadKey(len) => write!(f, "bad key length {}", len),
            Error::BadTimeout => write!(f, "connect timeout must be positive"),
            Error::ValueTooLong(len) => write!(f, "encoded value too long ({} bytes)", len),
            Error::Codec(err) => write!(f, "codec: {}", err),
            Error::Resolve(err) => write!(f, "resolve failed: {}", err),
            Error::Connect(err) => write!(f, "connect failed: {}", err),
            Error::SocketClosed => write!(f, "socket closed by peer"),
            Error::Socket(err) => write!(f, "socket error: {}", err),
            Error::BadResponse(magic) => write!(f, "bad response magic 0x{:02x}", magic),
            Error::Protocol(what) => write!(f, "protocol error: {}", what),
            Error::Server(status) => write!(f, "server error: {}", status),
            Error::Closed => write!(f, "client is closed"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Codec(err) => Some(err),
            Error::Resolve(err) | Error::Connect(err) | Error::Socket(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for Error {
    #[inline]
    fn from(err: CodecError) -> Self {
        Error::Codec(err)
    }
}
