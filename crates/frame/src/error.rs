use crate::frame::FrameType;

/// The error taxonomy shared by every layer of the stack.
///
/// Each layer raises the subset that applies to it; retry loops above L0
/// treat most of these as recoverable and only bubble up [`Error::ConnectionBroken`]
/// and the parameter/precondition errors to the caller unconditionally.
#[derive(Debug)]
pub enum Error {
    /// The operation did not complete within its deadline.
    Timeout,
    /// A configuration value (most commonly `ip`/`port`) was malformed.
    IncorrectParameter(String),
    /// The caller's buffer was too small; carries the size that would have
    /// been required so the caller can resize and retry.
    BufferOverflow { required_size: usize },
    /// The underlying socket failed on read.
    ReadFailed(String),
    /// The underlying socket failed on write.
    WriteFailed(String),
    /// Binding or creating the socket failed.
    ConnectFailed(String),
    /// A frame failed its CRC check.
    CrcCheckFailed { expected: u16, actual: u16 },
    /// A frame arrived with a byte count that didn't match its declared length.
    SizeMismatch { expected: usize, actual: usize },
    /// A data frame arrived out of sequence.
    WrongNumber { expected: u32, actual: u32 },
    /// A frame of an unrecognized type was received.
    UnknownFrame(u16),
    /// A frame of a different type than expected was received.
    UnexpectedFrame { expected: FrameType, actual: FrameType },
    /// The connection has diverged beyond recovery; the caller must redo
    /// `connect`/`accept`.
    ConnectionBroken,
    /// A second Retransmit was received while already responding to one.
    RepeatRetransmit,
    /// The protocol instance has no router to talk through.
    TransportMissing,
    /// `read`/`write` was called before a successful `connect`/`accept`.
    NotConnected,
}

impl Error {
    /// Returns the buffer size the caller should retry with, if this error
    /// is a [`Error::BufferOverflow`].
    pub fn required_size(&self) -> Option<usize> {
        match self {
            Error::BufferOverflow { required_size } => Some(*required_size),
            _ => None,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::Timeout => write!(f, "operation timed out"),
            Error::IncorrectParameter(msg) => write!(f, "incorrect parameter: {msg}"),
            Error::BufferOverflow { required_size } => {
                write!(f, "buffer too small, required {required_size} bytes")
            }
            Error::ReadFailed(msg) => write!(f, "read failed: {msg}"),
            Error::WriteFailed(msg) => write!(f, "write failed: {msg}"),
            Error::ConnectFailed(msg) => write!(f, "connect failed: {msg}"),
            Error::CrcCheckFailed { expected, actual } => write!(
                f,
                "CRC check failed: expected crc = {expected}, got crc = {actual}"
            ),
            Error::SizeMismatch { expected, actual } => write!(
                f,
                "sent or received bytes mismatch: expected {expected}, got {actual}"
            ),
            Error::WrongNumber { expected, actual } => write!(
                f,
                "sequence number check failed: expected {expected}, got {actual}"
            ),
            Error::UnknownFrame(kind) => write!(f, "unknown frame type {kind} detected"),
            Error::UnexpectedFrame { expected, actual } => write!(
                f,
                "unexpected frame type {actual:?} detected when {expected:?} was expected"
            ),
            Error::ConnectionBroken => {
                write!(f, "connection broke down, please redo accept/connect")
            }
            Error::RepeatRetransmit => write!(f, "repeated retransmit request"),
            Error::TransportMissing => write!(f, "no transport bound to this protocol instance"),
            Error::NotConnected => write!(f, "operation requires a connected session"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
