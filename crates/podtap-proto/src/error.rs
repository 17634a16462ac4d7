//! Control-protocol error types.

use thiserror::Error;

/// Errors produced while framing, serializing, or exchanging control
/// messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// The underlying stream failed.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame declared a payload larger than the allowed maximum.
    #[error("frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        /// Declared payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A frame carried an unrecognized type byte.
    #[error("unknown frame type {0:#x}")]
    UnknownFrameType(u8),

    /// A payload could not be serialized or deserialized.
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The peer sent a frame that is invalid at this point in the session.
    #[error("unexpected {got} frame, expected {expected}")]
    UnexpectedFrame {
        /// What the session state allowed.
        expected: &'static str,
        /// What arrived instead.
        got: &'static str,
    },

    /// The agent reported an error for this session.
    #[error("remote error: {0}")]
    Remote(String),

    /// The stream ended before the expected frame arrived.
    #[error("connection closed mid-session")]
    ConnectionClosed,
}

/// Convenience alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtoError>;
