//! Wire protocol error types.

use thiserror::Error;

/// Result type alias for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors that can occur while speaking the Gridway wire protocol.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out waiting for peer")]
    Timeout,

    #[error("frame of {0} bytes exceeds the {1} byte limit")]
    FrameTooLarge(usize, usize),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("malformed message: {0}")]
    Decode(String),

    #[error("malformed claim grant: {0}")]
    MalformedClaim(String),
}
