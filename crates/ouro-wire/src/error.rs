//! Wire codec error types.

use thiserror::Error;

/// Wire-level errors.
#[derive(Error, Debug)]
pub enum WireError {
    /// Segment payload exceeds the 16-bit length field.
    #[error("Payload too large: {size} bytes, max {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    /// Malformed mux header.
    #[error("Framing error: {0}")]
    Framing(String),

    /// CBOR decode failure or unsupported shape.
    #[error("CBOR error: {0}")]
    Cbor(String),

    /// I/O error surfaced through the framed transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;
