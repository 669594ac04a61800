//! # ouro-wire
//!
//! Byte-level codecs for the Ouroboros node-to-node wire protocol.
//!
//! This crate provides:
//! - Mux segment (SDU) framing over a TCP byte stream
//! - Definite-length CBOR encoding and a dynamic-value CBOR decoder
//!
//! No I/O happens here; the codecs operate on in-memory buffers and plug
//! into `tokio_util::codec` framing at the transport layer.

pub mod cbor;
mod error;
mod mux;

pub use cbor::Value;
pub use error::{WireError, WireResult};
pub use mux::{Mode, SduCodec, Segment, SDU_HEADER_SIZE};

/// Maximum payload carried by a single mux segment.
pub const MAX_SEGMENT_PAYLOAD: usize = 65_535;

/// Maximum mini-protocol id (15-bit field).
pub const MAX_PROTOCOL_ID: u16 = 0x7FFF;
