//! # ouro-tests
//!
//! Integration tests for the ouro probe.
//!
//! This crate provides a scripted in-process relay speaking real mux/CBOR
//! frames, plus end-to-end tests covering handshake acceptance and
//! refusal, tip delivery, peer sharing, timeouts, and oversize rejection.

pub mod harness;

#[cfg(test)]
mod session_tests;

pub use harness::*;
