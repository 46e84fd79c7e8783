//! Wire layer for parent-worker communication.
//!
//! # Architecture
//!
//! - **protocol**: Envelope types (CallEnvelope, ResponseEnvelope, Handshake)
//! - **codec**: Line encode/decode and the newline framing codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
