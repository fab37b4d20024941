//! Wire format for parent-worker communication.
//!
//! # Architecture
//!
//! - **protocol**: Frame types (`OutboundFrame`, `InboundFrame`) and `CorrelationId`
//! - **codec**: Newline-delimited JSON codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
