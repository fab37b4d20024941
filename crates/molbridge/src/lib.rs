//! molbridge: multiplex concurrent requests onto one long-lived worker process
//! over its stdin/stdout.

mod client;
mod config;
mod dispatcher;
mod error;
mod pending;
mod sender;
mod status;
mod supervisor;

pub mod bridge;

pub use client::{Bridge, WorkerClient};

pub use bridge::codec::{CodecError, JsonLinesCodec};
pub use bridge::protocol::{CorrelationId, InboundFrame, OutboundFrame};
pub use config::{
    BridgeConfig, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_LINE_BYTES, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_REQUEST_TIMEOUT, DEFAULT_STARTUP_GRACE, Handshake, StderrMode, WorkerCommand,
};
pub use error::{BridgeError, ProtocolError};
pub use pending::{PendingGuard, PendingSlot, PendingTable, SlotResult};
pub use status::BridgeStatus;
pub use supervisor::{
    CommandSpawner, ProcessState, SpawnError, WorkerPipes, WorkerProcess, WorkerSpawner,
};
