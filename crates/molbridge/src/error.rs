//! Error types surfaced by the bridge.

use std::time::Duration;

use crate::supervisor::SpawnError;

/// Errors returned to whoever constructs the bridge or submits a request.
///
/// `Launch` and `Startup` abort bridge construction. Every other variant is
/// returned to the single caller whose request it concerns.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("failed to launch worker: {0}")]
    Launch(#[from] SpawnError),

    #[error("worker startup failed: {0}")]
    Startup(String),

    #[error("failed to serialize request: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("worker did not reply within {0:?}")]
    Timeout(Duration),

    #[error("bridge is closed")]
    Closed,

    #[error("worker is gone: {0}")]
    WorkerExited(String),

    #[error("failed to write to worker: {0}")]
    Transport(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A worker output line that could not be turned into a reply frame.
///
/// Recovered locally by the dispatcher: logged, then the line is dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("line exceeds {max} bytes")]
    LineTooLong { max: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}
