//! Wire frames exchanged with the worker over stdin/stdout.
//!
//! One JSON object per line in each direction:
//! - parent -> worker: `{"id": "<string>", "msg": "<string>"}`
//! - worker -> parent: `{"id": "<string>", "reply": "<string>"}`
//!
//! Payloads are opaque strings. The bridge never looks inside them.

use std::borrow::Borrow;

use serde::{Deserialize, Serialize};

/// Join key between an outbound request and its reply.
///
/// Minted as UUID v4 text so ids are unique for the lifetime of a session.
/// Inbound ids are accepted as arbitrary strings: an id the bridge never
/// issued is simply not found in the pending table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request line written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub id: CorrelationId,
    #[serde(rename = "msg")]
    pub payload: String,
}

impl OutboundFrame {
    pub fn new(id: CorrelationId, payload: impl Into<String>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }
}

/// Reply line read from the worker's stdout. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundFrame {
    pub id: CorrelationId,
    pub reply: String,
}

impl InboundFrame {
    pub fn new(id: CorrelationId, reply: impl Into<String>) -> Self {
        Self {
            id,
            reply: reply.into(),
        }
    }
}
