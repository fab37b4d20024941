//! Point-in-time status of a bridge, for health endpoints and logs.

use serde::{Deserialize, Serialize};

use crate::supervisor::ProcessState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub state: ProcessState,
    /// None for bridges attached to an in-process transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Requests registered and not yet resolved.
    pub pending: usize,
    /// When the bridge was started (ISO 8601 format).
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_cause: Option<String>,
}

impl BridgeStatus {
    /// Whether new requests can currently be served.
    pub fn is_available(&self) -> bool {
        self.state == ProcessState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn running_status_serializes() {
        let status = BridgeStatus {
            state: ProcessState::Running,
            pid: Some(4242),
            pending: 3,
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
            exit_cause: None,
        };
        assert!(status.is_available());
        insta::assert_json_snapshot!(status, @r#"
        {
          "state": "RUNNING",
          "pid": 4242,
          "pending": 3,
          "started_at": "2026-01-01T00:00:00+00:00"
        }
        "#);
    }

    #[test]
    fn terminated_status_carries_exit_cause() {
        let status = BridgeStatus {
            state: ProcessState::Terminated,
            pid: None,
            pending: 0,
            started_at: "2026-01-01T00:00:00+00:00".to_string(),
            exit_cause: Some("exit status: 3".to_string()),
        };
        assert!(!status.is_available());
        insta::assert_json_snapshot!(status, @r#"
        {
          "state": "TERMINATED",
          "pending": 0,
          "started_at": "2026-01-01T00:00:00+00:00",
          "exit_cause": "exit status: 3"
        }
        "#);
    }
}
