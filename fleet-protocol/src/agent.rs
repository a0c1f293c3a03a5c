//! Messages exchanged with agents over the `/ws/agent` stream.
//!
//! The `#[serde(tag = "type")]` attribute means each variant is serialized
//! as a JSON object with a `"type"` field whose value is the snake_case
//! variant name, with camelCase payload keys — the format deployed agents
//! already speak.

use serde::{Deserialize, Serialize};

use crate::envelope::SecureEnvelope;
use crate::types::{MetricsPayload, PortInfo, SecurityEventPayload};

/// All messages an agent may send to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentMessage {
    /// First message on every agent stream. The server authenticates the
    /// 64-hex-char secret, creates or refreshes the machine row, and
    /// responds with [`AgentBound::Registered`].
    Register {
        secret_key: String,
        hostname: String,
        ip: String,
        #[serde(default)]
        os_info: String,
    },

    /// Periodic liveness report. May carry fresh metrics and/or the
    /// currently-open ports; each sub-update is gated by its own
    /// server-side throttle interval.
    Heartbeat {
        #[serde(default)]
        metrics: Option<MetricsPayload>,
        #[serde(default)]
        ports: Option<Vec<PortInfo>>,
    },

    /// Streamed output and completion signal for a dispatched command.
    CommandResponse {
        #[serde(default)]
        command_id: Option<String>,
        #[serde(default)]
        machine_id: Option<String>,
        #[serde(default)]
        output: Option<String>,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        completed: bool,
    },

    /// Raw terminal output for an interactive session. Never normalized —
    /// the web-side terminal emulator interprets control bytes and ANSI
    /// sequences itself. The HMAC triple is optional; when present the
    /// server authenticates the frame before fan-out.
    TerminalOutput {
        session_id: String,
        #[serde(default)]
        machine_id: Option<String>,
        output: String,
        #[serde(default)]
        hmac: Option<String>,
        #[serde(default)]
        nonce: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },

    /// Standalone port scan result, outside the heartbeat cadence.
    PortDiscovery {
        #[serde(default)]
        machine_id: Option<String>,
        ports: Vec<PortInfo>,
    },

    /// Standalone metric submission, throttled like heartbeat metrics.
    Metrics { metrics: MetricsPayload },

    /// Security finding, forwarded to subscribed web clients.
    SecurityEvent { event: SecurityEventPayload },
}

/// All messages the server may send to an agent.
///
/// The four interactive variants carry a [`SecureEnvelope`]; `update_agent`
/// and `trigger_scan` are idempotent administrative pokes and travel bare.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AgentBound {
    /// Registration acknowledgment carrying the server-assigned machine id.
    Registered { machine_id: String },

    SpawnShell {
        #[serde(flatten)]
        envelope: SecureEnvelope,
    },

    TerminalStdin {
        #[serde(flatten)]
        envelope: SecureEnvelope,
    },

    TerminalResize {
        #[serde(flatten)]
        envelope: SecureEnvelope,
    },

    ExecuteCommand {
        #[serde(flatten)]
        envelope: SecureEnvelope,
    },

    UpdateAgent { machine_id: String },

    TriggerScan {
        machine_id: String,
        #[serde(default)]
        scan_type: Option<String>,
    },
}

/// Structured error frame sent before closing a misbehaving stream.
/// This frame intentionally has no `type` discriminant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolViolation {
    pub error: String,
    pub action: String,
}

impl ProtocolViolation {
    /// The response to a frame missing its `type` field.
    pub fn missing_type() -> Self {
        Self {
            error: "Protocol violation: type field required".to_string(),
            action: "update_agent".to_string(),
        }
    }

    pub fn registration(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            action: "register".to_string(),
        }
    }
}
