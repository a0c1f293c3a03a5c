//! Server → web client events.
//!
//! These frames travel over every subscribed web-client stream. Fan-out is
//! best-effort: a subscriber that cannot keep up misses events rather than
//! stalling the producers. Per-subscriber ordering is preserved.

use serde::{Deserialize, Serialize};

use crate::types::{
    ExecutionStatus, JobStatus, MachineStatus, MetricsPayload, PortInfo, SecurityEventPayload,
};

/// Job-level progress snapshot carried by `job_updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub total_targets: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub running: usize,
}

/// Per-target state snapshot carried by `job_execution_updated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionUpdate {
    pub execution_id: String,
    pub job_id: String,
    pub machine_id: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Everything the server can push to a subscribed web client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    MachineRegistered {
        machine_id: String,
        hostname: String,
        ip: String,
    },

    MachineStatusChanged {
        machine_id: String,
        status: MachineStatus,
    },

    /// Liveness tick, emitted at most once per broadcast interval per
    /// machine.
    MachineHeartbeat {
        machine_id: String,
        timestamp: String,
    },

    MachineMetrics {
        machine_id: String,
        metrics: MetricsPayload,
    },

    PortsUpdated {
        machine_id: String,
        ports: Vec<PortInfo>,
    },

    SecurityEvent {
        machine_id: String,
        event: SecurityEventPayload,
    },

    AuditLog {
        event: String,
        #[serde(default)]
        user_id: Option<String>,
        #[serde(default)]
        machine_id: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        details: Option<serde_json::Value>,
        timestamp: String,
    },

    ScanCompleted {
        machine_id: String,
        #[serde(default)]
        details: Option<serde_json::Value>,
    },

    ScanProgress {
        machine_id: String,
        #[serde(default)]
        progress: Option<serde_json::Value>,
    },

    SecurityEventsResolved {
        machine_id: String,
        event_ids: Vec<String>,
    },

    /// Normalized command output streamed while an execution runs.
    CommandOutput {
        command_id: String,
        machine_id: String,
        output: String,
    },

    CommandCompleted {
        command_id: String,
        machine_id: String,
        #[serde(default)]
        exit_code: Option<i32>,
    },

    /// Verbatim terminal output — never normalized, the browser-side
    /// emulator interprets control bytes itself.
    TerminalOutput {
        session_id: String,
        machine_id: String,
        output: String,
    },

    TerminalSessionCreated {
        session_id: String,
        machine_id: String,
        expires_at: u64,
    },

    JobUpdated { job: JobProgress },

    JobExecutionUpdated { execution: ExecutionUpdate },

    JobExecutionOutput {
        job_id: String,
        execution_id: String,
        machine_id: String,
        output: String,
    },

    /// Direct error frame for protocol issues on this client's stream.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tags_match_wire_names() {
        let ev = ServerEvent::MachineStatusChanged {
            machine_id: "m1".into(),
            status: MachineStatus::Offline,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "machine_status_changed");
        assert_eq!(json["machineId"], "m1");
        assert_eq!(json["status"], "offline");
    }

    #[test]
    fn job_updated_carries_progress_counts() {
        let ev = ServerEvent::JobUpdated {
            job: JobProgress {
                job_id: "j1".into(),
                status: JobStatus::Running,
                total_targets: 4,
                succeeded: 1,
                failed: 1,
                skipped: 0,
                running: 2,
            },
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "job_updated");
        assert_eq!(json["job"]["totalTargets"], 4);
        assert_eq!(json["job"]["status"], "RUNNING");
    }
}
