//! Shared payload structs and status enums.
//!
//! These types appear both on the wire and in persisted rows, so the
//! serde renames here define the canonical external spelling.

use serde::{Deserialize, Serialize};

/// Connectivity status of a managed machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    Online,
    Offline,
}

/// Job-level status. Transitions are strictly forward:
/// `Pending → Running → {Success, Failed, Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }
}

/// Per-target execution status. Transitions are strictly forward:
/// `Pending → Running → {Success, Failed, Skipped, Aborted}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Bulk-command dispatch strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Parallel,
    Rolling,
}

/// How a job's target set was specified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Adhoc,
    Group,
    Dynamic,
}

/// Resource metrics reported by an agent, either inside a heartbeat or as
/// a standalone `metrics` message. Agents on older builds omit fields, so
/// everything defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsPayload {
    pub cpu_usage: f64,
    pub ram_usage: f64,
    pub ram_used: u64,
    pub ram_total: u64,
    pub disk_usage: f64,
    pub disk_used: u64,
    pub disk_total: u64,
    pub uptime: u64,
}

/// A single listening port observed on a machine.
/// `(machine, port, proto)` is the identity; everything else is refreshed
/// on each sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    pub port: u16,
    #[serde(default = "default_proto")]
    pub proto: String,
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

fn default_proto() -> String {
    "tcp".to_string()
}

/// A security finding reported by an agent and fanned out to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEventPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_serialize_to_wire_spelling() {
        assert_eq!(serde_json::to_string(&MachineStatus::Online).unwrap(), "\"online\"");
        assert_eq!(serde_json::to_string(&JobStatus::Pending).unwrap(), "\"PENDING\"");
        assert_eq!(serde_json::to_string(&ExecutionStatus::Skipped).unwrap(), "\"SKIPPED\"");
        assert_eq!(serde_json::to_string(&JobMode::Rolling).unwrap(), "\"rolling\"");
    }

    #[test]
    fn execution_terminality() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(ExecutionStatus::Aborted.is_terminal());
    }

    #[test]
    fn metrics_payload_tolerates_sparse_input() {
        let m: MetricsPayload = serde_json::from_str(r#"{"cpuUsage": 42.0}"#).unwrap();
        assert_eq!(m.cpu_usage, 42.0);
        assert_eq!(m.ram_total, 0);
    }

    #[test]
    fn port_proto_defaults_to_tcp() {
        let p: PortInfo = serde_json::from_str(r#"{"port": 22}"#).unwrap();
        assert_eq!(p.proto, "tcp");
        assert!(p.service.is_none());
    }
}
