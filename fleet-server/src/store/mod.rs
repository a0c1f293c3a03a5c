//! Persistence abstraction.
//!
//! The durable engine itself is an external collaborator; the control plane
//! only consumes this narrow record-store interface. [`memory::MemoryStore`]
//! implements it for single-node operation and tests.
//!
//! Two operations carry extra contracts: [`Store::sync_ports`] must apply
//! the upserts and the stale-delete as one atomic batch (so a just-seen
//! port never appears absent), and the execution mutators must refuse
//! backward status transitions.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use fleet_protocol::{
    ExecutionStatus, JobMode, JobStatus, MachineStatus, MetricsPayload, PortInfo,
    SecurityEventPayload, TargetType,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A managed machine row.
///
/// `secret_hash` is the SHA-256 of the agent's registration secret;
/// `encrypted_secret` is AES-256-GCM ciphertext of the same plaintext.
/// Both are maintained together and never serialized outward.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Machine {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub os_info: String,
    pub status: MachineStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub encrypted_secret: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    pub role: Option<String>,
    pub tags: std::collections::HashMap<String, String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRow {
    pub machine_id: String,
    #[serde(flatten)]
    pub metrics: MetricsPayload,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRow {
    pub machine_id: String,
    pub port: u16,
    pub proto: String,
    pub service: Option<String>,
    pub state: Option<String>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRow {
    pub id: String,
    pub command: String,
    pub mode: JobMode,
    pub status: JobStatus,
    pub target_type: TargetType,
    pub total_targets: usize,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRow {
    pub id: String,
    pub job_id: String,
    pub machine_id: String,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    /// Append-only; output only grows.
    pub output: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRow {
    pub id: String,
    pub event: String,
    pub user_id: Option<String>,
    pub machine_id: Option<String>,
    pub session_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityEventRow {
    pub id: String,
    pub machine_id: String,
    pub event: SecurityEventPayload,
    pub resolved: bool,
    pub timestamp: DateTime<Utc>,
}

/// The record-store interface the control plane consumes.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    // ── Machines ────────────────────────────────────────────────

    async fn machine_by_id(&self, id: &str) -> StoreResult<Option<Machine>>;
    async fn machine_by_secret_hash(&self, hash: &str) -> StoreResult<Option<Machine>>;
    async fn machine_by_endpoint(&self, hostname: &str, ip: &str) -> StoreResult<Option<Machine>>;
    async fn upsert_machine(&self, machine: Machine) -> StoreResult<()>;
    async fn set_machine_status(
        &self,
        id: &str,
        status: MachineStatus,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()>;
    async fn delete_machine(&self, id: &str) -> StoreResult<()>;
    async fn all_machines(&self) -> StoreResult<Vec<Machine>>;

    // ── Metrics ─────────────────────────────────────────────────

    async fn append_metric(&self, row: MetricRow) -> StoreResult<()>;
    async fn latest_metric_for(&self, machine_id: &str) -> StoreResult<Option<MetricRow>>;
    async fn latest_metrics(&self) -> StoreResult<Vec<MetricRow>>;

    // ── Ports ───────────────────────────────────────────────────

    /// Upserts every sighted port and deletes this machine's rows unseen
    /// since `stale_before`, as one atomic batch. Returns the surviving
    /// rows for the machine.
    async fn sync_ports(
        &self,
        machine_id: &str,
        ports: &[PortInfo],
        seen_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Vec<PortRow>>;
    async fn ports_for(&self, machine_id: &str) -> StoreResult<Vec<PortRow>>;
    async fn all_ports(&self) -> StoreResult<Vec<PortRow>>;

    // ── Jobs & executions ───────────────────────────────────────

    async fn insert_job(&self, job: JobRow) -> StoreResult<()>;
    async fn job_by_id(&self, id: &str) -> StoreResult<Option<JobRow>>;
    async fn all_jobs(&self) -> StoreResult<Vec<JobRow>>;
    /// Forward-only; a terminal job row is never modified.
    async fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn insert_execution(&self, row: ExecutionRow) -> StoreResult<()>;
    async fn execution_by_id(&self, id: &str) -> StoreResult<Option<ExecutionRow>>;
    async fn executions_for_job(&self, job_id: &str) -> StoreResult<Vec<ExecutionRow>>;
    /// Pending → Running only; anything else is left untouched.
    async fn mark_execution_running(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()>;
    /// Moves a non-terminal execution to a terminal status. Returns the
    /// row as stored afterwards; an already-terminal row is returned
    /// unchanged (no backward transitions).
    async fn mark_execution_terminal(
        &self,
        id: &str,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<ExecutionRow>;
    async fn append_execution_output(&self, id: &str, chunk: &str) -> StoreResult<()>;

    // ── Audit & security events ─────────────────────────────────

    async fn insert_audit(&self, row: AuditRow) -> StoreResult<()>;
    async fn recent_audit(&self, limit: usize) -> StoreResult<Vec<AuditRow>>;

    async fn append_security_event(&self, row: SecurityEventRow) -> StoreResult<()>;
    async fn recent_security_events(&self, limit: usize) -> StoreResult<Vec<SecurityEventRow>>;
    /// Marks the given events resolved; returns the ids actually flipped.
    async fn resolve_security_events(
        &self,
        machine_id: &str,
        event_ids: &[String],
    ) -> StoreResult<Vec<String>>;

    // ── Access control ──────────────────────────────────────────

    async fn grant_access(&self, user_id: &str, machine_id: &str) -> StoreResult<()>;
    async fn revoke_access(&self, user_id: &str, machine_id: &str) -> StoreResult<()>;
    async fn user_can_access(&self, user_id: &str, machine_id: &str) -> StoreResult<bool>;
}
