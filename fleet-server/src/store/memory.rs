//! In-memory record store.
//!
//! Registries use [`DashMap`] for lock-free concurrent access, the same way
//! the connection managers keep their own state. The port table nests a
//! per-machine map behind one entry so `sync_ports` is naturally atomic for
//! a machine: the upserts and the stale-delete happen under a single entry
//! guard.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use fleet_protocol::{ExecutionStatus, MachineStatus, PortInfo};
use parking_lot::Mutex;

use super::{
    AuditRow, ExecutionRow, JobRow, Machine, MetricRow, PortRow, SecurityEventRow, Store,
    StoreError, StoreResult,
};

#[derive(Default)]
pub struct MemoryStore {
    machines: DashMap<String, Machine>,
    metrics: DashMap<String, Vec<MetricRow>>,
    ports: DashMap<String, HashMap<(u16, String), PortRow>>,
    jobs: DashMap<String, JobRow>,
    executions: DashMap<String, ExecutionRow>,
    audit: Mutex<Vec<AuditRow>>,
    security_events: Mutex<Vec<SecurityEventRow>>,
    grants: Mutex<HashSet<(String, String)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn machine_by_id(&self, id: &str) -> StoreResult<Option<Machine>> {
        Ok(self.machines.get(id).map(|m| m.value().clone()))
    }

    async fn machine_by_secret_hash(&self, hash: &str) -> StoreResult<Option<Machine>> {
        Ok(self
            .machines
            .iter()
            .find(|m| m.secret_hash == hash)
            .map(|m| m.value().clone()))
    }

    async fn machine_by_endpoint(&self, hostname: &str, ip: &str) -> StoreResult<Option<Machine>> {
        Ok(self
            .machines
            .iter()
            .find(|m| m.hostname == hostname && m.ip == ip)
            .map(|m| m.value().clone()))
    }

    async fn upsert_machine(&self, machine: Machine) -> StoreResult<()> {
        self.machines.insert(machine.id.clone(), machine);
        Ok(())
    }

    async fn set_machine_status(
        &self,
        id: &str,
        status: MachineStatus,
        last_seen: DateTime<Utc>,
    ) -> StoreResult<()> {
        let mut machine = self
            .machines
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("machine {id}")))?;
        machine.status = status;
        machine.last_seen = last_seen;
        Ok(())
    }

    async fn delete_machine(&self, id: &str) -> StoreResult<()> {
        self.machines.remove(id);
        self.metrics.remove(id);
        self.ports.remove(id);
        Ok(())
    }

    async fn all_machines(&self) -> StoreResult<Vec<Machine>> {
        Ok(self.machines.iter().map(|m| m.value().clone()).collect())
    }

    async fn append_metric(&self, row: MetricRow) -> StoreResult<()> {
        self.metrics
            .entry(row.machine_id.clone())
            .or_default()
            .push(row);
        Ok(())
    }

    async fn latest_metric_for(&self, machine_id: &str) -> StoreResult<Option<MetricRow>> {
        Ok(self
            .metrics
            .get(machine_id)
            .and_then(|v| v.last().cloned()))
    }

    async fn latest_metrics(&self) -> StoreResult<Vec<MetricRow>> {
        Ok(self
            .metrics
            .iter()
            .filter_map(|e| e.value().last().cloned())
            .collect())
    }

    async fn sync_ports(
        &self,
        machine_id: &str,
        ports: &[PortInfo],
        seen_at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> StoreResult<Vec<PortRow>> {
        let mut entry = self.ports.entry(machine_id.to_string()).or_default();
        for p in ports {
            entry.insert(
                (p.port, p.proto.clone()),
                PortRow {
                    machine_id: machine_id.to_string(),
                    port: p.port,
                    proto: p.proto.clone(),
                    service: p.service.clone(),
                    state: p.state.clone(),
                    last_seen: seen_at,
                },
            );
        }
        entry.retain(|_, row| row.last_seen >= stale_before);
        let mut rows: Vec<PortRow> = entry.values().cloned().collect();
        rows.sort_by_key(|r| (r.port, r.proto.clone()));
        Ok(rows)
    }

    async fn ports_for(&self, machine_id: &str) -> StoreResult<Vec<PortRow>> {
        let mut rows: Vec<PortRow> = self
            .ports
            .get(machine_id)
            .map(|e| e.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| (r.port, r.proto.clone()));
        Ok(rows)
    }

    async fn all_ports(&self) -> StoreResult<Vec<PortRow>> {
        Ok(self
            .ports
            .iter()
            .flat_map(|e| e.values().cloned().collect::<Vec<_>>())
            .collect())
    }

    async fn insert_job(&self, job: JobRow) -> StoreResult<()> {
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn job_by_id(&self, id: &str) -> StoreResult<Option<JobRow>> {
        Ok(self.jobs.get(id).map(|j| j.value().clone()))
    }

    async fn all_jobs(&self) -> StoreResult<Vec<JobRow>> {
        let mut jobs: Vec<JobRow> = self.jobs.iter().map(|j| j.value().clone()).collect();
        jobs.sort_by_key(|j| std::cmp::Reverse(j.created_at));
        Ok(jobs)
    }

    async fn update_job_status(
        &self,
        id: &str,
        status: fleet_protocol::JobStatus,
        started_at: Option<DateTime<Utc>>,
        completed_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut job = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("job {id}")))?;
        if job.status.is_terminal() {
            return Ok(());
        }
        job.status = status;
        if started_at.is_some() {
            job.started_at = started_at;
        }
        if completed_at.is_some() {
            job.completed_at = completed_at;
        }
        Ok(())
    }

    async fn insert_execution(&self, row: ExecutionRow) -> StoreResult<()> {
        self.executions.insert(row.id.clone(), row);
        Ok(())
    }

    async fn execution_by_id(&self, id: &str) -> StoreResult<Option<ExecutionRow>> {
        Ok(self.executions.get(id).map(|e| e.value().clone()))
    }

    async fn executions_for_job(&self, job_id: &str) -> StoreResult<Vec<ExecutionRow>> {
        let mut rows: Vec<ExecutionRow> = self
            .executions
            .iter()
            .filter(|e| e.job_id == job_id)
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows)
    }

    async fn mark_execution_running(&self, id: &str, at: DateTime<Utc>) -> StoreResult<()> {
        let mut row = self
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        if row.status == ExecutionStatus::Pending {
            row.status = ExecutionStatus::Running;
            row.started_at = Some(at);
        }
        Ok(())
    }

    async fn mark_execution_terminal(
        &self,
        id: &str,
        status: ExecutionStatus,
        exit_code: Option<i32>,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> StoreResult<ExecutionRow> {
        let mut row = self
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        if row.status.is_terminal() {
            return Ok(row.clone());
        }
        row.status = status;
        row.exit_code = exit_code;
        row.error = error;
        row.completed_at = Some(at);
        Ok(row.clone())
    }

    async fn append_execution_output(&self, id: &str, chunk: &str) -> StoreResult<()> {
        let mut row = self
            .executions
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {id}")))?;
        row.output.push_str(chunk);
        Ok(())
    }

    async fn insert_audit(&self, row: AuditRow) -> StoreResult<()> {
        self.audit.lock().push(row);
        Ok(())
    }

    async fn recent_audit(&self, limit: usize) -> StoreResult<Vec<AuditRow>> {
        let audit = self.audit.lock();
        Ok(audit.iter().rev().take(limit).cloned().collect())
    }

    async fn append_security_event(&self, row: SecurityEventRow) -> StoreResult<()> {
        self.security_events.lock().push(row);
        Ok(())
    }

    async fn recent_security_events(&self, limit: usize) -> StoreResult<Vec<SecurityEventRow>> {
        let events = self.security_events.lock();
        Ok(events.iter().rev().take(limit).cloned().collect())
    }

    async fn resolve_security_events(
        &self,
        machine_id: &str,
        event_ids: &[String],
    ) -> StoreResult<Vec<String>> {
        let mut events = self.security_events.lock();
        let mut flipped = Vec::new();
        for row in events.iter_mut() {
            if row.machine_id == machine_id && !row.resolved && event_ids.contains(&row.id) {
                row.resolved = true;
                flipped.push(row.id.clone());
            }
        }
        Ok(flipped)
    }

    async fn grant_access(&self, user_id: &str, machine_id: &str) -> StoreResult<()> {
        self.grants
            .lock()
            .insert((user_id.to_string(), machine_id.to_string()));
        Ok(())
    }

    async fn revoke_access(&self, user_id: &str, machine_id: &str) -> StoreResult<()> {
        self.grants
            .lock()
            .remove(&(user_id.to_string(), machine_id.to_string()));
        Ok(())
    }

    async fn user_can_access(&self, user_id: &str, machine_id: &str) -> StoreResult<bool> {
        Ok(self
            .grants
            .lock()
            .contains(&(user_id.to_string(), machine_id.to_string())))
    }
}
