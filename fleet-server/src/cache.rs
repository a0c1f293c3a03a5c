//! # State Cache
//!
//! A write-through, read-optimized projection of machines and their
//! observables. Every writer updates the store first and this cache second;
//! reads never touch the store. The cache is not authoritative — on process
//! restart it is re-warmed with one query per table.
//!
//! Mutations are single-writer per machine id: the handler owning that
//! agent's connection, or the orchestrator for status-level updates.

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;

use crate::store::{Machine, MetricRow, PortRow, SecurityEventRow, Store, StoreResult};
use fleet_protocol::MachineStatus;

/// A machine together with its cached observables, as served to the query
/// API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineView {
    #[serde(flatten)]
    pub machine: Machine,
    pub latest_metric: Option<MetricRow>,
    pub ports: Vec<PortRow>,
}

#[derive(Default)]
pub struct StateCache {
    machines: DashMap<String, Machine>,
    latest_metrics: DashMap<String, MetricRow>,
    ports: DashMap<String, Vec<PortRow>>,
    security_events: RwLock<Vec<SecurityEventRow>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// One query per table at startup.
    pub async fn warm(&self, store: &dyn Store) -> StoreResult<()> {
        for machine in store.all_machines().await? {
            self.machines.insert(machine.id.clone(), machine);
        }
        for row in store.latest_metrics().await? {
            self.latest_metrics.insert(row.machine_id.clone(), row);
        }
        for row in store.all_ports().await? {
            self.ports
                .entry(row.machine_id.clone())
                .or_default()
                .push(row);
        }
        *self.security_events.write() = store.recent_security_events(100).await?;
        Ok(())
    }

    // ── Writers ─────────────────────────────────────────────────

    pub fn upsert_machine(&self, machine: Machine) {
        self.machines.insert(machine.id.clone(), machine);
    }

    pub fn update_machine_status(&self, machine_id: &str, status: MachineStatus) {
        if let Some(mut m) = self.machines.get_mut(machine_id) {
            m.status = status;
            m.last_seen = chrono::Utc::now();
        }
    }

    pub fn update_metric(&self, row: MetricRow) {
        self.latest_metrics.insert(row.machine_id.clone(), row);
    }

    pub fn update_ports(&self, machine_id: &str, rows: Vec<PortRow>) {
        self.ports.insert(machine_id.to_string(), rows);
    }

    pub fn set_offline(&self, machine_id: &str) {
        self.update_machine_status(machine_id, MachineStatus::Offline);
    }

    pub fn refresh_security_events(&self, rows: Vec<SecurityEventRow>) {
        *self.security_events.write() = rows;
    }

    pub fn delete_machine(&self, machine_id: &str) {
        self.machines.remove(machine_id);
        self.latest_metrics.remove(machine_id);
        self.ports.remove(machine_id);
    }

    // ── Readers (O(1), never touch the store) ───────────────────

    pub fn machine(&self, machine_id: &str) -> Option<Machine> {
        self.machines.get(machine_id).map(|m| m.value().clone())
    }

    pub fn machines(&self) -> Vec<Machine> {
        self.machines.iter().map(|m| m.value().clone()).collect()
    }

    pub fn latest_metric(&self, machine_id: &str) -> Option<MetricRow> {
        self.latest_metrics.get(machine_id).map(|m| m.value().clone())
    }

    pub fn ports(&self, machine_id: &str) -> Vec<PortRow> {
        self.ports
            .get(machine_id)
            .map(|p| p.value().clone())
            .unwrap_or_default()
    }

    pub fn security_events(&self) -> Vec<SecurityEventRow> {
        self.security_events.read().clone()
    }

    pub fn view(&self, machine_id: &str) -> Option<MachineView> {
        let machine = self.machine(machine_id)?;
        Some(MachineView {
            latest_metric: self.latest_metric(machine_id),
            ports: self.ports(machine_id),
            machine,
        })
    }

    pub fn views(&self) -> Vec<MachineView> {
        self.machines
            .iter()
            .map(|m| MachineView {
                latest_metric: self.latest_metric(m.key()),
                ports: self.ports(m.key()),
                machine: m.value().clone(),
            })
            .collect()
    }
}
