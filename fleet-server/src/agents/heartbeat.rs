//! Per-machine heartbeat throttles.
//!
//! Four independent gates per machine — status, metrics, ports, broadcast —
//! each with its own minimum interval. Work tied to a field happens only
//! when its gate has elapsed, which bounds store write pressure no matter
//! how often an agent heartbeats.

use std::time::Instant;

use dashmap::DashMap;

use crate::config::HeartbeatIntervals;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Status,
    Metrics,
    Ports,
    Broadcast,
}

#[derive(Debug, Default, Clone, Copy)]
struct Gates {
    status: Option<Instant>,
    metrics: Option<Instant>,
    ports: Option<Instant>,
    broadcast: Option<Instant>,
}

pub struct HeartbeatThrottle {
    intervals: HeartbeatIntervals,
    gates: DashMap<String, Gates>,
}

impl HeartbeatThrottle {
    pub fn new(intervals: HeartbeatIntervals) -> Self {
        Self {
            intervals,
            gates: DashMap::new(),
        }
    }

    pub fn status_due(&self, machine_id: &str) -> bool {
        self.due_at(machine_id, Gate::Status, Instant::now())
    }

    pub fn metrics_due(&self, machine_id: &str) -> bool {
        self.due_at(machine_id, Gate::Metrics, Instant::now())
    }

    pub fn ports_due(&self, machine_id: &str) -> bool {
        self.due_at(machine_id, Gate::Ports, Instant::now())
    }

    pub fn broadcast_due(&self, machine_id: &str) -> bool {
        self.due_at(machine_id, Gate::Broadcast, Instant::now())
    }

    /// Checks one gate and, when due, stamps it with `now`.
    pub(crate) fn due_at(&self, machine_id: &str, gate: Gate, now: Instant) -> bool {
        let mut gates = self.gates.entry(machine_id.to_string()).or_default();
        let (last, interval) = match gate {
            Gate::Status => (&mut gates.status, self.intervals.status),
            Gate::Metrics => (&mut gates.metrics, self.intervals.metrics),
            Gate::Ports => (&mut gates.ports, self.intervals.ports),
            Gate::Broadcast => (&mut gates.broadcast, self.intervals.broadcast),
        };
        let due = match *last {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= interval,
        };
        if due {
            *last = Some(now);
        }
        due
    }

    pub fn remove(&self, machine_id: &str) {
        self.gates.remove(machine_id);
    }
}
