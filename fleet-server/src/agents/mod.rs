//! # Agent Session Manager
//!
//! Owns each agent's full-duplex stream: parses, validates and routes
//! inbound messages, maintains the write-through projection of the agent's
//! observable state (status, latest metric, ports), and broadcasts change
//! notifications to subscribed web clients.
//!
//! ## Connection lifecycle
//!
//! 1. Upgrade, split the socket, spawn an outbound sender task draining an
//!    unbounded per-connection queue
//! 2. Require a `register` frame first; authenticate the secret and create
//!    or refresh the machine row
//! 3. Process frames in arrival order until the stream closes
//! 4. On disconnect: deregister, mark the machine offline in store and
//!    cache, broadcast the status change, and hand the machine to the
//!    orchestrator for disconnect-grace handling

pub mod heartbeat;

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::StateCache;
use crate::crypto::{sha256_hex, SecretVault};
use crate::events::EventBus;
use crate::jobs::JobOrchestrator;
use crate::normalize::normalize_chunk;
use crate::state::AppState;
use crate::store::{Machine, MetricRow, SecurityEventRow, Store};
use crate::terminal::TerminalService;
use fleet_protocol::{
    AgentBound, AgentMessage, MachineStatus, MetricsPayload, PortInfo, ProtocolViolation,
    SecureEnvelope, SecurityEventPayload, ServerEvent,
};
use heartbeat::HeartbeatThrottle;

/// Ports unseen for longer than this are pruned on the next sync.
const PORT_STALE_AFTER: Duration = Duration::from_secs(120);

/// String fields larger than this are truncated and logged.
const MAX_FIELD_BYTES: usize = 1024 * 1024;

/// One frame on an agent's outbound queue.
#[derive(Debug)]
pub enum AgentFrame {
    Bound(AgentBound),
    Violation(ProtocolViolation),
    Close { code: u16, reason: String },
}

pub type AgentTx = mpsc::UnboundedSender<AgentFrame>;

/// Information stored for each connected agent.
pub struct AgentHandle {
    pub tx: AgentTx,
    pub connected_at: Instant,
}

/// Registry of currently connected agents, keyed by machine id.
#[derive(Default)]
pub struct AgentRegistry {
    connections: DashMap<String, AgentHandle>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, machine_id: &str, tx: AgentTx) {
        self.connections.insert(
            machine_id.to_string(),
            AgentHandle {
                tx,
                connected_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, machine_id: &str) {
        self.connections.remove(machine_id);
    }

    pub fn is_connected(&self, machine_id: &str) -> bool {
        self.connections.contains_key(machine_id)
    }

    pub fn connected_count(&self) -> usize {
        self.connections.len()
    }

    /// Queues a message for the agent. False when the agent is not
    /// connected or its outbound queue is gone.
    pub fn send(&self, machine_id: &str, message: AgentBound) -> bool {
        match self.connections.get(machine_id) {
            Some(handle) => handle.tx.send(AgentFrame::Bound(message)).is_ok(),
            None => false,
        }
    }
}

/// What the connection loop should do after a frame was handled.
#[derive(Debug)]
pub enum FrameOutcome {
    Continue,
    /// Structured error, stream stays open.
    Respond(ProtocolViolation),
    /// Structured error, then close 1008.
    ViolationClose(ProtocolViolation),
    /// Unparsable frame, close 1002.
    UnparsableClose,
}

pub struct AgentSessionManager {
    pub registry: Arc<AgentRegistry>,
    store: Arc<dyn Store>,
    cache: Arc<StateCache>,
    bus: EventBus,
    vault: Arc<SecretVault>,
    terminal: Arc<TerminalService>,
    orchestrator: Arc<JobOrchestrator>,
    throttle: HeartbeatThrottle,
}

impl AgentSessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<AgentRegistry>,
        store: Arc<dyn Store>,
        cache: Arc<StateCache>,
        bus: EventBus,
        vault: Arc<SecretVault>,
        terminal: Arc<TerminalService>,
        orchestrator: Arc<JobOrchestrator>,
        throttle: HeartbeatThrottle,
    ) -> Self {
        Self {
            registry,
            store,
            cache,
            bus,
            vault,
            terminal,
            orchestrator,
            throttle,
        }
    }

    // ── Registration ────────────────────────────────────────────

    /// Authenticates a `register` message and creates or refreshes the
    /// machine row. The secret is stored encrypted (for later HMAC
    /// operations) alongside its hash (for authentication).
    pub async fn register(
        &self,
        tx: AgentTx,
        secret_key: &str,
        hostname: &str,
        ip: &str,
        os_info: &str,
    ) -> Result<Machine, String> {
        validate_register(secret_key, hostname, ip)?;

        let secret_hash = sha256_hex(secret_key.as_bytes());
        let encrypted_secret = self
            .vault
            .encrypt(secret_key)
            .map_err(|_| "secret encryption failed".to_string())?;

        let existing = self
            .store
            .machine_by_secret_hash(&secret_hash)
            .await
            .map_err(|e| e.to_string())?;
        let existing = match existing {
            Some(m) => Some(m),
            None => self
                .store
                .machine_by_endpoint(hostname, ip)
                .await
                .map_err(|e| e.to_string())?,
        };

        let machine = match existing {
            Some(mut machine) => {
                machine.hostname = hostname.to_string();
                machine.ip = ip.to_string();
                machine.os_info = os_info.to_string();
                machine.status = MachineStatus::Online;
                machine.last_seen = Utc::now();
                machine.secret_hash = secret_hash;
                machine.encrypted_secret = encrypted_secret;
                machine
            }
            None => Machine {
                id: Uuid::new_v4().to_string(),
                hostname: hostname.to_string(),
                ip: ip.to_string(),
                os_info: os_info.to_string(),
                status: MachineStatus::Online,
                last_seen: Utc::now(),
                encrypted_secret,
                secret_hash,
                role: None,
                tags: Default::default(),
                notes: None,
            },
        };

        self.store
            .upsert_machine(machine.clone())
            .await
            .map_err(|e| e.to_string())?;
        self.cache.upsert_machine(machine.clone());
        self.registry.insert(&machine.id, tx);

        info!(machine_id = %machine.id, hostname, ip, "agent registered");
        self.bus.publish(ServerEvent::MachineRegistered {
            machine_id: machine.id.clone(),
            hostname: machine.hostname.clone(),
            ip: machine.ip.clone(),
        });
        Ok(machine)
    }

    // ── Frame dispatch ──────────────────────────────────────────

    /// Parses and routes one inbound text frame from a registered agent.
    pub async fn handle_frame(&self, machine_id: &str, text: &str) -> FrameOutcome {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                warn!(machine_id, "unparsable frame from agent");
                return FrameOutcome::UnparsableClose;
            }
        };
        let Some(msg_type) = value.get("type").and_then(Value::as_str).map(str::to_string)
        else {
            warn!(machine_id, "frame without type discriminant");
            return FrameOutcome::ViolationClose(ProtocolViolation::missing_type());
        };

        let message: AgentMessage = match serde_json::from_value(value) {
            Ok(m) => m,
            Err(e) => {
                warn!(machine_id, msg_type, error = %e, "schema validation failed");
                return FrameOutcome::Respond(ProtocolViolation {
                    error: format!("Schema validation failed: {e}"),
                    action: msg_type,
                });
            }
        };

        self.handle_message(machine_id, message).await;
        FrameOutcome::Continue
    }

    async fn handle_message(&self, machine_id: &str, message: AgentMessage) {
        match message {
            AgentMessage::Register { .. } => {
                // Already registered on this stream; nothing to redo.
                debug!(machine_id, "duplicate register ignored");
            }
            AgentMessage::Heartbeat { metrics, ports } => {
                self.heartbeat(machine_id, metrics, ports).await;
            }
            AgentMessage::CommandResponse {
                command_id,
                machine_id: claimed,
                output,
                exit_code,
                completed,
            } => {
                if let Some(claimed) = claimed {
                    if claimed != machine_id {
                        warn!(machine_id, claimed, "command response claims foreign machine");
                    }
                }
                self.command_response(machine_id, command_id, output, exit_code, completed)
                    .await;
            }
            AgentMessage::TerminalOutput {
                session_id,
                machine_id: _,
                output,
                hmac,
                nonce,
                timestamp,
            } => {
                self.terminal_output(machine_id, session_id, output, hmac, nonce, timestamp)
                    .await;
            }
            AgentMessage::PortDiscovery { machine_id: _, ports } => {
                self.sync_ports(machine_id, &ports).await;
            }
            AgentMessage::Metrics { metrics } => {
                if self.throttle.metrics_due(machine_id) {
                    self.record_metric(machine_id, metrics).await;
                }
            }
            AgentMessage::SecurityEvent { event } => {
                self.security_event(machine_id, event).await;
            }
        }
    }

    // ── Heartbeat ───────────────────────────────────────────────

    async fn heartbeat(
        &self,
        machine_id: &str,
        metrics: Option<MetricsPayload>,
        ports: Option<Vec<PortInfo>>,
    ) {
        let now = Utc::now();

        if self.throttle.status_due(machine_id) {
            if let Err(e) = self
                .store
                .set_machine_status(machine_id, MachineStatus::Online, now)
                .await
            {
                warn!(machine_id, error = %e, "status write failed");
            }
            self.cache
                .update_machine_status(machine_id, MachineStatus::Online);
        }

        if let Some(metrics) = metrics {
            if self.throttle.metrics_due(machine_id) {
                self.record_metric(machine_id, metrics).await;
            }
        }

        if let Some(ports) = ports {
            if self.throttle.ports_due(machine_id) {
                self.sync_ports(machine_id, &ports).await;
            }
        }

        if self.throttle.broadcast_due(machine_id) {
            self.bus.publish(ServerEvent::MachineHeartbeat {
                machine_id: machine_id.to_string(),
                timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
            });
        }
    }

    async fn record_metric(&self, machine_id: &str, metrics: MetricsPayload) {
        let row = MetricRow {
            machine_id: machine_id.to_string(),
            metrics: metrics.clone(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.append_metric(row.clone()).await {
            warn!(machine_id, error = %e, "metric write failed");
        }
        self.cache.update_metric(row);
        self.bus.publish(ServerEvent::MachineMetrics {
            machine_id: machine_id.to_string(),
            metrics,
        });
    }

    async fn sync_ports(&self, machine_id: &str, ports: &[PortInfo]) {
        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(PORT_STALE_AFTER.as_secs() as i64);
        match self
            .store
            .sync_ports(machine_id, ports, now, stale_before)
            .await
        {
            Ok(rows) => {
                let current: Vec<PortInfo> = rows
                    .iter()
                    .map(|r| PortInfo {
                        port: r.port,
                        proto: r.proto.clone(),
                        service: r.service.clone(),
                        state: r.state.clone(),
                    })
                    .collect();
                self.cache.update_ports(machine_id, rows);
                self.bus.publish(ServerEvent::PortsUpdated {
                    machine_id: machine_id.to_string(),
                    ports: current,
                });
            }
            Err(e) => warn!(machine_id, error = %e, "port sync failed"),
        }
    }

    // ── Command responses ───────────────────────────────────────

    async fn command_response(
        &self,
        machine_id: &str,
        command_id: Option<String>,
        output: Option<String>,
        exit_code: Option<i32>,
        completed: bool,
    ) {
        // Normalize command output; terminal output never passes here.
        let normalized = output
            .map(|raw| clamp_field(raw, "output", machine_id))
            .and_then(|raw| normalize_chunk(&raw));

        if let Some(chunk) = normalized.as_ref().filter(|c| !c.is_empty()) {
            self.bus.publish(ServerEvent::CommandOutput {
                command_id: command_id.clone().unwrap_or_default(),
                machine_id: machine_id.to_string(),
                output: chunk.clone(),
            });
        }

        self.orchestrator
            .handle_command_response(
                machine_id,
                command_id.as_deref(),
                normalized.as_deref(),
                exit_code,
                completed,
            )
            .await;

        if completed {
            self.bus.publish(ServerEvent::CommandCompleted {
                command_id: command_id.unwrap_or_default(),
                machine_id: machine_id.to_string(),
                exit_code,
            });
        }
    }

    // ── Terminal output ─────────────────────────────────────────

    /// Terminal output is passed verbatim — the web-side emulator
    /// interprets control bytes and ANSI sequences. When an HMAC triple is
    /// attached the frame must authenticate against the machine's secret
    /// before fan-out; failures are dropped without detail to the sender.
    async fn terminal_output(
        &self,
        machine_id: &str,
        session_id: String,
        output: String,
        hmac: Option<String>,
        nonce: Option<String>,
        timestamp: Option<String>,
    ) {
        if let (Some(hmac), Some(nonce), Some(timestamp)) = (hmac, nonce, timestamp) {
            let secret = match self.agent_secret(machine_id).await {
                Some(s) => s,
                None => {
                    warn!(machine_id, "terminal output dropped: no usable secret");
                    return;
                }
            };
            let envelope = SecureEnvelope {
                session_id: session_id.clone(),
                machine_id: machine_id.to_string(),
                payload: output.clone(),
                nonce,
                timestamp,
                hmac,
            };
            if let Err(rejection) =
                self.terminal
                    .validate_inbound(&secret, "terminal_output", &envelope)
            {
                warn!(
                    machine_id,
                    session_id,
                    reason = rejection.reason(),
                    "terminal output dropped"
                );
                return;
            }
        }

        self.bus.publish(ServerEvent::TerminalOutput {
            session_id,
            machine_id: machine_id.to_string(),
            output,
        });
    }

    async fn agent_secret(&self, machine_id: &str) -> Option<String> {
        let machine = match self.cache.machine(machine_id) {
            Some(m) => m,
            None => self.store.machine_by_id(machine_id).await.ok().flatten()?,
        };
        self.vault.decrypt(&machine.encrypted_secret).ok()
    }

    // ── Security events ─────────────────────────────────────────

    async fn security_event(&self, machine_id: &str, event: SecurityEventPayload) {
        let row = SecurityEventRow {
            id: event
                .id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            machine_id: machine_id.to_string(),
            event: event.clone(),
            resolved: false,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.store.append_security_event(row).await {
            warn!(machine_id, error = %e, "security event write failed");
        }
        if let Ok(recent) = self.store.recent_security_events(100).await {
            self.cache.refresh_security_events(recent);
        }
        self.bus.publish(ServerEvent::SecurityEvent {
            machine_id: machine_id.to_string(),
            event,
        });
    }

    // ── Disconnect ──────────────────────────────────────────────

    pub async fn disconnect(&self, machine_id: &str) {
        self.registry.remove(machine_id);
        self.throttle.remove(machine_id);

        if let Err(e) = self
            .store
            .set_machine_status(machine_id, MachineStatus::Offline, Utc::now())
            .await
        {
            warn!(machine_id, error = %e, "offline write failed");
        }
        self.cache.set_offline(machine_id);
        self.bus.publish(ServerEvent::MachineStatusChanged {
            machine_id: machine_id.to_string(),
            status: MachineStatus::Offline,
        });

        info!(machine_id, "agent disconnected");
        self.orchestrator.handle_agent_disconnect(machine_id);
    }
}

// ── WebSocket endpoint ──────────────────────────────────────────

/// `GET /ws/agent` — upgrades the connection and hands it to
/// [`handle_connection`]. Registration happens inside the stream, not via
/// an auth header.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state.agents.clone()))
}

async fn handle_connection(socket: WebSocket, manager: Arc<AgentSessionManager>) {
    let (ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentFrame>();

    // Outbound task: serialize queued frames onto the socket. A close
    // frame flushes and terminates the writer.
    let ws_sink = Arc::new(tokio::sync::Mutex::new(ws_sink));
    let sink = ws_sink.clone();
    let outbound = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let mut sink = sink.lock().await;
            match frame {
                AgentFrame::Bound(msg) => {
                    let text = match serde_json::to_string(&msg) {
                        Ok(t) => t,
                        Err(e) => {
                            error!(error = %e, "serialize error");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                AgentFrame::Violation(violation) => {
                    if let Ok(text) = serde_json::to_string(&violation) {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                }
                AgentFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Registration phase: the first text frame must be `register`.
    let machine_id = loop {
        let Some(Ok(msg)) = ws_stream.next().await else {
            outbound.abort();
            return;
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => {
                outbound.abort();
                return;
            }
            _ => continue,
        };

        match registration_frame(&text) {
            RegistrationFrame::Register {
                secret_key,
                hostname,
                ip,
                os_info,
            } => {
                match manager
                    .register(tx.clone(), &secret_key, &hostname, &ip, &os_info)
                    .await
                {
                    Ok(machine) => {
                        let _ = tx.send(AgentFrame::Bound(AgentBound::Registered {
                            machine_id: machine.id.clone(),
                        }));
                        break machine.id;
                    }
                    Err(reason) => {
                        warn!(reason, "agent registration rejected");
                        let _ = tx.send(AgentFrame::Violation(ProtocolViolation::registration(
                            reason.as_str(),
                        )));
                        let _ = tx.send(AgentFrame::Close {
                            code: 1008,
                            reason: "registration failed".into(),
                        });
                        return;
                    }
                }
            }
            RegistrationFrame::MissingType => {
                let _ = tx.send(AgentFrame::Violation(ProtocolViolation::missing_type()));
                let _ = tx.send(AgentFrame::Close {
                    code: 1008,
                    reason: "protocol violation".into(),
                });
                return;
            }
            RegistrationFrame::NotRegister => {
                let _ = tx.send(AgentFrame::Close {
                    code: 1008,
                    reason: "registration required".into(),
                });
                return;
            }
            RegistrationFrame::Unparsable => {
                let _ = tx.send(AgentFrame::Close {
                    code: 1002,
                    reason: "unparsable frame".into(),
                });
                return;
            }
        }
    };

    // Main loop: frames from this agent are processed in arrival order.
    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        match manager.handle_frame(&machine_id, &text).await {
            FrameOutcome::Continue => {}
            FrameOutcome::Respond(violation) => {
                let _ = tx.send(AgentFrame::Violation(violation));
            }
            FrameOutcome::ViolationClose(violation) => {
                let _ = tx.send(AgentFrame::Violation(violation));
                let _ = tx.send(AgentFrame::Close {
                    code: 1008,
                    reason: "protocol violation".into(),
                });
                break;
            }
            FrameOutcome::UnparsableClose => {
                let _ = tx.send(AgentFrame::Close {
                    code: 1002,
                    reason: "unparsable frame".into(),
                });
                break;
            }
        }
    }

    manager.disconnect(&machine_id).await;
    outbound.abort();
}

enum RegistrationFrame {
    Register {
        secret_key: String,
        hostname: String,
        ip: String,
        os_info: String,
    },
    MissingType,
    NotRegister,
    Unparsable,
}

fn registration_frame(text: &str) -> RegistrationFrame {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return RegistrationFrame::Unparsable,
    };
    match value.get("type").and_then(Value::as_str) {
        None => RegistrationFrame::MissingType,
        Some("register") => match serde_json::from_value::<AgentMessage>(value) {
            Ok(AgentMessage::Register {
                secret_key,
                hostname,
                ip,
                os_info,
            }) => RegistrationFrame::Register {
                secret_key,
                hostname,
                ip,
                os_info,
            },
            _ => RegistrationFrame::NotRegister,
        },
        Some(_) => RegistrationFrame::NotRegister,
    }
}

// ── Validation helpers ──────────────────────────────────────────

fn validate_register(secret_key: &str, hostname: &str, ip: &str) -> Result<(), String> {
    if secret_key.len() != 64 || !secret_key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err("secretKey must be 64 hex characters".into());
    }
    if hostname.is_empty() || hostname.len() > 255 {
        return Err("hostname must be 1-255 characters".into());
    }
    if hostname.contains('\u{0}') {
        return Err("hostname contains binary data".into());
    }
    if ip.parse::<Ipv4Addr>().is_err() {
        return Err("ip must be an IPv4 dotted quad".into());
    }
    Ok(())
}

/// Truncates an oversize string field at a char boundary and logs it.
fn clamp_field(mut value: String, field: &str, machine_id: &str) -> String {
    if value.len() > MAX_FIELD_BYTES {
        let mut cut = MAX_FIELD_BYTES;
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        value.truncate(cut);
        warn!(machine_id, field, "oversize field truncated");
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeartbeatIntervals;
    use crate::store::memory::MemoryStore;

    const MASTER: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
    const SIGNING: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";

    struct Fixture {
        manager: AgentSessionManager,
        store: Arc<MemoryStore>,
        cache: Arc<StateCache>,
        bus: EventBus,
        vault: Arc<SecretVault>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(StateCache::new());
        let bus = EventBus::new();
        let vault = Arc::new(SecretVault::new(MASTER));
        let terminal = Arc::new(TerminalService::new(
            SIGNING.to_string(),
            store.clone() as Arc<dyn Store>,
            bus.clone(),
        ));
        let orchestrator = Arc::new(JobOrchestrator::new(
            store.clone() as Arc<dyn Store>,
            cache.clone(),
            bus.clone(),
            Duration::from_secs(15),
            50,
        ));
        let registry = Arc::new(AgentRegistry::new());
        let manager = AgentSessionManager::new(
            registry,
            store.clone() as Arc<dyn Store>,
            cache.clone(),
            bus.clone(),
            vault.clone(),
            terminal,
            orchestrator,
            HeartbeatThrottle::new(HeartbeatIntervals::default()),
        );
        Fixture {
            manager,
            store,
            cache,
            bus,
            vault,
        }
    }

    fn channel() -> (AgentTx, mpsc::UnboundedReceiver<AgentFrame>) {
        mpsc::unbounded_channel()
    }

    fn secret() -> String {
        "a".repeat(64)
    }

    #[tokio::test]
    async fn register_creates_machine_with_both_secret_forms() {
        let f = fixture();
        let (tx, _rx) = channel();
        let machine = f
            .manager
            .register(tx, &secret(), "h1", "10.0.0.1", "linux")
            .await
            .unwrap();

        assert_eq!(machine.status, MachineStatus::Online);
        assert_eq!(machine.secret_hash, sha256_hex(secret().as_bytes()));
        assert_eq!(f.vault.decrypt(&machine.encrypted_secret).unwrap(), secret());
        assert!(f.manager.registry.is_connected(&machine.id));
        assert!(f.cache.machine(&machine.id).is_some());
    }

    #[tokio::test]
    async fn re_registration_updates_rather_than_duplicates() {
        let f = fixture();
        let (tx, _rx) = channel();
        let first = f
            .manager
            .register(tx.clone(), &secret(), "h1", "10.0.0.1", "linux")
            .await
            .unwrap();
        let second = f
            .manager
            .register(tx, &secret(), "h1-renamed", "10.0.0.2", "linux 6.1")
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(f.store.all_machines().await.unwrap().len(), 1);
        assert_eq!(second.hostname, "h1-renamed");
    }

    #[tokio::test]
    async fn register_rejects_bad_credentials() {
        let f = fixture();
        let (tx, _rx) = channel();
        assert!(f
            .manager
            .register(tx.clone(), "tooshort", "h1", "10.0.0.1", "linux")
            .await
            .is_err());
        assert!(f
            .manager
            .register(tx.clone(), &secret(), "", "10.0.0.1", "linux")
            .await
            .is_err());
        assert!(f
            .manager
            .register(tx, &secret(), "h1", "not-an-ip", "linux")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn heartbeat_appends_metric_and_updates_cache() {
        let f = fixture();
        let (tx, _rx) = channel();
        let machine = f
            .manager
            .register(tx, &secret(), "h1", "10.0.0.1", "linux")
            .await
            .unwrap();

        let frame = serde_json::json!({
            "type": "heartbeat",
            "metrics": { "cpuUsage": 42.0 }
        })
        .to_string();
        assert!(matches!(
            f.manager.handle_frame(&machine.id, &frame).await,
            FrameOutcome::Continue
        ));

        assert_eq!(
            f.cache.latest_metric(&machine.id).unwrap().metrics.cpu_usage,
            42.0
        );
        assert_eq!(
            f.store
                .latest_metric_for(&machine.id)
                .await
                .unwrap()
                .unwrap()
                .metrics
                .cpu_usage,
            42.0
        );
    }

    #[tokio::test]
    async fn frame_without_type_closes_with_violation() {
        let f = fixture();
        let outcome = f.manager.handle_frame("m1", r#"{"data": 1}"#).await;
        match outcome {
            FrameOutcome::ViolationClose(v) => {
                assert_eq!(v.error, "Protocol violation: type field required");
                assert_eq!(v.action, "update_agent");
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_json_closes_unparsable() {
        let f = fixture();
        assert!(matches!(
            f.manager.handle_frame("m1", "{nope").await,
            FrameOutcome::UnparsableClose
        ));
    }

    #[tokio::test]
    async fn schema_failure_responds_without_closing() {
        let f = fixture();
        // exitCode must be numeric.
        let frame = r#"{"type":"command_response","commandId":"c1","exitCode":"zero"}"#;
        assert!(matches!(
            f.manager.handle_frame("m1", frame).await,
            FrameOutcome::Respond(_)
        ));
    }

    #[tokio::test]
    async fn terminal_output_with_valid_envelope_is_broadcast() {
        let f = fixture();
        let (tx, _rx) = channel();
        let machine = f
            .manager
            .register(tx, &secret(), "h1", "10.0.0.1", "linux")
            .await
            .unwrap();
        let mut events = f.bus.subscribe();

        let env = crate::terminal::envelope::create_secure_message(
            &secret(),
            "terminal_output",
            "s1",
            &machine.id,
            "file1\n".to_string(),
        );
        let frame = serde_json::json!({
            "type": "terminal_output",
            "sessionId": "s1",
            "machineId": machine.id,
            "output": env.payload,
            "hmac": env.hmac,
            "nonce": env.nonce,
            "timestamp": env.timestamp,
        })
        .to_string();
        f.manager.handle_frame(&machine.id, &frame).await;

        match events.recv().await.unwrap() {
            ServerEvent::TerminalOutput { output, .. } => assert_eq!(output, "file1\n"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replayed_terminal_envelope_is_dropped() {
        let f = fixture();
        let (tx, _rx) = channel();
        let machine = f
            .manager
            .register(tx, &secret(), "h1", "10.0.0.1", "linux")
            .await
            .unwrap();

        let env = crate::terminal::envelope::create_secure_message(
            &secret(),
            "terminal_output",
            "s1",
            &machine.id,
            "ls\n".to_string(),
        );
        let frame = serde_json::json!({
            "type": "terminal_output",
            "sessionId": "s1",
            "machineId": machine.id,
            "output": env.payload,
            "hmac": env.hmac,
            "nonce": env.nonce,
            "timestamp": env.timestamp,
        })
        .to_string();

        f.manager.handle_frame(&machine.id, &frame).await;
        let mut events = f.bus.subscribe();
        // Byte-identical replay: dropped, nothing reaches the bus.
        f.manager.handle_frame(&machine.id, &frame).await;
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn unsigned_terminal_output_passes_verbatim() {
        let f = fixture();
        let (tx, _rx) = channel();
        let machine = f
            .manager
            .register(tx, &secret(), "h1", "10.0.0.1", "linux")
            .await
            .unwrap();
        let mut events = f.bus.subscribe();

        let frame = serde_json::json!({
            "type": "terminal_output",
            "sessionId": "s1",
            "output": "\u{1b}[31mred\u{1b}[0m",
        })
        .to_string();
        f.manager.handle_frame(&machine.id, &frame).await;

        match events.recv().await.unwrap() {
            // Never normalized: ANSI bytes intact.
            ServerEvent::TerminalOutput { output, .. } => {
                assert_eq!(output, "\u{1b}[31mred\u{1b}[0m")
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_marks_offline_and_broadcasts() {
        let f = fixture();
        let (tx, _rx) = channel();
        let machine = f
            .manager
            .register(tx, &secret(), "h1", "10.0.0.1", "linux")
            .await
            .unwrap();
        let mut events = f.bus.subscribe();

        f.manager.disconnect(&machine.id).await;

        assert!(!f.manager.registry.is_connected(&machine.id));
        assert_eq!(
            f.cache.machine(&machine.id).unwrap().status,
            MachineStatus::Offline
        );
        assert_eq!(
            f.store
                .machine_by_id(&machine.id)
                .await
                .unwrap()
                .unwrap()
                .status,
            MachineStatus::Offline
        );
        match events.recv().await.unwrap() {
            ServerEvent::MachineStatusChanged { status, .. } => {
                assert_eq!(status, MachineStatus::Offline)
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn port_discovery_upserts_ports() {
        let f = fixture();
        let (tx, _rx) = channel();
        let machine = f
            .manager
            .register(tx, &secret(), "h1", "10.0.0.1", "linux")
            .await
            .unwrap();

        let frame = serde_json::json!({
            "type": "port_discovery",
            "machineId": machine.id,
            "ports": [
                { "port": 22, "proto": "tcp", "service": "ssh", "state": "open" }
            ]
        })
        .to_string();
        f.manager.handle_frame(&machine.id, &frame).await;

        let ports = f.cache.ports(&machine.id);
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 22);
    }

    #[test]
    fn clamp_field_truncates_oversize_values() {
        let big = "x".repeat(MAX_FIELD_BYTES + 10);
        let clamped = clamp_field(big, "output", "m1");
        assert_eq!(clamped.len(), MAX_FIELD_BYTES);
    }
}
