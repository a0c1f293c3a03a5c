//! # Web Client Session Manager
//!
//! Accepts operator streams, authenticates each with a bearer token, and
//! dispatches validated operator messages to the terminal service or
//! directly to the target agent. Keeps `user → terminal sessions`
//! bookkeeping so a client disconnect ends every session that user owns.

pub mod auth;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::cache::StateCache;
use crate::crypto::SecretVault;
use crate::events::EventBus;
use crate::state::AppState;
use crate::terminal::{terminal_capabilities, Capability, TerminalService};
use auth::AuthedUser;
use fleet_protocol::{AgentBound, ClientMessage, ServerEvent};

/// A connected operator stream.
pub struct ClientHandle {
    pub user_id: String,
    pub tx: mpsc::UnboundedSender<ServerEvent>,
}

pub struct WebClientSessionManager {
    clients: DashMap<String, ClientHandle>,
    registry: Arc<AgentRegistry>,
    terminal: Arc<TerminalService>,
    vault: Arc<SecretVault>,
    cache: Arc<StateCache>,
    bus: EventBus,
}

impl WebClientSessionManager {
    pub fn new(
        registry: Arc<AgentRegistry>,
        terminal: Arc<TerminalService>,
        vault: Arc<SecretVault>,
        cache: Arc<StateCache>,
        bus: EventBus,
    ) -> Self {
        Self {
            clients: DashMap::new(),
            registry,
            terminal,
            vault,
            cache,
            bus,
        }
    }

    pub fn connect(&self, conn_id: &str, user: &AuthedUser, tx: mpsc::UnboundedSender<ServerEvent>) {
        self.clients.insert(
            conn_id.to_string(),
            ClientHandle {
                user_id: user.user_id.clone(),
                tx,
            },
        );
        info!(conn_id, user_id = %user.user_id, "web client connected");
    }

    /// On disconnect all of the user's terminal sessions are ended,
    /// emitting audit events.
    pub async fn disconnect(&self, conn_id: &str) {
        let Some((_, handle)) = self.clients.remove(conn_id) else {
            return;
        };
        info!(conn_id, user_id = %handle.user_id, "web client disconnected");
        self.terminal
            .end_sessions_for_user(&handle.user_id, "client_disconnected")
            .await;
    }

    pub fn connected_count(&self) -> usize {
        self.clients.len()
    }

    // ── Operator dispatch ───────────────────────────────────────

    /// Validates one operator message, enriches it with the authenticated
    /// user, and routes it. Authorization failures are dropped with a log,
    /// never detailed back to the stream.
    pub async fn handle_message(
        &self,
        user: &AuthedUser,
        message: ClientMessage,
        direct: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        match message {
            ClientMessage::SpawnTerminal { machine_id } => {
                self.spawn_terminal(user, &machine_id, direct).await;
            }
            ClientMessage::TerminalInput { session_id, data } => {
                self.terminal_payload(
                    user,
                    &session_id,
                    Capability::Input,
                    "terminal_input",
                    json!({ "data": data }),
                )
                .await;
            }
            ClientMessage::TerminalResize {
                session_id,
                cols,
                rows,
            } => {
                self.terminal_payload(
                    user,
                    &session_id,
                    Capability::Resize,
                    "terminal_resize",
                    json!({ "cols": cols, "rows": rows }),
                )
                .await;
            }
            ClientMessage::ExecuteCommand {
                machine_id,
                command,
                command_id,
            } => {
                self.execute_command(user, &machine_id, &command, command_id, direct)
                    .await;
            }
            ClientMessage::UpdateAgent { machine_id } => {
                // Idempotent administrative poke; its audit trail lives on
                // the agent side.
                if !self
                    .registry
                    .send(&machine_id, AgentBound::UpdateAgent { machine_id: machine_id.clone() })
                {
                    let _ = direct.send(ServerEvent::Error {
                        message: "Agent offline".into(),
                    });
                }
            }
            ClientMessage::TriggerScan {
                machine_id,
                scan_type,
            } => {
                if !self.registry.send(
                    &machine_id,
                    AgentBound::TriggerScan {
                        machine_id: machine_id.clone(),
                        scan_type,
                    },
                ) {
                    let _ = direct.send(ServerEvent::Error {
                        message: "Agent offline".into(),
                    });
                }
            }
            ClientMessage::EndTerminal { session_id } => {
                self.end_terminal(user, &session_id).await;
            }
        }
    }

    async fn spawn_terminal(
        &self,
        user: &AuthedUser,
        machine_id: &str,
        direct: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        if self.cache.machine(machine_id).is_none() {
            let _ = direct.send(ServerEvent::Error {
                message: "Unknown machine".into(),
            });
            return;
        }

        let token = match self
            .terminal
            .issue_session(&user.user_id, machine_id, terminal_capabilities())
            .await
        {
            Ok(t) => t,
            Err(e) => {
                // ACL or store failure; no detail to the caller.
                debug!(user_id = %user.user_id, machine_id, error = %e, "spawn denied");
                return;
            }
        };

        let Some(secret) = self.agent_secret(machine_id).await else {
            warn!(machine_id, "spawn aborted: no usable agent secret");
            self.terminal.end_session(&token.session_id, "error").await;
            return;
        };

        let envelope = self.terminal.wrap(&secret, "spawn_shell", &token, &json!({}));
        if !self
            .registry
            .send(machine_id, AgentBound::SpawnShell { envelope })
        {
            self.terminal
                .end_session(&token.session_id, "agent_offline")
                .await;
            let _ = direct.send(ServerEvent::Error {
                message: "Agent offline".into(),
            });
            return;
        }

        self.bus.publish(ServerEvent::TerminalSessionCreated {
            session_id: token.session_id.clone(),
            machine_id: machine_id.to_string(),
            expires_at: token.expires_at as u64,
        });
    }

    /// Shared path for terminal input and resize: validate the session,
    /// check ownership and capability, pay the rate limiter, wrap, send.
    async fn terminal_payload(
        &self,
        user: &AuthedUser,
        session_id: &str,
        capability: Capability,
        msg_type: &str,
        payload: serde_json::Value,
    ) {
        let token = match self.terminal.validate_session(session_id).await {
            Ok(t) => t,
            Err(e) => {
                debug!(session_id, error = %e, "terminal action on invalid session");
                return;
            }
        };
        if token.user_id != user.user_id {
            warn!(
                session_id,
                user_id = %user.user_id,
                owner = %token.user_id,
                "terminal action by non-owner dropped"
            );
            return;
        }
        if !token.has_capability(capability) {
            warn!(session_id, ?capability, "capability missing, action dropped");
            return;
        }
        if !self.terminal.consume_rate(session_id) {
            return;
        }

        let Some(secret) = self.agent_secret(&token.machine_id).await else {
            warn!(machine_id = %token.machine_id, "action dropped: no usable agent secret");
            return;
        };
        let envelope = self.terminal.wrap(&secret, msg_type, &token, &payload);
        let bound = match msg_type {
            "terminal_resize" => AgentBound::TerminalResize { envelope },
            _ => AgentBound::TerminalStdin { envelope },
        };
        self.registry.send(&token.machine_id, bound);
    }

    /// One-shot command outside the job system: a fresh
    /// `execute_command`-capable token per command, ended as soon as the
    /// envelope is built.
    async fn execute_command(
        &self,
        user: &AuthedUser,
        machine_id: &str,
        command: &str,
        command_id: Option<String>,
        direct: &mpsc::UnboundedSender<ServerEvent>,
    ) {
        let command_id = command_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let token = match self
            .terminal
            .issue_session(&user.user_id, machine_id, vec![Capability::ExecuteCommand])
            .await
        {
            Ok(t) => t,
            Err(e) => {
                debug!(user_id = %user.user_id, machine_id, error = %e, "execute denied");
                return;
            }
        };

        let Some(secret) = self.agent_secret(machine_id).await else {
            warn!(machine_id, "execute aborted: no usable agent secret");
            self.terminal.end_session(&token.session_id, "error").await;
            return;
        };

        let envelope = self.terminal.wrap(
            &secret,
            "execute_command",
            &token,
            &json!({ "commandId": command_id, "command": command }),
        );
        let sent = self
            .registry
            .send(machine_id, AgentBound::ExecuteCommand { envelope });
        self.terminal.end_session(&token.session_id, "one_shot").await;

        if !sent {
            let _ = direct.send(ServerEvent::Error {
                message: "Agent offline".into(),
            });
        }
    }

    async fn end_terminal(&self, user: &AuthedUser, session_id: &str) {
        match self.terminal.validate_session(session_id).await {
            Ok(token) if token.user_id == user.user_id => {
                self.terminal.end_session(session_id, "client_request").await;
            }
            Ok(token) => {
                warn!(
                    session_id,
                    user_id = %user.user_id,
                    owner = %token.user_id,
                    "end_terminal by non-owner dropped"
                );
            }
            Err(_) => {}
        }
    }

    async fn agent_secret(&self, machine_id: &str) -> Option<String> {
        let machine = self.cache.machine(machine_id)?;
        self.vault.decrypt(&machine.encrypted_secret).ok()
    }
}

// ── WebSocket endpoint ──────────────────────────────────────────

/// `GET /ws/client` — authenticates the upgrade, then bridges the stream
/// to the event bus and the operator dispatch path. Unauthenticated
/// upgrades close with 1008.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let token = auth::extract_token(&headers, params.get("token").map(String::as_str));
    let user = token.and_then(|t| {
        auth::verify_token(&t, &state.config.session_token_secret)
            .map_err(|e| {
                warn!(error = %e, "web client authentication failed");
                e
            })
            .ok()
    });

    ws.on_upgrade(move |socket| async move {
        match user {
            Some(user) => handle_connection(socket, state, user).await,
            None => close_unauthenticated(socket).await,
        }
    })
}

async fn close_unauthenticated(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: "authentication required".into(),
        })))
        .await;
}

async fn handle_connection(socket: WebSocket, state: AppState, user: AuthedUser) {
    let conn_id = Uuid::new_v4().to_string();
    let manager = state.clients.clone();

    let (ws_sink, mut ws_stream) = socket.split();
    let ws_sink = Arc::new(tokio::sync::Mutex::new(ws_sink));

    // Direct channel for this client plus a bus subscription; both feed
    // the outbound writer. Bus fan-out is best-effort: a lagging client
    // skips ahead rather than stalling publishers.
    let (tx, mut direct_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let mut bus_rx = state.bus.subscribe();
    manager.connect(&conn_id, &user, tx.clone());

    let sink = ws_sink.clone();
    let outbound = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                direct = direct_rx.recv() => match direct {
                    Some(ev) => ev,
                    None => break,
                },
                broadcast = bus_rx.recv() => match broadcast {
                    Ok(ev) => ev,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "web client lagged behind the event bus");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let mut sink = sink.lock().await;
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_stream.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => manager.handle_message(&user, message, &tx).await,
            Err(e) => {
                let _ = tx.send(ServerEvent::Error {
                    message: format!("Invalid message: {e}"),
                });
            }
        }
    }

    manager.disconnect(&conn_id).await;
    outbound.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentFrame, AgentRegistry};
    use crate::store::memory::MemoryStore;
    use crate::store::{Machine, Store};
    use chrono::Utc;
    use fleet_protocol::MachineStatus;

    const MASTER: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
    const SIGNING: &str = "ffeeddccbbaa99887766554433221100ffeeddccbbaa99887766554433221100";

    struct Fixture {
        manager: WebClientSessionManager,
        terminal: Arc<TerminalService>,
        store: Arc<MemoryStore>,
        agent_rx: mpsc::UnboundedReceiver<AgentFrame>,
        bus: EventBus,
        secret: String,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(StateCache::new());
        let bus = EventBus::new();
        let vault = Arc::new(SecretVault::new(MASTER));
        let terminal = Arc::new(TerminalService::new(
            SIGNING.to_string(),
            store.clone() as Arc<dyn Store>,
            bus.clone(),
        ));
        let registry = Arc::new(AgentRegistry::new());

        // A registered, connected machine.
        let secret = "b".repeat(64);
        let machine = Machine {
            id: "m1".into(),
            hostname: "h1".into(),
            ip: "10.0.0.1".into(),
            os_info: "linux".into(),
            status: MachineStatus::Online,
            last_seen: Utc::now(),
            encrypted_secret: vault.encrypt(&secret).unwrap(),
            secret_hash: crate::crypto::sha256_hex(secret.as_bytes()),
            role: None,
            tags: Default::default(),
            notes: None,
        };
        store.upsert_machine(machine.clone()).await.unwrap();
        cache.upsert_machine(machine);
        store.grant_access("u1", "m1").await.unwrap();

        let (agent_tx, agent_rx) = mpsc::unbounded_channel();
        registry.insert("m1", agent_tx);

        let manager = WebClientSessionManager::new(
            registry,
            terminal.clone(),
            vault,
            cache,
            bus.clone(),
        );
        Fixture {
            manager,
            terminal,
            store,
            agent_rx,
            bus,
            secret,
        }
    }

    fn user(id: &str) -> AuthedUser {
        AuthedUser {
            user_id: id.to_string(),
            username: None,
        }
    }

    fn direct() -> (
        mpsc::UnboundedSender<ServerEvent>,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn spawn_terminal_sends_envelope_and_announces_session() {
        let mut f = fixture().await;
        let (tx, _rx) = direct();
        let mut events = f.bus.subscribe();

        f.manager
            .handle_message(&user("u1"), ClientMessage::SpawnTerminal { machine_id: "m1".into() }, &tx)
            .await;

        match f.agent_rx.try_recv().unwrap() {
            AgentFrame::Bound(AgentBound::SpawnShell { envelope }) => {
                assert_eq!(envelope.machine_id, "m1");
                assert_eq!(envelope.payload, "{}");
                // The envelope authenticates against the agent's secret.
                assert!(crate::terminal::envelope::validate_secure_message(
                    &f.secret,
                    "spawn_shell",
                    &envelope,
                    &crate::terminal::envelope::NonceHistory::new(),
                    Utc::now(),
                )
                .is_ok());
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Session creation surfaced on the bus, and a SHELL_OPEN audit
        // made it to the store.
        let mut saw_created = false;
        while let Ok(ev) = events.try_recv() {
            if let ServerEvent::TerminalSessionCreated { machine_id, .. } = ev {
                assert_eq!(machine_id, "m1");
                saw_created = true;
            }
        }
        assert!(saw_created);
        let audit = f.store.recent_audit(10).await.unwrap();
        assert!(audit.iter().any(|r| r.event == "SHELL_OPEN"));
    }

    #[tokio::test]
    async fn spawn_denied_without_grant_sends_nothing() {
        let mut f = fixture().await;
        let (tx, mut rx) = direct();

        f.manager
            .handle_message(
                &user("intruder"),
                ClientMessage::SpawnTerminal { machine_id: "m1".into() },
                &tx,
            )
            .await;

        assert!(f.agent_rx.try_recv().is_err());
        // No detail reaches the caller.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn terminal_input_wraps_normalized_payload() {
        let mut f = fixture().await;
        let (tx, _rx) = direct();
        let u = user("u1");

        f.manager
            .handle_message(&u, ClientMessage::SpawnTerminal { machine_id: "m1".into() }, &tx)
            .await;
        let session_id = match f.agent_rx.try_recv().unwrap() {
            AgentFrame::Bound(AgentBound::SpawnShell { envelope }) => envelope.session_id,
            other => panic!("unexpected frame: {other:?}"),
        };

        f.manager
            .handle_message(
                &u,
                ClientMessage::TerminalInput {
                    session_id: session_id.clone(),
                    data: "ls\n".into(),
                },
                &tx,
            )
            .await;

        match f.agent_rx.try_recv().unwrap() {
            AgentFrame::Bound(AgentBound::TerminalStdin { envelope }) => {
                assert_eq!(envelope.session_id, session_id);
                assert_eq!(envelope.payload, r#"{"data":"ls\n"}"#);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn terminal_input_by_non_owner_is_dropped() {
        let mut f = fixture().await;
        let (tx, _rx) = direct();

        f.manager
            .handle_message(&user("u1"), ClientMessage::SpawnTerminal { machine_id: "m1".into() }, &tx)
            .await;
        let session_id = match f.agent_rx.try_recv().unwrap() {
            AgentFrame::Bound(AgentBound::SpawnShell { envelope }) => envelope.session_id,
            other => panic!("unexpected frame: {other:?}"),
        };

        f.store.grant_access("u2", "m1").await.unwrap();
        f.manager
            .handle_message(
                &user("u2"),
                ClientMessage::TerminalInput {
                    session_id,
                    data: "whoami\n".into(),
                },
                &tx,
            )
            .await;
        assert!(f.agent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn execute_command_is_one_shot() {
        let mut f = fixture().await;
        let (tx, _rx) = direct();

        f.manager
            .handle_message(
                &user("u1"),
                ClientMessage::ExecuteCommand {
                    machine_id: "m1".into(),
                    command: "uptime".into(),
                    command_id: Some("c1".into()),
                },
                &tx,
            )
            .await;

        match f.agent_rx.try_recv().unwrap() {
            AgentFrame::Bound(AgentBound::ExecuteCommand { envelope }) => {
                assert_eq!(envelope.payload, r#"{"command":"uptime","commandId":"c1"}"#);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        // The one-shot session is gone the moment the envelope shipped.
        assert_eq!(f.terminal.active_session_count(), 0);
    }

    #[tokio::test]
    async fn rate_limited_input_is_dropped() {
        let mut f = fixture().await;
        let (tx, _rx) = direct();
        let u = user("u1");

        f.manager
            .handle_message(&u, ClientMessage::SpawnTerminal { machine_id: "m1".into() }, &tx)
            .await;
        let session_id = match f.agent_rx.try_recv().unwrap() {
            AgentFrame::Bound(AgentBound::SpawnShell { envelope }) => envelope.session_id,
            other => panic!("unexpected frame: {other:?}"),
        };

        for _ in 0..100 {
            f.manager
                .handle_message(
                    &u,
                    ClientMessage::TerminalInput {
                        session_id: session_id.clone(),
                        data: "x".into(),
                    },
                    &tx,
                )
                .await;
        }
        let mut delivered = 0;
        while f.agent_rx.try_recv().is_ok() {
            delivered += 1;
        }
        assert_eq!(delivered, 100);

        // The 101st is dropped on the floor.
        f.manager
            .handle_message(
                &u,
                ClientMessage::TerminalInput {
                    session_id,
                    data: "x".into(),
                },
                &tx,
            )
            .await;
        assert!(f.agent_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn update_agent_travels_unwrapped() {
        let mut f = fixture().await;
        let (tx, _rx) = direct();

        f.manager
            .handle_message(&user("u1"), ClientMessage::UpdateAgent { machine_id: "m1".into() }, &tx)
            .await;

        match f.agent_rx.try_recv().unwrap() {
            AgentFrame::Bound(AgentBound::UpdateAgent { machine_id }) => {
                assert_eq!(machine_id, "m1")
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_ends_all_owned_sessions() {
        let mut f = fixture().await;
        let (tx, _rx) = direct();
        let u = user("u1");

        f.manager.connect("conn1", &u, tx.clone());
        f.manager
            .handle_message(&u, ClientMessage::SpawnTerminal { machine_id: "m1".into() }, &tx)
            .await;
        assert_eq!(f.terminal.active_session_count(), 1);
        let _ = f.agent_rx.try_recv();

        f.manager.disconnect("conn1").await;
        assert_eq!(f.terminal.active_session_count(), 0);

        let audit = f.store.recent_audit(10).await.unwrap();
        let close = audit.iter().find(|r| r.event == "SHELL_CLOSE").unwrap();
        assert_eq!(
            close.details.as_ref().unwrap()["reason"],
            "client_disconnected"
        );
    }
}
