//! Dependency-inverted command dispatch.
//!
//! The orchestrator never imports the connection manager; it talks through
//! [`CommandDispatcher`]. The concrete implementation lives next to the
//! agent registry and wraps each command in a secure envelope under a
//! one-shot system session before sending.

use std::sync::Arc;

use serde_json::json;
use tracing::warn;

use crate::crypto::SecretVault;
use crate::store::Store;
use crate::terminal::{Capability, TerminalService};

#[async_trait::async_trait]
pub trait CommandDispatcher: Send + Sync {
    /// Sends `command` to the machine's agent. Returns false when the
    /// agent is unreachable or refuses the frame.
    async fn send_command(&self, machine_id: &str, command_id: &str, command: &str) -> bool;

    fn is_machine_online(&self, machine_id: &str) -> bool;
}

/// Production dispatcher: envelope-wraps commands and pushes them onto the
/// agent's outbound queue.
pub struct AgentCommandDispatcher {
    registry: Arc<crate::agents::AgentRegistry>,
    terminal: Arc<TerminalService>,
    vault: Arc<SecretVault>,
    store: Arc<dyn Store>,
}

impl AgentCommandDispatcher {
    pub fn new(
        registry: Arc<crate::agents::AgentRegistry>,
        terminal: Arc<TerminalService>,
        vault: Arc<SecretVault>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            registry,
            terminal,
            vault,
            store,
        }
    }
}

#[async_trait::async_trait]
impl CommandDispatcher for AgentCommandDispatcher {
    async fn send_command(&self, machine_id: &str, command_id: &str, command: &str) -> bool {
        let machine = match self.store.machine_by_id(machine_id).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                warn!(machine_id, "dispatch refused: unknown machine");
                return false;
            }
            Err(e) => {
                warn!(machine_id, error = %e, "dispatch refused: store error");
                return false;
            }
        };
        let secret = match self.vault.decrypt(&machine.encrypted_secret) {
            Ok(s) => s,
            Err(e) => {
                warn!(machine_id, error = %e, "dispatch refused: secret decryption failed");
                return false;
            }
        };

        let token = match self
            .terminal
            .issue_session("system", machine_id, vec![Capability::ExecuteCommand])
            .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!(machine_id, error = %e, "dispatch refused: token issuance failed");
                return false;
            }
        };

        let envelope = self.terminal.wrap(
            &secret,
            "execute_command",
            &token,
            &json!({ "commandId": command_id, "command": command }),
        );
        let sent = self
            .registry
            .send(machine_id, fleet_protocol::AgentBound::ExecuteCommand { envelope });

        // One-shot token: its purpose is served once the envelope exists.
        self.terminal.end_session(&token.session_id, "one_shot").await;
        sent
    }

    fn is_machine_online(&self, machine_id: &str) -> bool {
        self.registry.is_connected(machine_id)
    }
}
