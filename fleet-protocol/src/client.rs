//! Operator messages arriving over the `/ws/client` stream.
//!
//! Every message is validated and enriched with the authenticated user id
//! on the server before anything is dispatched; none of these frames carry
//! a trusted identity themselves.

use serde::{Deserialize, Serialize};

/// All messages a web client may send to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Open an interactive terminal on a machine. The server issues a
    /// session token and replies with a `terminal_session_created` event.
    SpawnTerminal { machine_id: String },

    /// Keystrokes bound for an open terminal session.
    TerminalInput { session_id: String, data: String },

    /// Terminal geometry change.
    TerminalResize {
        session_id: String,
        cols: u16,
        rows: u16,
    },

    /// One-shot remote command outside the job system.
    ExecuteCommand {
        machine_id: String,
        command: String,
        #[serde(default)]
        command_id: Option<String>,
    },

    /// Ask the agent to self-update. Unwrapped administrative poke.
    UpdateAgent { machine_id: String },

    /// Ask the agent to run a scan. Unwrapped administrative poke.
    TriggerScan {
        machine_id: String,
        #[serde(default)]
        scan_type: Option<String>,
    },

    /// Explicitly end a terminal session the caller owns.
    EndTerminal { session_id: String },
}
