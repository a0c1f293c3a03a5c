//! # Fleet Control-Plane Wire Protocol
//!
//! Defines all message types exchanged over the control plane's two
//! WebSocket endpoints. Messages are serialized as JSON text frames using
//! serde's internally-tagged representation (`"type": "..."` field) with
//! snake_case tags and camelCase field names, matching the format already
//! spoken by deployed agents.
//!
//! ## Modules
//!
//! - [`agent`]    — agent ⇄ server messages
//! - [`client`]   — operator (web client) → server messages
//! - [`event`]    — server → web client broadcast events
//! - [`envelope`] — the HMAC-authenticated secure message envelope
//! - [`types`]    — shared payload structs and status enums

pub mod agent;
pub mod client;
pub mod envelope;
pub mod event;
pub mod types;

pub use agent::{AgentBound, AgentMessage, ProtocolViolation};
pub use client::ClientMessage;
pub use envelope::SecureEnvelope;
pub use event::{ExecutionUpdate, JobProgress, ServerEvent};
pub use types::{
    ExecutionStatus, JobMode, JobStatus, MachineStatus, MetricsPayload, PortInfo,
    SecurityEventPayload, TargetType,
};
