//! # Fleet Control-Plane Server
//!
//! The session and dispatch plane of the fleet-management platform. It owns
//! persistent bidirectional streams to remote **agents**, authenticates and
//! dispatches **operator** actions from web clients, coordinates bulk
//! command execution across target sets, and broadcasts state changes in
//! real time.
//!
//! ## Architecture
//!
//! ```text
//! Agent ──WS──► Agent Session Manager ──► State Cache / Store
//!                      │    ▲
//!                      ▼    │ command dispatch
//!               Job Orchestrator
//!                      ▲
//! Operator ──WS──► Web Client Session Manager ──► Secure Terminal Service
//! ```
//!
//! ## Modules
//!
//! - [`agents`]    — agent stream lifecycle, registration, heartbeat accounting
//! - [`clients`]   — operator stream auth and command origination
//! - [`terminal`]  — session tokens, HMAC envelopes, replay defense, rate limits
//! - [`jobs`]      — bulk-command orchestration (parallel / rolling)
//! - [`cache`]     — write-through in-memory projection of machine state
//! - [`store`]     — persistence abstraction and the in-memory implementation
//! - [`events`]    — realtime publish/subscribe bus for web-client fan-out
//! - [`crypto`]    — secret hashing and the AES-256-GCM secret vault
//! - [`normalize`] — command-output printability filter
//! - [`dispatch`]  — dependency-inverted command dispatcher seam
//! - [`api`]       — REST query/submit adapters

pub mod agents;
pub mod api;
pub mod cache;
pub mod clients;
pub mod config;
pub mod crypto;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod jobs;
pub mod normalize;
pub mod state;
pub mod store;
pub mod terminal;
