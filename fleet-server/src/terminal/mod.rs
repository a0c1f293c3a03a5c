//! # Secure Remote Terminal Service
//!
//! The security kernel of the control plane. Four concerns: **issue**
//! session tokens, **wrap** operator actions in HMAC envelopes, **verify**
//! inbound envelopes, **admit** traffic through per-session rate limits.
//!
//! Tokens live in-process only; the store retains just the audit trail of
//! session starts and ends.

pub mod envelope;
pub mod ratelimit;

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::crypto::{hmac_sha256_hex, hmac_sha256_verify};
use crate::error::{ServerError, ServerResult};
use crate::events::EventBus;
use crate::store::{AuditRow, Store};
use envelope::{EnvelopeRejection, NonceHistory};
use fleet_protocol::{SecureEnvelope, ServerEvent};
use ratelimit::RateLimiter;

/// Session tokens live at most this long without a refresh.
pub const TOKEN_TTL_SECS: i64 = 300;
/// A validation this close to expiry silently extends the token.
pub const REFRESH_THRESHOLD_SECS: i64 = 60;

/// What a session token authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Spawn,
    Input,
    Resize,
    ExecuteCommand,
}

/// Default capability set for an interactive terminal.
pub fn terminal_capabilities() -> Vec<Capability> {
    vec![Capability::Spawn, Capability::Input, Capability::Resize]
}

/// An issued terminal-session token. The signature covers the canonical
/// JSON of every other field, keyed by the server session-token secret.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionToken {
    pub session_id: String,
    pub user_id: String,
    pub machine_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub capabilities: Vec<Capability>,
    pub signature: String,
}

impl SessionToken {
    pub fn has_capability(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

pub struct TerminalService {
    signing_key: String,
    active: DashMap<String, SessionToken>,
    limiter: RateLimiter,
    nonces: NonceHistory,
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl TerminalService {
    pub fn new(signing_key: String, store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self {
            signing_key,
            active: DashMap::new(),
            limiter: RateLimiter::new(),
            nonces: NonceHistory::new(),
            store,
            bus,
        }
    }

    fn sign(&self, token: &SessionToken) -> String {
        let input = json!({
            "sessionId": token.session_id,
            "userId": token.user_id,
            "machineId": token.machine_id,
            "issuedAt": token.issued_at,
            "expiresAt": token.expires_at,
            "capabilities": token.capabilities,
        })
        .to_string();
        hmac_sha256_hex(self.signing_key.as_bytes(), input.as_bytes())
    }

    fn verify_signature(&self, token: &SessionToken) -> bool {
        let input = json!({
            "sessionId": token.session_id,
            "userId": token.user_id,
            "machineId": token.machine_id,
            "issuedAt": token.issued_at,
            "expiresAt": token.expires_at,
            "capabilities": token.capabilities,
        })
        .to_string();
        hmac_sha256_verify(self.signing_key.as_bytes(), input.as_bytes(), &token.signature)
    }

    // ── Issue ───────────────────────────────────────────────────

    /// Issues a session token for `user_id` on `machine_id`. Everyone but
    /// the internal `system` principal must hold an access grant for the
    /// machine.
    pub async fn issue_session(
        &self,
        user_id: &str,
        machine_id: &str,
        capabilities: Vec<Capability>,
    ) -> ServerResult<SessionToken> {
        if user_id != "system" && !self.store.user_can_access(user_id, machine_id).await? {
            warn!(user_id, machine_id, "terminal session denied by ACL");
            return Err(ServerError::Unauthorized("access denied".into()));
        }

        let now = Utc::now().timestamp();
        let mut token = SessionToken {
            session_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            machine_id: machine_id.to_string(),
            issued_at: now,
            expires_at: now + TOKEN_TTL_SECS,
            capabilities,
            signature: String::new(),
        };
        token.signature = self.sign(&token);

        self.active.insert(token.session_id.clone(), token.clone());
        self.limiter.create(&token.session_id);

        info!(
            session_id = %token.session_id,
            user_id,
            machine_id,
            "terminal session opened"
        );
        self.audit(
            "SHELL_OPEN",
            Some(&token.user_id),
            Some(&token.machine_id),
            Some(&token.session_id),
            Some(json!({ "capabilities": token.capabilities })),
        )
        .await;

        Ok(token)
    }

    // ── Validate & refresh ──────────────────────────────────────

    /// A token is valid iff it is unexpired, carries an authentic
    /// signature, and is still in the active table. Tokens within the
    /// refresh threshold of expiry are silently extended.
    pub async fn validate_session(&self, session_id: &str) -> ServerResult<SessionToken> {
        let now = Utc::now().timestamp();

        let expired = {
            let Some(entry) = self.active.get(session_id) else {
                return Err(ServerError::Unauthorized("unknown session".into()));
            };
            entry.expires_at <= now
        };
        if expired {
            self.end_session(session_id, "expired").await;
            return Err(ServerError::Unauthorized("session expired".into()));
        }

        let mut entry = self
            .active
            .get_mut(session_id)
            .ok_or_else(|| ServerError::Unauthorized("unknown session".into()))?;

        if !self.verify_signature(&entry) {
            warn!(session_id, "session token signature mismatch");
            return Err(ServerError::Unauthorized("invalid session signature".into()));
        }

        if now + REFRESH_THRESHOLD_SECS >= entry.expires_at {
            entry.expires_at = now + TOKEN_TTL_SECS;
            entry.signature = self.sign(&entry);
        }

        Ok(entry.clone())
    }

    // ── Wrap & verify envelopes ─────────────────────────────────

    /// Normalizes `raw_payload` for `msg_type` and wraps it in an envelope
    /// signed with the machine's plaintext secret.
    pub fn wrap(
        &self,
        agent_secret: &str,
        msg_type: &str,
        token: &SessionToken,
        raw_payload: &Value,
    ) -> SecureEnvelope {
        let payload = envelope::normalize_payload(msg_type, raw_payload);
        envelope::create_secure_message(
            agent_secret,
            msg_type,
            &token.session_id,
            &token.machine_id,
            payload,
        )
    }

    /// Verifies an agent-originated envelope: skew window, replay, MAC.
    /// The failure detail is logged, never returned to the sender.
    pub fn validate_inbound(
        &self,
        agent_secret: &str,
        msg_type: &str,
        env: &SecureEnvelope,
    ) -> Result<(), EnvelopeRejection> {
        envelope::validate_secure_message(agent_secret, msg_type, env, &self.nonces, Utc::now())
    }

    pub fn clear_nonce_history(&self, machine_id: &str) {
        self.nonces.clear(machine_id);
    }

    // ── Admit ───────────────────────────────────────────────────

    /// One token per machine-bound operator action. Denials increment the
    /// session's excess counter; every 10th excess is warned.
    pub fn consume_rate(&self, session_id: &str) -> bool {
        let outcome = self.limiter.consume(session_id);
        if !outcome.allowed && outcome.exceeded_count % 10 == 0 && outcome.exceeded_count > 0 {
            warn!(
                session_id,
                exceeded = outcome.exceeded_count,
                "session rate limit exceeded"
            );
        }
        outcome.allowed
    }

    // ── End ─────────────────────────────────────────────────────

    /// Removes the session and its bucket, audits `SHELL_CLOSE` with the
    /// session duration. Returns false if the session was already gone.
    pub async fn end_session(&self, session_id: &str, reason: &str) -> bool {
        let Some((_, token)) = self.active.remove(session_id) else {
            return false;
        };
        self.limiter.remove(session_id);

        let duration = Utc::now().timestamp() - token.issued_at;
        info!(session_id, reason, duration, "terminal session closed");
        self.audit(
            "SHELL_CLOSE",
            Some(&token.user_id),
            Some(&token.machine_id),
            Some(session_id),
            Some(json!({ "durationSeconds": duration, "reason": reason })),
        )
        .await;
        true
    }

    pub fn sessions_for_user(&self, user_id: &str) -> Vec<String> {
        self.active
            .iter()
            .filter(|t| t.user_id == user_id)
            .map(|t| t.session_id.clone())
            .collect()
    }

    /// Ends every session the user owns (web-client disconnect path).
    pub async fn end_sessions_for_user(&self, user_id: &str, reason: &str) {
        for session_id in self.sessions_for_user(user_id) {
            self.end_session(&session_id, reason).await;
        }
    }

    /// Ends sessions whose token lapsed without a validation-triggered
    /// refresh. Run periodically.
    pub async fn sweep_expired(&self) {
        let now = Utc::now().timestamp();
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|t| t.expires_at <= now)
            .map(|t| t.session_id.clone())
            .collect();
        for session_id in expired {
            self.end_session(&session_id, "expired").await;
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.active.len()
    }

    async fn audit(
        &self,
        event: &str,
        user_id: Option<&str>,
        machine_id: Option<&str>,
        session_id: Option<&str>,
        details: Option<Value>,
    ) {
        let now = Utc::now();
        let row = AuditRow {
            id: Uuid::new_v4().to_string(),
            event: event.to_string(),
            user_id: user_id.map(str::to_string),
            machine_id: machine_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
            details: details.clone(),
            timestamp: now,
        };
        if let Err(e) = self.store.insert_audit(row).await {
            warn!(error = %e, event, "audit write failed");
        }
        self.bus.publish(ServerEvent::AuditLog {
            event: event.to_string(),
            user_id: user_id.map(str::to_string),
            machine_id: machine_id.map(str::to_string),
            session_id: session_id.map(str::to_string),
            details,
            timestamp: now.to_rfc3339_opts(SecondsFormat::Millis, true),
        });
    }

    #[cfg(test)]
    pub(crate) fn force_expires_at(&self, session_id: &str, expires_at: i64) {
        if let Some(mut entry) = self.active.get_mut(session_id) {
            entry.expires_at = expires_at;
            entry.signature = self.sign(&entry);
        }
    }

    #[cfg(test)]
    pub(crate) fn tamper_signature(&self, session_id: &str) {
        if let Some(mut entry) = self.active.get_mut(session_id) {
            entry.signature = format!("{}00", entry.signature);
        }
    }

    #[cfg(test)]
    pub(crate) fn current_expiry(&self, session_id: &str) -> Option<i64> {
        self.active.get(session_id).map(|t| t.expires_at)
    }
}
