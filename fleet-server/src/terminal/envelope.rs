//! Secure message envelopes: canonical signing, payload normalization,
//! and replay defense.
//!
//! The HMAC covers the canonical JSON of
//! `{type, sessionId, machineId, payload, nonce, timestamp}` where
//! `payload` is a string. Canonical means compact serialization with
//! lexicographically ordered keys, which serde_json's default map gives us
//! for free. The agent reconstructs the same bytes from its copy of the
//! secret, so payload normalization before signing is mandatory — any
//! incidental key the client sent would desynchronize the two sides.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use serde_json::{json, Value};
use tracing::warn;

use crate::crypto::{hmac_sha256_hex, hmac_sha256_verify};
use fleet_protocol::SecureEnvelope;

/// Maximum remembered nonces per machine.
pub const NONCE_HISTORY_CAP: usize = 10_000;
/// How many of the oldest nonces are dropped when the cap is exceeded.
const NONCE_EVICT_BATCH: usize = 1_000;

/// Acceptable clock skew between sender timestamp and server clock.
pub const SKEW_WINDOW_SECS: i64 = 60;

/// Why an inbound envelope was rejected. Callers log this; the sender
/// never learns which check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeRejection {
    MalformedTimestamp,
    SkewExceeded,
    Replay,
    MacMismatch,
}

impl EnvelopeRejection {
    pub fn reason(self) -> &'static str {
        match self {
            Self::MalformedTimestamp => "Malformed timestamp",
            Self::SkewExceeded => "Timestamp outside clock-skew window",
            Self::Replay => "Replay detected",
            Self::MacMismatch => "HMAC mismatch",
        }
    }
}

/// Reduces a message payload to its canonical shape, then serializes it.
/// Missing fields become empty values, not absent keys.
pub fn normalize_payload(msg_type: &str, raw: &Value) -> String {
    let canonical = match msg_type {
        "terminal_input" | "terminal_stdin" => json!({
            "data": raw.get("data").and_then(Value::as_str).unwrap_or(""),
        }),
        "terminal_resize" => json!({
            "cols": raw.get("cols").and_then(Value::as_u64).unwrap_or(0),
            "rows": raw.get("rows").and_then(Value::as_u64).unwrap_or(0),
        }),
        "execute_command" => json!({
            "commandId": raw.get("commandId").and_then(Value::as_str).unwrap_or(""),
            "command": raw.get("command").and_then(Value::as_str).unwrap_or(""),
        }),
        _ => json!({}),
    };
    canonical.to_string()
}

/// Canonical signing input for an envelope.
fn signing_input(msg_type: &str, envelope_body: &EnvelopeBody<'_>) -> String {
    json!({
        "type": msg_type,
        "sessionId": envelope_body.session_id,
        "machineId": envelope_body.machine_id,
        "payload": envelope_body.payload,
        "nonce": envelope_body.nonce,
        "timestamp": envelope_body.timestamp,
    })
    .to_string()
}

struct EnvelopeBody<'a> {
    session_id: &'a str,
    machine_id: &'a str,
    payload: &'a str,
    nonce: &'a str,
    timestamp: &'a str,
}

/// Wraps a normalized payload string in a signed envelope.
pub fn create_secure_message(
    agent_secret: &str,
    msg_type: &str,
    session_id: &str,
    machine_id: &str,
    payload: String,
) -> SecureEnvelope {
    let mut nonce_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = hex::encode(nonce_bytes);
    let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    let hmac = hmac_sha256_hex(
        agent_secret.as_bytes(),
        signing_input(
            msg_type,
            &EnvelopeBody {
                session_id,
                machine_id,
                payload: &payload,
                nonce: &nonce,
                timestamp: &timestamp,
            },
        )
        .as_bytes(),
    );

    SecureEnvelope {
        session_id: session_id.to_string(),
        machine_id: machine_id.to_string(),
        payload,
        nonce,
        timestamp,
        hmac,
    }
}

/// Verifies an inbound envelope. Checks run in order — skew window, replay,
/// MAC — aborting on the first failure. The nonce is recorded the moment it
/// passes the replay check, per protocol, even if the MAC later fails.
pub fn validate_secure_message(
    agent_secret: &str,
    msg_type: &str,
    envelope: &SecureEnvelope,
    history: &NonceHistory,
    now: DateTime<Utc>,
) -> Result<(), EnvelopeRejection> {
    let ts = DateTime::parse_from_rfc3339(&envelope.timestamp)
        .map_err(|_| EnvelopeRejection::MalformedTimestamp)?
        .with_timezone(&Utc);
    if (now - ts).num_seconds().abs() > SKEW_WINDOW_SECS {
        return Err(EnvelopeRejection::SkewExceeded);
    }

    if !history.observe(&envelope.machine_id, &envelope.nonce) {
        warn!(
            machine_id = %envelope.machine_id,
            session_id = %envelope.session_id,
            "replay detected"
        );
        return Err(EnvelopeRejection::Replay);
    }

    let input = signing_input(
        msg_type,
        &EnvelopeBody {
            session_id: &envelope.session_id,
            machine_id: &envelope.machine_id,
            payload: &envelope.payload,
            nonce: &envelope.nonce,
            timestamp: &envelope.timestamp,
        },
    );
    if !hmac_sha256_verify(agent_secret.as_bytes(), input.as_bytes(), &envelope.hmac) {
        return Err(EnvelopeRejection::MacMismatch);
    }
    Ok(())
}

#[derive(Default)]
struct NonceSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

/// Bounded per-machine record of recently seen nonces.
#[derive(Default)]
pub struct NonceHistory {
    per_machine: DashMap<String, Mutex<NonceSet>>,
}

impl NonceHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the nonce was already seen. A fresh nonce is
    /// recorded; when the set exceeds the cap the oldest batch is evicted
    /// in FIFO order.
    pub fn observe(&self, machine_id: &str, nonce: &str) -> bool {
        let entry = self
            .per_machine
            .entry(machine_id.to_string())
            .or_default();
        let mut set = entry.lock();
        if set.seen.contains(nonce) {
            return false;
        }
        set.seen.insert(nonce.to_string());
        set.order.push_back(nonce.to_string());
        if set.order.len() > NONCE_HISTORY_CAP {
            for _ in 0..NONCE_EVICT_BATCH {
                if let Some(old) = set.order.pop_front() {
                    set.seen.remove(&old);
                }
            }
        }
        true
    }

    pub fn clear(&self, machine_id: &str) {
        self.per_machine.remove(machine_id);
    }

    #[cfg(test)]
    fn len(&self, machine_id: &str) -> usize {
        self.per_machine
            .get(machine_id)
            .map(|s| s.lock().order.len())
            .unwrap_or(0)
    }
}
