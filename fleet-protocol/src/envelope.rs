//! The HMAC-authenticated envelope wrapped around every machine-bound
//! operator action (and optionally around agent-originated terminal output).
//!
//! The `payload` field is a JSON **string**, not an object: the MAC is
//! computed over that exact string, so both ends must agree on the
//! normalized payload shape before signing. Normalization and MAC
//! computation live on the server side; this crate only carries the frame.

use serde::{Deserialize, Serialize};

/// Outer secure-message frame.
///
/// `hmac` is HMAC-SHA256 over the canonical JSON of
/// `{type, sessionId, machineId, payload, nonce, timestamp}` keyed by the
/// target machine's registration secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureEnvelope {
    pub session_id: String,
    pub machine_id: String,
    /// Normalized payload, pre-serialized to a JSON string.
    pub payload: String,
    /// 128-bit random nonce, hex-encoded.
    pub nonce: String,
    /// ISO-8601 timestamp with millisecond precision.
    pub timestamp: String,
    pub hmac: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_with_camel_case_keys() {
        let env = SecureEnvelope {
            session_id: "s1".into(),
            machine_id: "m1".into(),
            payload: r#"{"data":"ls\n"}"#.into(),
            nonce: "00ff".into(),
            timestamp: "2026-08-01T00:00:00.000Z".into(),
            hmac: "ab".into(),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"sessionId\""));
        assert!(json.contains("\"machineId\""));
        let back: SecureEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
