//! Server error taxonomy.
//!
//! Each variant family maps to a distinct handling policy: protocol errors
//! close the stream, auth and crypto errors drop silently with a log,
//! dispatch errors become deterministic execution outcomes, store errors
//! are retried only when obviously transient.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Missing discriminant, failed schema validation, malformed frame.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Invalid bearer, token tampering, ACL denial. Never echoed to the
    /// caller in detail.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// HMAC mismatch, skew window exceeded, replay, decryption failure.
    #[error("crypto rejection: {0}")]
    Crypto(String),

    /// Agent offline or refused at dispatch time.
    #[error("dispatch failed: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type ServerResult<T> = Result<T, ServerError>;
