//! Web-client bearer authentication.
//!
//! The upgrade request may deliver the token four ways, tried in priority
//! order: `Authorization: Bearer`, the `token` query parameter, the
//! `session` cookie, or a `Sec-WebSocket-Protocol: jwt.<token>` entry.
//! The token is an HS256 claim whose verification yields the user id and
//! an optional display name.

use axum::http::header::{AUTHORIZATION, COOKIE, SEC_WEBSOCKET_PROTOCOL};
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::{ServerError, ServerResult};

#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub user_id: String,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    username: Option<String>,
    #[allow(dead_code)]
    exp: u64,
}

/// Pulls the bearer token out of the upgrade request, in priority order.
pub fn extract_token(headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
    if let Some(value) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    if let Some(token) = query_token {
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    if let Some(cookies) = headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookies.split(';') {
            if let Some((name, value)) = pair.trim().split_once('=') {
                if name == "session" && !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }

    if let Some(protocols) = headers
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
    {
        for entry in protocols.split(',') {
            if let Some(token) = entry.trim().strip_prefix("jwt.") {
                if !token.is_empty() {
                    return Some(token.to_string());
                }
            }
        }
    }

    None
}

/// Verifies the bearer and yields the authenticated identity.
pub fn verify_token(token: &str, secret: &str) -> ServerResult<AuthedUser> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::new(Algorithm::HS256),
    )
    .map_err(|e| ServerError::Unauthorized(format!("bearer rejected: {e}")))?;

    Ok(AuthedUser {
        user_id: data.claims.sub,
        username: data.claims.username,
    })
}

#[cfg(test)]
pub(crate) fn mint_token(user_id: &str, username: Option<&str>, secret: &str) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    let claims = json!({
        "sub": user_id,
        "username": username,
        "exp": chrono::Utc::now().timestamp() as u64 + 600,
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
