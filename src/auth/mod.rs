//! Owner sessions: password verification, bearer tokens with a TTL, and the
//! middleware that guards every authenticated route.

pub mod rate_limit;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, Request, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::persist::{load_or_warn, JsonPort};

pub const PBKDF2_ROUNDS: u32 = 120_000;
const KEY_LEN: usize = 32;

/// Hex PBKDF2-HMAC-SHA256 of `password`, salted with the stored salt string.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), PBKDF2_ROUNDS, &mut key);
    hex::encode(key)
}

/// Compares in constant time over the decoded bytes.
pub fn verify_password(password: &str, salt: &str, expected_hex: &str) -> bool {
    let (Ok(actual), Ok(expected)) = (hex::decode(hash_password(password, salt)), hex::decode(expected_hex)) else {
        return false;
    };
    if actual.len() != expected.len() {
        return false;
    }
    actual.iter().zip(expected.iter()).fold(0u8, |acc, (a, b)| acc | (a ^ b)) == 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub token: String,
    pub chat_id: String,
    pub username: String,
    /// Unix milliseconds.
    pub expires_at: i64,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// In-memory session table mirrored to a JSON document. Only unexpired
/// sessions are written, so the file never grows past the live set.
pub struct SessionStore {
    port: Arc<dyn JsonPort>,
    ttl_ms: i64,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionStore {
    /// Reloads the unexpired sessions persisted by a previous run.
    pub async fn load(port: Arc<dyn JsonPort>, ttl_hours: u64, now: i64) -> Self {
        let mut sessions = HashMap::new();
        if let Some(raw) = load_or_warn(port.as_ref(), "sessions").await {
            let list = raw.get("sessions").and_then(Value::as_array).cloned().unwrap_or_default();
            for item in list {
                match serde_json::from_value::<Session>(item) {
                    Ok(s) if !s.token.trim().is_empty() && s.expires_at > now => {
                        sessions.insert(s.token.clone(), s);
                    }
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Dropping unreadable session entry: {}", e),
                }
            }
        }
        Self {
            port,
            ttl_ms: i64::try_from(ttl_hours.saturating_mul(3_600_000)).unwrap_or(i64::MAX),
            sessions: Mutex::new(sessions),
        }
    }

    async fn persist(&self, sessions: &HashMap<String, Session>, now: i64) {
        let live: Vec<&Session> = sessions.values().filter(|s| s.expires_at > now).collect();
        if let Err(e) = self.port.save(&json!({ "sessions": live })).await {
            tracing::warn!("Failed to persist sessions: {}", e);
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn issue(&self, chat_id: &str, username: &str, now: i64) -> Session {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let session = Session {
            token: hex::encode(bytes),
            chat_id: chat_id.to_string(),
            username: username.to_string(),
            expires_at: now.saturating_add(self.ttl_ms),
        };
        let mut sessions = self.sessions.lock().await;
        sessions.insert(session.token.clone(), session.clone());
        self.persist(&sessions, now).await;
        tracing::info!("Session issued for {}", username);
        session
    }

    /// Expired sessions are dropped on lookup.
    pub async fn get(&self, token: &str, now: i64) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get(token)?.clone();
        if now > session.expires_at {
            sessions.remove(token);
            self.persist(&sessions, now).await;
            return None;
        }
        Some(session)
    }

    pub async fn revoke(&self, token: &str, now: i64) {
        let mut sessions = self.sessions.lock().await;
        if sessions.remove(token).is_some() {
            tracing::info!("Session revoked");
        }
        self.persist(&sessions, now).await;
    }
}

/// `Authorization: Bearer <token>`, or `?token=` when query tokens are allowed.
pub fn token_from_request(headers: &HeaderMap, uri: &Uri, allow_query: bool) -> Option<String> {
    let raw = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()).unwrap_or("");
    let parts: Vec<&str> = raw.split(' ').collect();
    if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") && !parts[1].is_empty() {
        return Some(parts[1].to_string());
    }
    if !allow_query {
        return None;
    }
    uri.query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == "token")
        .and_then(|(_, v)| urlencoding::decode(v).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct SessionGuard {
    pub sessions: Arc<SessionStore>,
    pub allow_query_token: bool,
}

fn not_logged_in() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "ok": false, "error": "Not logged in" }))).into_response()
}

/// axum middleware: resolves the session and hands it to handlers as an
/// `Extension<Session>`.
pub async fn require_session(
    State(guard): State<SessionGuard>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = token_from_request(req.headers(), req.uri(), guard.allow_query_token) else {
        return not_logged_in();
    };
    match guard.sessions.get(&token, now_ms()).await {
        Some(session) => {
            req.extensions_mut().insert(session);
            next.run(req).await
        }
        None => {
            tracing::debug!("Rejected request to {} with unknown or expired token", req.uri().path());
            not_logged_in()
        }
    }
}
