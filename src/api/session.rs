use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, Uri},
    Extension, Json,
};
use serde_json::{json, Value};
use std::path::Path as FsPath;

use super::public::contained;
use super::{body_json, body_str, ConsoleServer};
use crate::auth::{now_ms, token_from_request, verify_password, Session};
use crate::error::ApiError;

pub const MAX_BIO_CHARS: usize = 500;
const AVATAR_ROUTE: &str = "/media/avatar/";

fn session_user(session: &Session) -> Value {
    json!({ "username": session.username, "chatId": session.chat_id })
}

pub async fn login(State(state): State<ConsoleServer>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let body = body_json(&body);
    let (Some(username), Some(password)) = (body_str(&body, "username"), body.get("password").and_then(Value::as_str))
    else {
        return Err(ApiError::bad_request("username and password are required"));
    };
    let denied = || ApiError::new(StatusCode::UNAUTHORIZED, "Invalid credentials");

    let auth = state.db.owner_auth(username).await?.ok_or_else(denied)?;
    if !state.config.owner_set().contains(&auth.chat_id) {
        tracing::warn!("Login for {} refused: not an owner account", username);
        return Err(denied());
    }
    if !verify_password(password, &auth.password_salt, &auth.password_hash) {
        tracing::warn!("Login for {} refused: wrong password", username);
        return Err(denied());
    }

    let session = state.sessions.issue(&auth.chat_id, &auth.display_name, now_ms()).await;
    state.audit(&session, "login", None, None).await;
    Ok(Json(json!({
        "ok": true,
        "token": session.token,
        "expiresAt": session.expires_at,
        "user": session_user(&session),
    })))
}

pub async fn logout(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    headers: HeaderMap,
    uri: Uri,
) -> Json<Value> {
    let token = token_from_request(&headers, &uri, state.config.allow_query_token).unwrap_or(session.token.clone());
    state.sessions.revoke(&token, now_ms()).await;
    state.audit(&session, "logout", None, None).await;
    Json(json!({ "ok": true }))
}

pub async fn ping(Extension(session): Extension<Session>) -> Json<Value> {
    Json(json!({ "ok": true, "user": session_user(&session), "ts": crate::utils::now_iso() }))
}

/// Chat ids become directory names with everything outside `[A-Za-z0-9_-]`
/// replaced by `_`.
fn safe_id(chat_id: &str) -> String {
    chat_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Stored `/media/avatar/...` URL when its file exists, else the newest file
/// in the user's avatar directory.
pub(crate) fn avatar_url(avatar_root: &FsPath, chat_id: &str, stored: Option<&str>) -> Option<String> {
    if let Some(rel) = stored.and_then(|s| s.trim().strip_prefix(AVATAR_ROUTE)) {
        if let Some(full) = contained(avatar_root, rel) {
            if full.is_file() {
                return Some(format!("{}{}", AVATAR_ROUTE, rel.trim_start_matches('/')));
            }
        }
    }

    let id = safe_id(chat_id);
    let newest = std::fs::read_dir(avatar_root.join(&id))
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|e| {
            let meta = e.metadata().ok()?;
            meta.is_file().then(|| (meta.modified().ok(), e.file_name().to_string_lossy().into_owned()))
        })
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))?;
    Some(format!("{}{}/{}", AVATAR_ROUTE, id, newest.1))
}

pub async fn me(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, ApiError> {
    let row = state.db.user(&session.chat_id).await?;
    let avatar = avatar_url(
        &state.config.avatar_dir(),
        &session.chat_id,
        row.as_ref().and_then(|r| r.profile_photo_url.as_deref()),
    );
    let user = match row {
        Some(r) => json!({
            "chatId": r.chat_id,
            "username": session.username,
            "profileName": r.profile_name,
            "role": r.user_role,
            "level": r.level,
            "xp": r.xp,
            "phn": r.phn,
            "levelRole": r.level_role,
            "createdAt": r.created_at,
            "walletAddress": r.wallet_address,
            "bio": r.profile_bio,
            "avatarUrl": avatar,
        }),
        None => json!({
            "chatId": session.chat_id,
            "username": session.username,
            "role": "owner",
            "bio": null,
            "avatarUrl": avatar,
        }),
    };
    Ok(Json(json!({ "ok": true, "user": user })))
}

pub async fn set_bio(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = body_json(&body);
    let bio = body.get("bio").and_then(Value::as_str).map(str::trim).filter(|b| !b.is_empty());
    if bio.map(|b| b.chars().count() > MAX_BIO_CHARS).unwrap_or(false) {
        return Err(ApiError::bad_request(format!("Bio is limited to {} characters", MAX_BIO_CHARS)));
    }
    state.db.set_bio(&session.chat_id, bio).await?;
    state.audit(&session, "set_bio", Some(&session.chat_id), None).await;
    Ok(Json(json!({ "ok": true, "bio": bio })))
}

fn gib(bytes: u64) -> f64 {
    (bytes as f64 / 1024f64.powi(3) * 100.0).round() / 100.0
}

pub async fn info(State(state): State<ConsoleServer>) -> Result<Json<Value>, ApiError> {
    let r = state.probe.readings().await;
    let (users, bans) = state.db.counts().await?;
    Ok(Json(json!({
        "ok": true,
        "server": {
            "host": r.host_name,
            "platform": r.platform,
            "uptimeSec": r.host_uptime_sec,
            "cpuCores": r.cpu_cores,
            "totalMemGB": gib(r.total_memory),
            "freeMemGB": gib(r.available_memory),
            "processMemMB": (r.rss_bytes as f64 / 1024.0 / 1024.0).round(),
            "loadAvg": r.load_avg,
            "rebootAllowed": state.server_reboot_allowed().await,
        },
        "bot": { "users": users, "bans": bans },
    })))
}
