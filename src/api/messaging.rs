use axum::{
    body::Bytes,
    extract::{Query, State},
    Extension, Json,
};
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{body_json, body_str, ConsoleServer};
use crate::auth::Session;
use crate::db::{OutboxEntry, UserRef};
use crate::error::ApiError;

pub const MAX_MESSAGE_CHARS: usize = 4096;
const SCOPES: [&str; 3] = ["users", "groups", "all"];

fn digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

fn phone_of(body: &Value) -> String {
    body_str(body, "phone").or_else(|| body_str(body, "number")).map(digits).unwrap_or_default()
}

fn user_json(user: &UserRef) -> Value {
    json!({ "chatId": user.chat_id, "profileName": user.profile_name })
}

async fn user_by_phone(state: &ConsoleServer, body: &Value) -> Result<UserRef, ApiError> {
    let phone = phone_of(body);
    if phone.is_empty() {
        return Err(ApiError::bad_request("Phone number is required"));
    }
    state
        .db
        .find_user_by_phone(&phone)
        .await?
        .ok_or_else(|| ApiError::not_found("No user found with this number"))
}

fn message_text(body: &Value) -> Result<&str, ApiError> {
    let text = body_str(body, "text")
        .or_else(|| body_str(body, "message"))
        .ok_or_else(|| ApiError::bad_request("Message text is required"))?;
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ApiError::bad_request(format!("Message is limited to {} characters", MAX_MESSAGE_CHARS)));
    }
    Ok(text)
}

fn signature(session: &Session) -> String {
    format!("— {}", session.username)
}

pub async fn ban(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = body_json(&body);
    let user = user_by_phone(&state, &body).await?;
    if state.config.owner_set().contains(&user.chat_id) {
        return Err(ApiError::bad_request("Owners cannot be banned"));
    }

    let reason = body_str(&body, "reason");
    let hours = body.get("durationHours").and_then(Value::as_f64).filter(|h| h.is_finite() && *h > 0.0);
    let expires_at = hours.map(|h| {
        (Utc::now() + Duration::seconds((h * 3600.0).round() as i64)).to_rfc3339_opts(SecondsFormat::Millis, true)
    });

    state.db.set_ban(&user.chat_id, reason, expires_at.as_deref(), &session.chat_id).await?;
    state
        .audit(&session, "ban", Some(&user.chat_id), Some(json!({ "reason": reason, "expiresAt": expires_at })))
        .await;
    tracing::info!("{} banned by {}", user.chat_id, session.username);
    Ok(Json(json!({
        "ok": true,
        "user": user_json(&user),
        "ban": {
            "reason": reason.unwrap_or("No reason"),
            "expiresAt": expires_at,
            "permanent": expires_at.is_none(),
        },
    })))
}

pub async fn unban(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = body_json(&body);
    let user = user_by_phone(&state, &body).await?;
    let removed = state.db.clear_ban(&user.chat_id).await?;
    state.audit(&session, "unban", Some(&user.chat_id), Some(json!({ "removed": removed }))).await;
    Ok(Json(json!({ "ok": true, "user": user_json(&user) })))
}

pub async fn bans(State(state): State<ConsoleServer>) -> Result<Json<Value>, ApiError> {
    Ok(Json(json!({ "ok": true, "rows": state.db.list_bans().await? })))
}

pub async fn message(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = body_json(&body);
    let phone = phone_of(&body);
    if phone.len() < 6 {
        return Err(ApiError::bad_request("Invalid phone number"));
    }
    let text = message_text(&body)?;
    let jid = format!("{}@s.whatsapp.net", phone);
    let id = state
        .db
        .queue_message(OutboxEntry::Single { jid: &jid }, text, &signature(&session), &session.chat_id)
        .await?;
    state.audit(&session, "message", Some(&jid), Some(json!({ "outboxId": id }))).await;
    Ok(Json(json!({ "ok": true, "queued": true, "id": id, "target": jid })))
}

pub async fn broadcast(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = body_json(&body);
    let scope = body_str(&body, "scope").map(str::to_lowercase).unwrap_or_default();
    if !SCOPES.contains(&scope.as_str()) {
        return Err(ApiError::bad_request("scope must be users|groups|all"));
    }
    let text = message_text(&body)?;
    let id = state
        .db
        .queue_message(OutboxEntry::Broadcast { scope: &scope }, text, &signature(&session), &session.chat_id)
        .await?;
    state.audit(&session, "broadcast", None, Some(json!({ "scope": scope, "outboxId": id }))).await;
    tracing::info!("Broadcast to {} queued by {}", scope, session.username);
    Ok(Json(json!({ "ok": true, "queued": true, "id": id, "scope": scope })))
}

pub async fn outbox(
    State(state): State<ConsoleServer>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let status = query.get("status").map(String::as_str).unwrap_or("all");
    let limit = query
        .get("limit")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(100)
        .clamp(1, 500);
    let rows = state.db.list_outbox(status, limit).await?;
    Ok(Json(json!({ "ok": true, "rows": rows })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::harness;
    use crate::config::ConsoleConfig;
    use crate::testing::ScriptedRunner;
    use axum::http::StatusCode;

    async fn with_users() -> crate::api::test_support::Harness {
        let config = ConsoleConfig { owner_ids: vec!["4900000001@s.whatsapp.net".to_string()], ..Default::default() };
        let h = harness(ScriptedRunner::missing_pm2(), config).await;
        h.server
            .db
            .exec(
                "INSERT INTO users (chat_id, profile_name) VALUES
                 ('4900000001@s.whatsapp.net', 'Owner'), ('4917612345678@s.whatsapp.net', 'Mallory');",
            )
            .await
            .unwrap();
        h
    }

    #[tokio::test]
    async fn test_ban_unban_cycle() {
        let h = with_users().await;
        let req = h.authed("POST", "/api/ban", Some(json!({ "phone": "+49 176 12345678", "durationHours": 2 })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["user"]["profileName"], "Mallory");
        assert_eq!(body["ban"]["reason"], "No reason");
        assert_eq!(body["ban"]["permanent"], false);

        let (_, body) = h.call(h.authed("GET", "/api/bans", None)).await;
        assert_eq!(body["rows"][0]["chat_id"], "4917612345678@s.whatsapp.net");

        let req = h.authed("POST", "/api/unban", Some(json!({ "phone": "4917612345678" })));
        assert_eq!(h.call(req).await.0, StatusCode::OK);
        let (_, body) = h.call(h.authed("GET", "/api/bans", None)).await;
        assert_eq!(body["rows"], json!([]));
    }

    #[tokio::test]
    async fn test_ban_refusals() {
        let h = with_users().await;
        let req = h.authed("POST", "/api/ban", Some(json!({ "phone": "4900000001" })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Owners cannot be banned");

        let req = h.authed("POST", "/api/ban", Some(json!({ "phone": "12399999" })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "No user found with this number");

        let req = h.authed("POST", "/api/ban", Some(json!({ "reason": "spam" })));
        assert_eq!(h.call(req).await.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_message_and_broadcast_are_queued() {
        let h = with_users().await;
        let req = h.authed("POST", "/api/message", Some(json!({ "phone": "0176-1234567", "text": "hi" })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["target"], "01761234567@s.whatsapp.net");

        let req = h.authed("POST", "/api/message", Some(json!({ "phone": "12", "text": "hi" })));
        assert_eq!(h.call(req).await.0, StatusCode::BAD_REQUEST);
        let req = h.authed("POST", "/api/message", Some(json!({ "phone": "01761234567", "text": "  " })));
        assert_eq!(h.call(req).await.0, StatusCode::BAD_REQUEST);

        let req = h.authed("POST", "/api/broadcast", Some(json!({ "scope": "everyone", "text": "x" })));
        assert_eq!(h.call(req).await.0, StatusCode::BAD_REQUEST);
        let req = h.authed("POST", "/api/broadcast", Some(json!({ "scope": "Groups", "text": "maintenance at 22:00" })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scope"], "groups");

        let (_, body) = h.call(h.authed("GET", "/api/outbox?status=pending&limit=1", None)).await;
        let rows = body["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["kind"], "broadcast");
        assert_eq!(rows[0]["signature"], "— Boss");

        let (_, body) = h.call(h.authed("GET", "/api/outbox?status=sent", None)).await;
        assert_eq!(body["rows"], json!([]));
    }
}
