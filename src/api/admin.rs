use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::public::public_base_url;
use super::{body_json, body_str, ConsoleServer};
use crate::admin::ops::OP_OUTPUT_KEEP;
use crate::admin::AdminError;
use crate::auth::Session;
use crate::control::ManagedTarget;
use crate::error::ApiError;
use crate::health::alerts::derive_alerts;

const ROLES: [&str; 3] = ["owner", "admin", "user"];

fn limit_param(query: &HashMap<String, String>, default: usize, max: usize) -> usize {
    query
        .get("limit")
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
        .clamp(1, max)
}

pub async fn summary(State(state): State<ConsoleServer>, headers: HeaderMap) -> Json<Value> {
    let readings = state.probe.readings().await;
    let mut processes = serde_json::Map::new();
    for t in ManagedTarget::ALL {
        let v = match state.resolver.status(t).await {
            Ok(s) => json!(s),
            Err(e) => json!({ "status": "unknown", "error": e.to_string(), "code": e.code() }),
        };
        processes.insert(t.as_str().to_string(), v);
    }
    Json(json!({
        "ok": true,
        "server": {
            "host": readings.host_name,
            "platform": readings.platform,
            "uptimeSec": readings.host_uptime_sec,
            "publicEndpoint": public_base_url(&state.config, &headers),
            "rebootAllowed": state.server_reboot_allowed().await,
        },
        "processes": processes,
    }))
}

pub async fn alerts(State(state): State<ConsoleServer>) -> Json<Value> {
    let (snapshot, readings) = state.health.snapshot_with_readings().await;
    let enabled = state.flags.get().await.alerts_enabled;
    let alerts = if enabled { derive_alerts(&snapshot, &readings) } else { Vec::new() };
    Json(json!({ "ok": true, "enabled": enabled, "alerts": alerts, "health": snapshot }))
}

pub async fn get_flags(State(state): State<ConsoleServer>) -> Json<Value> {
    Json(json!({ "ok": true, "flags": state.flags.get().await }))
}

pub async fn set_flags(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<Json<Value>, AdminError> {
    let patch = body_json(&body);
    let flags = state.flags.patch(&patch).await?;
    state.audit(&session, "set_flags", None, Some(patch)).await;
    Ok(Json(json!({ "ok": true, "flags": flags })))
}

pub async fn run_op(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), AdminError> {
    let body = body_json(&body);
    let op = body_str(&body, "op").ok_or(AdminError::MissingOp)?;
    let args = body.get("args").cloned().unwrap_or_else(|| json!({}));
    let result = state.ops.run(op, args, OP_OUTPUT_KEEP).await?;
    state
        .audit(&session, "admin_op", Some(&result.op), Some(json!({ "ok": result.ok, "cmd": result.cmd })))
        .await;
    let status = if result.ok { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    Ok((status, Json(json!(result))))
}

pub async fn list_jobs(State(state): State<ConsoleServer>) -> Json<Value> {
    Json(json!({ "ok": true, "rows": state.jobs.list().await }))
}

pub async fn create_job(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    body: Bytes,
) -> Result<Json<Value>, AdminError> {
    let body = body_json(&body);
    let op = body_str(&body, "op").unwrap_or("");
    let job = state.jobs.create(op, body_str(&body, "runAt"), chrono::Utc::now()).await?;
    state
        .audit(&session, "job_create", Some(&job.id), Some(json!({ "op": job.op, "runAt": job.run_at })))
        .await;
    Ok(Json(json!({ "ok": true, "job": job })))
}

pub async fn delete_job(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    Path(id): Path<String>,
) -> Result<Json<Value>, AdminError> {
    state.jobs.delete(id.trim()).await?;
    state.audit(&session, "job_delete", Some(id.trim()), None).await;
    Ok(Json(json!({ "ok": true })))
}

pub async fn audit(
    State(state): State<ConsoleServer>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.db.list_audit(limit_param(&query, 100, 500)).await?;
    Ok(Json(json!({ "ok": true, "rows": rows })))
}

pub async fn users(
    State(state): State<ConsoleServer>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let rows = state.db.list_users(limit_param(&query, 200, 2000)).await?;
    Ok(Json(json!({ "ok": true, "rows": rows })))
}

pub async fn set_role(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    Path(chat_id): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let body = body_json(&body);
    let role = body_str(&body, "role").map(str::to_lowercase).unwrap_or_default();
    if !ROLES.contains(&role.as_str()) {
        return Err(ApiError::bad_request("role must be owner|admin|user"));
    }
    let chat_id = chat_id.trim();
    if state.db.set_user_role(chat_id, &role).await? == 0 {
        return Err(ApiError::not_found("User not found"));
    }
    state.audit(&session, "set_user_role", Some(chat_id), Some(json!({ "role": role }))).await;
    tracing::info!("Role of {} set to {} by {}", chat_id, role, session.username);
    Ok(Json(json!({ "ok": true, "chat_id": chat_id, "role": role })))
}
