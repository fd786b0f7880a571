use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde_json::{json, Value};
use std::collections::HashMap;

use super::{body_json, ConsoleServer};
use crate::auth::Session;
use crate::db::backup::{self, file_meta};
use crate::db::browser::{BrowseError, DEFAULT_PAGE, MAX_PAGE};
use crate::error::ApiError;

fn query_usize(query: &HashMap<String, String>, key: &str) -> Option<usize> {
    query.get(key).and_then(|v| v.trim().parse::<usize>().ok())
}

fn parse_rowid(raw: &str) -> Result<i64, BrowseError> {
    raw.trim().parse::<i64>().ok().filter(|id| *id > 0).ok_or(BrowseError::BadRowId)
}

pub async fn tables(State(state): State<ConsoleServer>) -> Result<Json<Value>, ApiError> {
    let tables = state.db.list_tables().await?;
    Ok(Json(json!({ "ok": true, "tables": tables })))
}

pub async fn rows(
    State(state): State<ConsoleServer>,
    Path(table): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let limit = query_usize(&query, "limit").unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = query_usize(&query, "offset").unwrap_or(0);
    let q = query.get("q").map(String::as_str).unwrap_or("");
    let page = state.db.list_rows(table.trim(), limit, offset, q).await?;
    Ok(Json(json!({
        "ok": true,
        "table": page.table,
        "limit": page.limit,
        "offset": page.offset,
        "q": page.q,
        "columns": page.columns,
        "rows": page.rows,
    })))
}

pub async fn get_row(
    State(state): State<ConsoleServer>,
    Path((table, rowid)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let record = state.db.get_row(table.trim(), parse_rowid(&rowid)?).await?;
    Ok(Json(json!({
        "ok": true,
        "table": record.table,
        "rowid": record.rowid,
        "columns": record.columns,
        "row": record.row,
    })))
}

/// Accepts `{data: {...}}` or the bare column object.
fn row_data(body: Value) -> Value {
    match body.get("data") {
        Some(data) if data.is_object() => data.clone(),
        _ => body,
    }
}

pub async fn insert_row(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    Path(table): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let table = table.trim();
    let data = row_data(body_json(&body));
    let rowid = state.db.insert_row(table, &data).await?;
    state.audit(&session, "db_insert", Some(table), Some(json!({ "rowid": rowid }))).await;
    Ok(Json(json!({ "ok": true, "table": table, "rowid": rowid })))
}

pub async fn update_row(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    Path((table, rowid)): Path<(String, String)>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let table = table.trim();
    let rowid = parse_rowid(&rowid)?;
    let data = row_data(body_json(&body));
    let changed = state.db.update_row(table, rowid, &data).await?;
    state
        .audit(&session, "db_update", Some(table), Some(json!({ "rowid": rowid, "changed": changed })))
        .await;
    Ok(Json(json!({ "ok": true, "table": table, "rowid": rowid, "changed": changed })))
}

pub async fn delete_row(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    Path((table, rowid)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let table = table.trim();
    let rowid = parse_rowid(&rowid)?;
    let deleted = state.db.delete_row(table, rowid).await?;
    state
        .audit(&session, "db_delete", Some(table), Some(json!({ "rowid": rowid, "deleted": deleted })))
        .await;
    Ok(Json(json!({ "ok": true, "table": table, "rowid": rowid, "deleted": deleted })))
}

pub async fn maintenance(State(state): State<ConsoleServer>) -> Result<Json<Value>, ApiError> {
    let db_file = state.db.path().map(|p| p.to_path_buf()).unwrap_or_else(|| state.config.db_file());
    let backup_dir = state.config.backup_dir();
    let backups = backup::list_backups(&backup_dir, 20)?;
    Ok(Json(json!({
        "ok": true,
        "dbFile": db_file.display().to_string(),
        "db": file_meta(&db_file),
        "backupDir": backup_dir.display().to_string(),
        "keep": state.config.db_backup_keep,
        "backups": backups,
    })))
}

pub async fn integrity(State(state): State<ConsoleServer>) -> Result<Response, ApiError> {
    let result = state.db.integrity_check().await?;
    let ok = result.eq_ignore_ascii_case("ok");
    if !ok {
        tracing::error!("Database integrity check failed: {}", result);
    }
    let status = if ok { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    Ok((status, Json(json!({ "ok": ok, "integrity": { "ok": ok, "result": result } }))).into_response())
}

pub async fn create_backup(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
) -> Result<Json<Value>, ApiError> {
    let keep = state.config.db_backup_keep;
    let info = state.db.create_backup(&state.config.backup_dir(), keep).await?;
    state.audit(&session, "db_backup", Some(&info.name), Some(json!({ "keep": keep }))).await;
    Ok(Json(json!({ "ok": true, "backup": info, "keep": keep })))
}

pub async fn list_backups(
    State(state): State<ConsoleServer>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ApiError> {
    let limit = query_usize(&query, "limit").unwrap_or(50).clamp(1, 200);
    let dir = state.config.backup_dir();
    let rows = backup::list_backups(&dir, limit)?;
    Ok(Json(json!({ "ok": true, "backupDir": dir.display().to_string(), "rows": rows })))
}

pub async fn download_backup(
    State(state): State<ConsoleServer>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let name = name.trim().to_string();
    if !backup::is_safe_backup_name(&name) {
        return Err(ApiError::bad_request("Invalid backup file name"));
    }
    let full = backup::backup_file(&state.config.backup_dir(), &name)?
        .ok_or_else(|| ApiError::not_found("Backup not found"))?;
    let bytes = tokio::fs::read(&full).await.map_err(anyhow::Error::from)?;
    tracing::info!("Serving backup {} ({} bytes)", name, bytes.len());
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename=\"{}\"", name)),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        bytes,
    )
        .into_response())
}
