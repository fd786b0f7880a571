use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Extension, Json,
};
use futures_util::{Stream, StreamExt};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_stream::wrappers::IntervalStream;

use super::{body_json, body_str, ConsoleServer};
use crate::admin::AdminError;
use crate::auth::Session;
use crate::control::{is_unmanaged, Action, BackendMode, FanOut, LogTail, ManagedTarget, Target};
use crate::error::ControlError;
use crate::utils::clamp_lines;

const STREAM_INTERVAL: Duration = Duration::from_millis(1500);

fn fan_out_map<T, F>(results: &FanOut<T>, ok: F) -> Map<String, Value>
where
    F: Fn(ManagedTarget, &T) -> Value,
{
    results
        .iter()
        .map(|(t, res)| {
            let v = match res {
                Ok(item) => ok(*t, item),
                Err(e) => e.to_json(),
            };
            (t.as_str().to_string(), v)
        })
        .collect()
}

fn tail_json(target: &str, tail: &LogTail) -> Value {
    json!({
        "ok": true,
        "target": target,
        "processName": tail.process_name,
        "mode": tail.mode,
        "lines": tail.lines,
        "out": tail.out,
        "err": tail.err,
    })
}

impl ConsoleServer {
    pub(crate) async fn server_reboot_allowed(&self) -> bool {
        self.config.allow_server_reboot && self.flags.get().await.reboot_enabled
    }

    /// One log payload as served by `/logs` and pushed by `/stream`.
    async fn log_payload(&self, target: Target, lines: usize) -> Result<Value, ControlError> {
        match target {
            Target::All => {
                let all = self.resolver.logs_all(lines).await;
                let logs = fan_out_map(&all, |t, tail| tail_json(t.as_str(), tail));
                Ok(json!({ "ok": true, "target": "all", "lines": lines, "logs": logs }))
            }
            Target::Server => {
                let tail = self.resolver.server_logs(lines).await?;
                Ok(tail_json("server", &tail))
            }
            Target::Bot | Target::App => {
                let managed = target.managed().ok_or_else(|| ControlError::BadTarget(target.as_str().to_string()))?;
                let tail = self.resolver.logs(managed, lines).await?;
                Ok(tail_json(target.as_str(), &tail))
            }
        }
    }
}

pub async fn status(State(state): State<ConsoleServer>, Path(raw): Path<String>) -> Result<Json<Value>, ControlError> {
    let target: Target = raw.parse()?;
    let body = match target {
        Target::Server => {
            let readings = state.probe.readings().await;
            json!({
                "ok": true,
                "target": "server",
                "processName": "server",
                "status": {
                    "status": "online",
                    "host": readings.host_name,
                    "uptimeSec": readings.host_uptime_sec,
                    "platform": readings.platform,
                    "rebootAllowed": state.server_reboot_allowed().await,
                },
            })
        }
        Target::All => {
            let all = state.resolver.status_all().await;
            let statuses = fan_out_map(&all, |_, s| json!(s));
            json!({ "ok": true, "target": "all", "statuses": statuses })
        }
        Target::Bot | Target::App => {
            let managed = target.managed().ok_or_else(|| ControlError::BadTarget(raw.clone()))?;
            let s = state.resolver.status(managed).await?;
            json!({ "ok": true, "target": target.as_str(), "processName": s.name, "status": s })
        }
    };
    Ok(Json(body))
}

pub async fn logs(
    State(state): State<ConsoleServer>,
    Path(raw): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Value>, ControlError> {
    let target: Target = raw.parse()?;
    let lines = clamp_lines(query.get("lines").map(String::as_str), 80, 10, 500);
    Ok(Json(state.log_payload(target, lines).await?))
}

/// Server-sent `logs` events every 1.5 s until the client goes away.
pub async fn stream(
    State(state): State<ConsoleServer>,
    Path(raw): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, Response> {
    let target: Target = raw.parse().map_err(|e: ControlError| e.into_response())?;
    if !state.flags.get().await.log_stream_enabled {
        return Err(AdminError::FeatureDisabled("Log streaming is disabled").into_response());
    }
    let lines = clamp_lines(query.get("lines").map(String::as_str), 80, 10, 300);
    tracing::debug!("Log stream opened for {} ({} lines)", target.as_str(), lines);

    let ticks = IntervalStream::new(tokio::time::interval(STREAM_INTERVAL));
    let events = ticks.then(move |_| {
        let state = state.clone();
        async move {
            let payload = match state.log_payload(target, lines).await {
                Ok(v) => v,
                Err(e) => e.to_json(),
            };
            Event::default().event("logs").json_data(payload)
        }
    });
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

pub async fn action(
    State(state): State<ConsoleServer>,
    Extension(session): Extension<Session>,
    Path(raw): Path<String>,
    body: Bytes,
) -> Result<Response, ControlError> {
    let target: Target = raw.parse()?;
    let body = body_json(&body);
    let action: Action = body_str(&body, "action").unwrap_or("").parse()?;

    match target {
        Target::Server => {
            let allowed = state.server_reboot_allowed().await;
            let cmd = state.config.server_reboot_cmd.clone();
            state.resolver.reboot_server(action, allowed, &cmd).await?;
            state
                .audit(&session, "server_restart", Some("server"), Some(json!({ "action": action, "cmd": cmd })))
                .await;
            Ok(Json(json!({
                "ok": true,
                "target": "server",
                "processName": "server",
                "action": action,
                "scheduled": true,
            }))
            .into_response())
        }
        Target::All => {
            let all = state.resolver.act_all(action).await;
            let results = fan_out_map(&all, |_, o| json!({ "ok": true, "processName": o.process_name, "mode": o.mode, "status": o.status }));
            state
                .audit(&session, "process_action_all", Some("all"), Some(json!({ "action": action })))
                .await;
            if all.iter().all(|(_, r)| matches!(r, Err(e) if is_unmanaged(e))) {
                return Ok((
                    StatusCode::CONFLICT,
                    Json(json!({
                        "ok": false,
                        "target": "all",
                        "action": action,
                        "error": "No managed bot or app process found (pm2 unavailable, no container)",
                        "results": results,
                    })),
                )
                    .into_response());
            }
            Ok(Json(json!({ "ok": true, "target": "all", "action": action, "results": results })).into_response())
        }
        Target::Bot | Target::App => {
            let managed: ManagedTarget = target.managed().ok_or_else(|| ControlError::BadTarget(raw.clone()))?;
            let outcome = state.resolver.act(managed, action).await?;
            let command = match outcome.mode {
                BackendMode::Pm2 => "process_action",
                BackendMode::Docker => "process_action_docker",
            };
            state
                .audit(
                    &session,
                    command,
                    Some(managed.as_str()),
                    Some(json!({ "action": action, "processName": outcome.process_name })),
                )
                .await;
            tracing::info!("{} {} via {:?} by {}", action.as_str(), outcome.process_name, outcome.mode, session.username);
            Ok(Json(json!({
                "ok": true,
                "target": managed.as_str(),
                "processName": outcome.process_name,
                "action": action,
                "mode": outcome.mode,
                "status": outcome.status,
            }))
            .into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::harness;
    use crate::config::ConsoleConfig;
    use crate::testing::ScriptedRunner;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const JLIST: &str = r#"[
        {"name":"cipherphantom-bot","pid":11,"pm2_env":{"status":"online","pm_uptime":0,"restart_time":2}},
        {"name":"cipherphantom-owner-remote","pid":12,"pm2_env":{"status":"stopped","restart_time":0}}
    ]"#;

    #[tokio::test]
    async fn test_bad_target_is_400() {
        let h = harness(ScriptedRunner::with_jlist(JLIST), ConsoleConfig::default()).await;
        let (status, body) = h.call(h.authed("GET", "/api/process/db/status", None)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_TARGET");
    }

    #[tokio::test]
    async fn test_status_through_pm2_and_all() {
        let h = harness(ScriptedRunner::with_jlist(JLIST), ConsoleConfig::default()).await;
        let (status, body) = h.call(h.authed("GET", "/api/process/app/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processName"], "cipherphantom-owner-remote");
        assert_eq!(body["status"]["status"], "stopped");

        let (_, body) = h.call(h.authed("GET", "/api/process/all/status", None)).await;
        assert_eq!(body["statuses"]["bot"]["status"], "online");
        assert_eq!(body["statuses"]["bot"]["restarts"], 2);
    }

    #[tokio::test]
    async fn test_server_status_reports_reboot_gate() {
        let h = harness(ScriptedRunner::missing_pm2(), ConsoleConfig::default()).await;
        let (status, body) = h.call(h.authed("GET", "/api/process/server/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"]["status"], "online");
        assert_eq!(body["status"]["rebootAllowed"], false);
    }

    #[tokio::test]
    async fn test_logs_clamped_and_unmanaged_is_503() {
        let h = harness(ScriptedRunner::missing_pm2(), ConsoleConfig::default()).await;
        h.docker.respond("GET", "/v1.44/containers/cipherphantom-bot/json", 200, r#"{"Name":"/cipherphantom-bot","State":{"Status":"running"}}"#);
        h.docker.respond_prefix("GET", "/v1.44/containers/cipherphantom-bot/logs", 200, "");

        let (status, body) = h.call(h.authed("GET", "/api/process/bot/logs?lines=9999", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["lines"], 500);
        assert_eq!(body["mode"], "docker");

        let (status, body) = h.call(h.authed("GET", "/api/process/all/logs", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logs"]["bot"]["ok"], true);
        assert_eq!(body["logs"]["app"]["ok"], false);
    }

    #[tokio::test]
    async fn test_all_action_unmanaged_is_409() {
        let h = harness(ScriptedRunner::missing_pm2(), ConsoleConfig::default()).await;
        let req = h.authed("POST", "/api/process/all/action", Some(json!({ "action": "restart" })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);
        assert_eq!(body["results"]["bot"]["code"], "DOCKER_CONTAINER_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_single_action_is_audited() {
        let h = harness(ScriptedRunner::with_jlist(JLIST), ConsoleConfig::default()).await;
        let req = h.authed("POST", "/api/process/bot/action", Some(json!({ "action": "RESTART" })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["processName"], "cipherphantom-bot");
        assert!(h.runner.calls().iter().any(|c| c == "pm2 restart cipherphantom-bot"));

        let audit = h.server.db.list_audit(10).await.unwrap();
        assert_eq!(audit[0].command, "process_action");
        assert_eq!(audit[0].target_id.as_deref(), Some("bot"));

        let req = h.authed("POST", "/api/process/bot/action", Some(json!({ "action": "kill" })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "BAD_ACTION");
    }

    #[tokio::test]
    async fn test_server_reboot_forbidden_then_scheduled() {
        let h = harness(ScriptedRunner::with_jlist(JLIST), ConsoleConfig::default()).await;
        let req = h.authed("POST", "/api/process/server/action", Some(json!({ "action": "restart" })));
        let (status, _) = h.call(req).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let config = ConsoleConfig { allow_server_reboot: true, ..Default::default() };
        let h = harness(ScriptedRunner::with_jlist(JLIST), config).await;
        let req = h.authed("POST", "/api/process/server/action", Some(json!({ "action": "stop" })));
        assert_eq!(h.call(req).await.0, StatusCode::BAD_REQUEST);

        let req = h.authed("POST", "/api/process/server/action", Some(json!({ "action": "restart" })));
        let (status, body) = h.call(req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["scheduled"], true);
        assert!(h.runner.calls().iter().any(|c| c == "pm2 save"));
        assert_eq!(h.runner.detached().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_sends_log_events() {
        let h = harness(ScriptedRunner::with_jlist(JLIST), ConsoleConfig::default()).await;
        let res = h.server.router().oneshot(h.authed("GET", "/api/process/bot/stream?lines=5", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let mut body = res.into_body();
        let frame = body.frame().await.unwrap().unwrap();
        let text = String::from_utf8_lossy(frame.data_ref().unwrap()).into_owned();
        assert!(text.starts_with("event: logs\n"));
        assert!(text.contains("\"lines\":10"));

        h.server.flags.patch(&json!({ "logStreamEnabled": false })).await.unwrap();
        let (status, body) = h.call(h.authed("GET", "/api/process/bot/stream", None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.get("code").is_none());
    }
}
