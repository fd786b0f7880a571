//! HTTP surface of the console: public health/update endpoints, owner login,
//! and the session-guarded process, admin, database and messaging routes.

mod admin;
mod data;
mod messaging;
mod process;
mod public;
mod session;

use anyhow::Result;
use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::admin::flags::FlagStore;
use crate::admin::jobs::JobStore;
use crate::admin::ops::AdminOps;
use crate::auth::rate_limit::{self, Bucket, RateLimiter};
use crate::auth::{require_session, Session, SessionGuard, SessionStore};
use crate::config::ConsoleConfig;
use crate::control::TargetResolver;
use crate::db::Database;
use crate::health::probe::SystemProbe;
use crate::health::HealthAggregator;

/// Shared handler state. Every field is cheap to clone.
#[derive(Clone)]
pub struct ConsoleServer {
    pub config: Arc<ConsoleConfig>,
    pub resolver: TargetResolver,
    pub health: Arc<HealthAggregator>,
    pub probe: Arc<dyn SystemProbe>,
    pub flags: Arc<FlagStore>,
    pub jobs: Arc<JobStore>,
    pub ops: Arc<AdminOps>,
    pub sessions: Arc<SessionStore>,
    pub db: Database,
    pub limiter: Arc<RateLimiter>,
}

impl ConsoleServer {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    pub fn router(&self) -> Router {
        let guard = SessionGuard {
            sessions: self.sessions.clone(),
            allow_query_token: self.config.allow_query_token,
        };

        let actions = Router::new()
            .route("/api/process/:target/action", post(process::action))
            .route_layer(middleware::from_fn_with_state(
                (self.limiter.clone(), Bucket::ProcessAction),
                rate_limit::limit,
            ));

        let protected = Router::new()
            .route("/api/logout", post(session::logout))
            .route("/api/ping", get(session::ping))
            .route("/api/me", get(session::me))
            .route("/api/me/bio", post(session::set_bio))
            .route("/api/info", get(session::info))
            .route("/api/process/:target/status", get(process::status))
            .route("/api/process/:target/logs", get(process::logs))
            .route("/api/process/:target/stream", get(process::stream))
            .route("/api/admin/summary", get(admin::summary))
            .route("/api/admin/alerts", get(admin::alerts))
            .route("/api/admin/flags", get(admin::get_flags).post(admin::set_flags))
            .route("/api/admin/op", post(admin::run_op))
            .route("/api/admin/jobs", get(admin::list_jobs).post(admin::create_job))
            .route("/api/admin/jobs/:id", axum::routing::delete(admin::delete_job))
            .route("/api/admin/audit", get(admin::audit))
            .route("/api/admin/users", get(admin::users))
            .route("/api/admin/users/:chat_id/role", post(admin::set_role))
            .route("/api/db/tables", get(data::tables))
            .route("/api/db/maintenance", get(data::maintenance))
            .route("/api/db/maintenance/check", get(data::integrity))
            .route("/api/db/backup", post(data::create_backup))
            .route("/api/db/backups", get(data::list_backups))
            .route("/api/db/backups/:name", get(data::download_backup))
            .route("/api/db/:table", get(data::rows))
            .route("/api/db/:table/row", post(data::insert_row))
            .route(
                "/api/db/:table/row/:rowid",
                get(data::get_row).patch(data::update_row).delete(data::delete_row),
            )
            .route("/api/ban", post(messaging::ban))
            .route("/api/unban", post(messaging::unban))
            .route("/api/bans", get(messaging::bans))
            .route("/api/message", post(messaging::message))
            .route("/api/broadcast", post(messaging::broadcast))
            .route("/api/outbox", get(messaging::outbox))
            .merge(actions)
            .route_layer(middleware::from_fn_with_state(guard, require_session))
            .route_layer(middleware::from_fn_with_state(
                (self.limiter.clone(), Bucket::Api),
                rate_limit::limit,
            ));

        let login = Router::new()
            .route("/api/login", post(session::login))
            .route_layer(middleware::from_fn_with_state(
                (self.limiter.clone(), Bucket::Login),
                rate_limit::limit,
            ));

        Router::new()
            .route("/api/healthz", get(public::healthz))
            .route("/metrics", get(public::metrics))
            .route("/api/app-meta", get(public::app_meta))
            .route("/downloads/latest.apk", get(public::download_apk))
            .route("/media/avatar/*path", get(public::avatar))
            .merge(login)
            .merge(protected)
            .fallback(static_or_not_found)
            .layer(middleware::from_fn(security_headers))
            .layer(TraceLayer::new_for_http())
            .with_state(self.clone())
    }

    pub async fn start(self) -> Result<()> {
        let addr = self.listen_addr();
        tracing::info!("Owner console HTTP server starting on {}", addr);
        let router = self.router();

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Listening on http://{}", addr);

        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async {
                tokio::signal::ctrl_c().await.ok();
                tracing::info!("Shutdown signal received");
            })
            .await?;
        Ok(())
    }

    /// Operator actions go to `owner_audit_log`; a failed write never fails
    /// the request.
    pub(crate) async fn audit(&self, session: &Session, command: &str, target: Option<&str>, payload: Option<Value>) {
        if let Err(e) = self.db.add_audit(&session.chat_id, command, target, payload.as_ref()).await {
            tracing::warn!("Audit write for {} failed: {}", command, e);
        }
    }
}

/// Request bodies are read leniently: empty or malformed JSON is `Null`.
pub(crate) fn body_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).unwrap_or(Value::Null)
}

/// String field of a JSON body, trimmed; empty counts as missing.
pub(crate) fn body_str<'a>(body: &'a Value, key: &str) -> Option<&'a str> {
    body.get(key).and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

async fn security_headers(req: Request, next: Next) -> Response {
    let mut res = next.run(req).await;
    let headers = res.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("application/json"))
        .unwrap_or(false);
    if is_json {
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(
            "permissions-policy",
            HeaderValue::from_static("camera=(), microphone=(), geolocation=()"),
        );
    }
    res
}

/// Unknown `/api/` paths get a JSON 404; everything else is the web UI.
async fn static_or_not_found(State(state): State<ConsoleServer>, req: Request<Body>) -> Response {
    let path = req.uri().path().to_string();
    if path.starts_with("/api/") {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({
                "ok": false,
                "error": "API route not found",
                "method": req.method().as_str(),
                "path": path,
            })),
        )
            .into_response();
    }
    let web = ServeDir::new(state.config.web_dir()).append_index_html_on_directories(true);
    match web.oneshot(req).await {
        Ok(res) => res.into_response(),
        Err(e) => match e {},
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::testing::ScriptedRunner;
    use axum::http::Request;

    #[tokio::test]
    async fn test_unknown_api_route_is_json_404() {
        let h = harness(ScriptedRunner::missing_pm2(), ConsoleConfig::default()).await;
        let (status, body) = h.call(Request::get("/api/nope").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "API route not found");
        assert_eq!(body["path"], "/api/nope");
    }

    #[tokio::test]
    async fn test_security_headers_on_json() {
        let h = harness(ScriptedRunner::missing_pm2(), ConsoleConfig::default()).await;
        let res = h.server.router().oneshot(h.authed("GET", "/api/ping", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(res.headers()["x-content-type-options"], "nosniff");
        assert_eq!(res.headers()[header::CACHE_CONTROL], "no-store");
    }

    #[tokio::test]
    async fn test_api_bucket_limits_authenticated_routes() {
        let h = harness(ScriptedRunner::missing_pm2(), ConsoleConfig::default()).await;
        for _ in 0..Bucket::Api.max() {
            h.server.limiter.check(Bucket::Api, "unknown").unwrap();
        }
        let res = h.server.router().oneshot(h.authed("GET", "/api/ping", None)).await.unwrap();
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(res.headers().contains_key(header::RETRY_AFTER));
    }
}
