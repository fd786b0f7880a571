//! Drives the router through its public constructors with stub backends.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use owner_console::admin::flags::{AdminFlags, FlagStore};
use owner_console::admin::jobs::JobStore;
use owner_console::admin::ops::{AdminOps, OpContext};
use owner_console::api::ConsoleServer;
use owner_console::auth::rate_limit::RateLimiter;
use owner_console::auth::{now_ms, SessionStore};
use owner_console::config::ConsoleConfig;
use owner_console::control::TargetResolver;
use owner_console::db::Database;
use owner_console::docker::transport::{DockerResponse, DockerTransport};
use owner_console::docker::DockerBackend;
use owner_console::error::ControlError;
use owner_console::health::probe::{SystemProbe, SystemReadings};
use owner_console::health::HealthAggregator;
use owner_console::persist::MemoryJsonPort;
use owner_console::supervisor::Pm2Backend;
use owner_console::utils::{CommandOutput, CommandRunner};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower::ServiceExt;

struct NoPm2;

#[async_trait]
impl CommandRunner for NoPm2 {
    async fn run(&self, program: &str, _args: &[String]) -> std::io::Result<CommandOutput> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, format!("{}: not found", program)))
    }

    fn spawn_detached(&self, _program: &str, _args: &[String]) -> std::io::Result<()> {
        Ok(())
    }
}

struct NoDocker;

#[async_trait]
impl DockerTransport for NoDocker {
    async fn request(&self, _method: Method, _path: &str) -> Result<DockerResponse, ControlError> {
        Ok(DockerResponse { status: 404, body: b"{\"message\":\"No such container\"}".to_vec() })
    }
}

struct Probe {
    free_disk: u64,
}

#[async_trait]
impl SystemProbe for Probe {
    async fn readings(&self) -> SystemReadings {
        SystemReadings { host_name: "test-host".into(), total_memory: 100, available_memory: 60, ..Default::default() }
    }

    async fn disk_available(&self, _path: &Path) -> anyhow::Result<u64> {
        Ok(self.free_disk)
    }
}

async fn console(free_disk: u64) -> (ConsoleServer, String) {
    let config = ConsoleConfig::default();
    let runner: Arc<dyn CommandRunner> = Arc::new(NoPm2);
    let resolver = TargetResolver::new(
        Pm2Backend::new(runner.clone(), PathBuf::from("/nonexistent")),
        DockerBackend::new(Arc::new(NoDocker), "/v1.44"),
        config.units.clone(),
        runner.clone(),
    );
    let db = Database::in_memory().unwrap();
    let probe: Arc<dyn SystemProbe> = Arc::new(Probe { free_disk });
    let health = Arc::new(HealthAggregator::new(Arc::new(db.clone()), probe.clone(), resolver.clone(), PathBuf::from("/")));
    let flags = Arc::new(FlagStore::new(Arc::new(MemoryJsonPort::new()), AdminFlags::defaults(false)));
    let ops = Arc::new(AdminOps::new(
        runner,
        flags.clone(),
        OpContext {
            project_root: PathBuf::from("/srv/bot"),
            android_dir: PathBuf::from("/srv/bot/owner-app/android"),
            bot_process: "bot".into(),
            app_process: "app".into(),
        },
    ));
    let sessions = Arc::new(SessionStore::load(Arc::new(MemoryJsonPort::new()), 12, now_ms()).await);
    let token = sessions.issue("4900000001@s.whatsapp.net", "Boss", now_ms()).await.token;
    let server = ConsoleServer {
        config: Arc::new(config),
        resolver,
        health,
        probe,
        flags,
        jobs: Arc::new(JobStore::new(Arc::new(MemoryJsonPort::new()))),
        ops,
        sessions,
        db,
        limiter: Arc::new(RateLimiter::new()),
    };
    (server, token)
}

async fn send(server: &ConsoleServer, req: Request<Body>) -> (StatusCode, Value) {
    let res = server.router().oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(t) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", t));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_healthz_follows_disk_space() {
    let (server, _) = console(u64::MAX).await;
    let (status, body) = send(&server, get("/api/healthz", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["checks"]["db"]["ok"], true);

    let (server, _) = console(1024).await;
    let (status, body) = send(&server, get("/api/healthz", None)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["checks"]["disk"]["ok"], false);
}

#[tokio::test]
async fn test_protected_routes_need_a_session() {
    let (server, token) = console(u64::MAX).await;
    let (status, _) = send(&server, get("/api/info", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&server, get("/api/info", Some("forged"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, body) = send(&server, get("/api/info", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server"]["host"], "test-host");
}

#[tokio::test]
async fn test_bad_target_and_unknown_api_path() {
    let (server, token) = console(u64::MAX).await;
    let (status, body) = send(&server, get("/api/process/database/status", Some(&token))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["ok"], false);

    let (status, body) = send(&server, get("/api/does-not-exist", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["ok"], false);
}

#[tokio::test]
async fn test_login_refused_without_owners() {
    let (server, _) = console(u64::MAX).await;
    let req = Request::builder()
        .method("POST")
        .uri("/api/login")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"username":"boss","password":"secret"}"#))
        .unwrap();
    let (status, body) = send(&server, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid credentials");
}
