use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Login,
    Api,
    ProcessAction,
}

impl Bucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Api => "api",
            Self::ProcessAction => "processAction",
        }
    }

    pub fn window(&self) -> Duration {
        match self {
            Self::Login => Duration::from_secs(15 * 60),
            Self::Api | Self::ProcessAction => Duration::from_secs(60),
        }
    }

    pub fn max(&self) -> u32 {
        match self {
            Self::Login => 12,
            Self::Api => 180,
            Self::ProcessAction => 30,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
}

const SWEEP_EVERY: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Windows {
    by_key: HashMap<String, Window>,
    last_sweep: Option<Instant>,
}

impl Windows {
    /// Expired windows are dropped at most once per `SWEEP_EVERY`.
    fn sweep(&mut self, now: Instant) {
        if self.last_sweep.is_some_and(|at| now.saturating_duration_since(at) < SWEEP_EVERY) {
            return;
        }
        self.by_key.retain(|_, w| w.reset_at >= now);
        self.last_sweep = Some(now);
    }
}

/// Fixed-window counters keyed by `bucket:client`.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Err(retry_after_secs)` once the window's budget is spent.
    pub fn check_at(&self, bucket: Bucket, client: &str, now: Instant) -> Result<(), u64> {
        let key = format!("{}:{}", bucket.as_str(), client);
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        windows.sweep(now);
        let window = windows.by_key.entry(key).or_insert(Window { count: 0, reset_at: now + bucket.window() });
        if now > window.reset_at {
            window.count = 0;
            window.reset_at = now + bucket.window();
        }
        window.count += 1;
        if window.count > bucket.max() {
            let remaining = window.reset_at.saturating_duration_since(now);
            let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
            return Err(secs.max(1));
        }
        Ok(())
    }

    pub fn check(&self, bucket: Bucket, client: &str) -> Result<(), u64> {
        self.check_at(bucket, client, Instant::now())
    }

    /// Number of live `bucket:client` windows.
    pub fn tracked(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).by_key.len()
    }
}

/// First `X-Forwarded-For` hop, else the peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(first) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return first.to_string();
    }
    peer.map(|p| p.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

pub fn too_many_requests(retry_after: u64) -> Response {
    let mut res = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "ok": false, "error": "Too many requests. Please wait a moment." })),
    )
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
        res.headers_mut().insert(header::RETRY_AFTER, value);
    }
    res
}

/// Middleware over `(limiter, bucket)` state.
pub async fn limit(
    State((limiter, bucket)): State<(Arc<RateLimiter>, Bucket)>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let peer = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let client = client_ip(req.headers(), peer);
    match limiter.check(bucket, &client) {
        Ok(()) => next.run(req).await,
        Err(retry_after) => {
            tracing::warn!("Rate limit {} hit by {}", bucket.as_str(), client);
            too_many_requests(retry_after)
        }
    }
}
