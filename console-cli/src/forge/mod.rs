//! Forge: operator workflows run step by step against the console API.
//!
//! A run is strictly sequential. Before every step the run's token is checked
//! against the shared counter; `stop()` bumps the counter, so the next check
//! ends the run. A step already in flight is never interrupted.

pub mod presets;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

pub const DEFAULT_DELAY_MS: u64 = 1_000;
pub const DEFAULT_RESTART_WAIT_MS: u64 = 3_500;

/// Transport failures that look like the server went away mid-request.
const DISCONNECT_HINTS: [&str; 8] = [
    "network error",
    "networkerror",
    "failed to fetch",
    "load failed",
    "network request failed",
    "connection closed",
    "connection reset",
    "incomplete message",
];

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ForgeError {
    #[error("Workflow has no steps")]
    EmptyWorkflow,

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Workflow stopped")]
    Cancelled,

    #[error("Only relative URLs are allowed (starting with /)")]
    RelativeUrlOnly,

    #[error("{method} {url} -> HTTP {status} (expected {expected})")]
    UnexpectedStatus { method: String, url: String, status: u16, expected: u16 },

    #[error("Process action failed")]
    ProcessActionFailed,

    #[error("Admin operation failed")]
    AdminOpFailed,

    #[error("Unknown step type: {0}")]
    UnknownStep(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("{message}")]
    Api { status: u16, message: String },
}

impl ForgeError {
    /// True for errors shaped like a dropped connection.
    pub fn is_disconnect(&self) -> bool {
        if matches!(self, Self::Network(_)) {
            return true;
        }
        let msg = self.to_string().to_lowercase();
        DISCONNECT_HINTS.iter().any(|hint| msg.contains(hint))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Value {
        serde_json::from_str(&self.body).unwrap_or(Value::Null)
    }
}

/// What the runner needs from the console. The implementation attaches the
/// bearer credential.
#[async_trait]
pub trait ForgeApi: Send + Sync {
    /// `Err` only for transport failures; every HTTP status is a reply.
    async fn send(
        &self,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: Option<String>,
    ) -> Result<HttpReply, ForgeError>;

    /// JSON POST; a non-2xx reply becomes an error carrying the server's message.
    async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ForgeError> {
        let headers = vec![("Content-Type".to_string(), "application/json".to_string())];
        let reply = self.send("POST", path, &headers, Some(body.to_string())).await?;
        let value = reply.json();
        if !reply.is_success() {
            let message = value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {}", reply.status));
            return Err(ForgeError::Api { status: reply.status, message });
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RequestStep {
    pub method: Option<String>,
    pub url: String,
    pub expect_status: Option<u16>,
    pub headers: Map<String, Value>,
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProcessActionStep {
    pub target: String,
    pub action: String,
    pub restart_wait_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AdminOpStep {
    pub op: String,
    pub args: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DelayStep {
    pub ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Request(RequestStep),
    ProcessAction(ProcessActionStep),
    AdminOp(AdminOpStep),
    Delay(DelayStep),
    /// Kept so the run can fail on it instead of rejecting the whole file.
    Unknown(String),
}

impl StepKind {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Request(_) => "request",
            Self::ProcessAction(_) => "process_action",
            Self::AdminOp(_) => "admin_op",
            Self::Delay(_) => "delay",
            Self::Unknown(t) if t.is_empty() => "unknown",
            Self::Unknown(t) => t,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub label: String,
    pub kind: StepKind,
}

impl Step {
    /// `index` is zero-based; unlabeled steps become `Step <index+1>`.
    pub fn from_value(index: usize, raw: &Value) -> Result<Self, ForgeError> {
        let label = raw
            .get("label")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Step {}", index + 1));
        let ty = raw.get("type").and_then(Value::as_str).unwrap_or("").trim().to_lowercase();
        let invalid = |e: serde_json::Error| ForgeError::InvalidWorkflow(format!("{}: {}", label, e));

        let kind = match ty.as_str() {
            "request" => StepKind::Request(serde_json::from_value(raw.clone()).map_err(invalid)?),
            "process_action" => StepKind::ProcessAction(serde_json::from_value(raw.clone()).map_err(invalid)?),
            "admin_op" => StepKind::AdminOp(serde_json::from_value(raw.clone()).map_err(invalid)?),
            "delay" => StepKind::Delay(serde_json::from_value(raw.clone()).map_err(invalid)?),
            _ => StepKind::Unknown(ty),
        };
        Ok(Self { label, kind })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn from_value(raw: &Value) -> Result<Self, ForgeError> {
        if !raw.is_object() {
            return Err(ForgeError::InvalidWorkflow("expected a JSON object".to_string()));
        }
        let name = raw.get("name").and_then(Value::as_str).unwrap_or("workflow").to_string();
        let steps = raw
            .get("steps")
            .and_then(Value::as_array)
            .map(|list| list.iter().enumerate().map(|(i, s)| Step::from_value(i, s)).collect::<Result<Vec<_>, _>>())
            .transpose()?
            .unwrap_or_default();
        Ok(Self { name, steps })
    }

    pub fn from_json(raw: &str) -> Result<Self, ForgeError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ForgeError::InvalidWorkflow(e.to_string()))?;
        Self::from_value(&value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimelineEntry {
    pub label: String,
    pub detail: String,
    pub status: StepStatus,
}

/// Generation counter shared by every run of one runner.
#[derive(Debug, Clone, Default)]
pub struct RunCounter(Arc<AtomicU64>);

impl RunCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&self) -> RunToken {
        let id = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        RunToken { id, counter: self.clone() }
    }

    pub fn stop(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub struct RunToken {
    id: u64,
    counter: RunCounter,
}

impl RunToken {
    pub fn is_current(&self) -> bool {
        self.counter.0.load(Ordering::SeqCst) == self.id
    }
}

pub struct ForgeRunner {
    api: Arc<dyn ForgeApi>,
    counter: RunCounter,
    timeline: watch::Sender<Vec<TimelineEntry>>,
}

impl ForgeRunner {
    pub fn new(api: Arc<dyn ForgeApi>) -> Self {
        Self::with_counter(api, RunCounter::new())
    }

    pub fn with_counter(api: Arc<dyn ForgeApi>, counter: RunCounter) -> Self {
        let (timeline, _) = watch::channel(Vec::new());
        Self { api, counter, timeline }
    }

    pub fn counter(&self) -> RunCounter {
        self.counter.clone()
    }

    /// Ends the current run before its next step.
    pub fn stop(&self) {
        self.counter.stop();
        tracing::warn!("Workflow stop requested");
    }

    /// Receives the full timeline after every state change.
    pub fn subscribe(&self) -> watch::Receiver<Vec<TimelineEntry>> {
        self.timeline.subscribe()
    }

    pub fn timeline(&self) -> Vec<TimelineEntry> {
        self.timeline.borrow().clone()
    }

    fn mark(&self, index: usize, status: StepStatus, detail: Option<String>) {
        self.timeline.send_modify(|entries| {
            if let Some(entry) = entries.get_mut(index) {
                entry.status = status;
                if let Some(d) = detail {
                    entry.detail = d;
                }
            }
        });
    }

    /// Runs every step in order and stops at the first failure.
    pub async fn run(&self, workflow: &Workflow) -> Result<(), ForgeError> {
        let token = self.counter.start();
        if workflow.steps.is_empty() {
            return Err(ForgeError::EmptyWorkflow);
        }
        self.timeline.send_replace(
            workflow
                .steps
                .iter()
                .map(|s| TimelineEntry {
                    label: s.label.clone(),
                    detail: s.kind.type_name().to_string(),
                    status: StepStatus::Pending,
                })
                .collect(),
        );
        tracing::info!("Workflow '{}' started ({} steps)", workflow.name, workflow.steps.len());

        for (i, step) in workflow.steps.iter().enumerate() {
            if !token.is_current() {
                tracing::warn!("Workflow '{}' stopped before '{}'", workflow.name, step.label);
                return Err(ForgeError::Cancelled);
            }
            self.mark(i, StepStatus::Running, None);
            match self.execute(step).await {
                Ok(()) => self.mark(i, StepStatus::Done, Some("OK".to_string())),
                Err(e) => {
                    self.mark(i, StepStatus::Failed, Some(e.to_string()));
                    tracing::error!("{}: failed -> {}", step.label, e);
                    return Err(e);
                }
            }
        }
        tracing::info!("Workflow '{}' completed", workflow.name);
        Ok(())
    }

    async fn execute(&self, step: &Step) -> Result<(), ForgeError> {
        let label = &step.label;
        match &step.kind {
            StepKind::Delay(d) => {
                let ms = d.ms.filter(|ms| *ms > 0).unwrap_or(DEFAULT_DELAY_MS);
                tracing::info!("{}: waiting {}ms", label, ms);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(())
            }
            StepKind::ProcessAction(p) => {
                let target = p.target.trim().to_lowercase();
                let action = p.action.trim().to_lowercase();
                tracing::info!("{}: {} {}", label, target, action);
                let path = format!("/api/process/{}/action", urlencoding::encode(&target));
                let outcome = match self.api.post_json(&path, &json!({ "action": action })).await {
                    Ok(v) if v.get("ok").and_then(Value::as_bool) == Some(true) => Ok(()),
                    Ok(_) => Err(ForgeError::ProcessActionFailed),
                    Err(e) => Err(e),
                };
                match outcome {
                    // restarting the app drops the connection that asked for it
                    Err(e) if target == "app" && action == "restart" && e.is_disconnect() => {
                        let wait = p.restart_wait_ms.filter(|ms| *ms > 0).unwrap_or(DEFAULT_RESTART_WAIT_MS);
                        tracing::warn!("{}: connection lost during app restart, waiting {}ms", label, wait);
                        tokio::time::sleep(Duration::from_millis(wait)).await;
                        Ok(())
                    }
                    other => other,
                }
            }
            StepKind::AdminOp(a) => {
                let op = a.op.trim();
                tracing::info!("{}: admin op {}", label, op);
                let args = a.args.clone().unwrap_or_else(|| json!({}));
                let reply = self.api.post_json("/api/admin/op", &json!({ "op": op, "args": args })).await?;
                if reply.get("ok").and_then(Value::as_bool) != Some(true) {
                    return Err(ForgeError::AdminOpFailed);
                }
                Ok(())
            }
            StepKind::Request(r) => {
                let method = r
                    .method
                    .as_deref()
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .unwrap_or("GET")
                    .to_uppercase();
                let url = r.url.trim();
                if !url.starts_with('/') {
                    return Err(ForgeError::RelativeUrlOnly);
                }
                let mut headers: Vec<(String, String)> = r
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string())))
                    .collect();
                let body = r.body.as_ref().map(|b| b.as_str().map(str::to_string).unwrap_or_else(|| b.to_string()));
                if body.is_some() && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("content-type")) {
                    headers.push(("Content-Type".to_string(), "application/json".to_string()));
                }

                let started = Instant::now();
                let reply = self.api.send(&method, url, &headers, body).await?;
                let took = started.elapsed().as_millis();
                if let Some(expected) = r.expect_status.filter(|s| *s > 0) {
                    if reply.status != expected {
                        return Err(ForgeError::UnexpectedStatus {
                            method,
                            url: url.to_string(),
                            status: reply.status,
                            expected,
                        });
                    }
                }
                tracing::info!("{}: HTTP {} in {}ms ({} bytes)", label, reply.status, took, reply.body.len());
                Ok(())
            }
            StepKind::Unknown(ty) => Err(ForgeError::UnknownStep(ty.clone())),
        }
    }
}
