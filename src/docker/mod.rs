//! Container backend: the Docker engine API reached through a
//! [`DockerTransport`]. Used when pm2 is not installed on the host.

pub mod transport;

use byteorder::{BigEndian, ByteOrder};
use hyper::Method;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::control::{Action, BackendMode, LogTail, ProcessStatus};
use crate::error::ControlError;
use transport::{DockerResponse, DockerTransport};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    #[serde(default)]
    names: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    #[serde(default)]
    state: Option<ContainerState>,
    #[serde(default)]
    restart_count: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    started_at: Option<String>,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    restart_count: Option<u64>,
}

#[derive(Clone)]
pub struct DockerBackend {
    transport: Arc<dyn DockerTransport>,
    api_prefix: String,
}

impl DockerBackend {
    pub fn new(transport: Arc<dyn DockerTransport>, api_prefix: impl Into<String>) -> Self {
        Self {
            transport,
            api_prefix: api_prefix.into(),
        }
    }

    /// Versioned request first; an engine that answers 404 gets the same
    /// path without the prefix once.
    async fn call(&self, method: Method, path: &str) -> Result<DockerResponse, ControlError> {
        if self.api_prefix.is_empty() {
            return self.transport.request(method, path).await;
        }
        let versioned = format!("{}{}", self.api_prefix, path);
        let res = self.transport.request(method.clone(), &versioned).await?;
        if res.status == 404 {
            tracing::debug!("docker 404 on {}, retrying unversioned", versioned);
            return self.transport.request(method, path).await;
        }
        Ok(res)
    }

    async fn list_names(&self, query: &str) -> Option<Vec<Vec<String>>> {
        let res = self.call(Method::GET, &format!("/containers/json?{}", query)).await.ok()?;
        if !res.is_success() {
            return None;
        }
        let rows: Vec<ContainerSummary> = serde_json::from_slice(&res.body).ok()?;
        Some(
            rows.into_iter()
                .map(|c| c.names.iter().map(|n| n.trim_start_matches('/').to_string()).collect())
                .collect(),
        )
    }

    /// Find a container for one managed target: direct candidate names, then
    /// the compose service label, then any container whose name matches.
    pub async fn discover(&self, candidates: &[String], service: &str) -> Result<String, ControlError> {
        for name in candidates {
            let path = format!("/containers/{}/json", urlencoding::encode(name));
            match self.call(Method::GET, &path).await {
                Ok(res) if res.is_success() => return Ok(name.clone()),
                Ok(res) => tracing::debug!("docker inspect {} -> {}", name, res.status),
                Err(e) => tracing::debug!("docker inspect {} failed: {}", name, e),
            }
        }

        let filters = json!({ "label": [format!("com.docker.compose.service={}", service)] }).to_string();
        let query = format!("all=1&filters={}", urlencoding::encode(&filters));
        if let Some(rows) = self.list_names(&query).await {
            if let Some(name) = rows.into_iter().find_map(|names| names.into_iter().next()) {
                if !name.is_empty() {
                    tracing::debug!("docker: '{}' found by compose label {}", name, service);
                    return Ok(name);
                }
            }
        }

        if let Some(rows) = self.list_names("all=1").await {
            let hit = rows.into_iter().find(|names| {
                names.iter().any(|n| {
                    candidates.iter().any(|cand| {
                        n == cand || n.ends_with(&format!("_{}_1", cand)) || n.contains(cand.as_str())
                    })
                })
            });
            if let Some(name) = hit.and_then(|names| names.into_iter().next()) {
                if !name.is_empty() {
                    tracing::debug!("docker: '{}' matched by name", name);
                    return Ok(name);
                }
            }
        }

        Err(ControlError::ContainerNotFound)
    }

    pub async fn status(&self, name: &str) -> Result<ProcessStatus, ControlError> {
        let path = format!("/containers/{}/json", urlencoding::encode(name));
        let res = self.call(Method::GET, &path).await?;
        if !res.is_success() {
            return Err(http_error(&res, "docker inspect failed"));
        }
        let inspect: ContainerInspect =
            serde_json::from_slice(&res.body).map_err(|_| ControlError::DockerParse)?;
        Ok(inspect_to_status(name, inspect, chrono::Utc::now()))
    }

    pub async fn act(&self, name: &str, action: Action) -> Result<(), ControlError> {
        tracing::info!("docker {} {}", action.as_str(), name);
        let path = format!("/containers/{}/{}", urlencoding::encode(name), action.as_str());
        let res = self.call(Method::POST, &path).await?;
        // 304: already in the requested state
        if res.is_success() || res.status == 304 {
            return Ok(());
        }
        Err(http_error(&res, "docker action failed"))
    }

    pub async fn logs(&self, name: &str, lines: usize) -> Result<LogTail, ControlError> {
        let path = format!(
            "/containers/{}/logs?stdout=1&stderr=1&tail={}&timestamps=1",
            urlencoding::encode(name),
            lines
        );
        let res = self.call(Method::GET, &path).await?;
        if !res.is_success() {
            return Err(http_error(&res, "docker logs failed"));
        }
        let (out, err) = demux_logs(&res.body);
        Ok(LogTail {
            process_name: name.to_string(),
            lines,
            out: out.trim_end().to_string(),
            err: err.trim_end().to_string(),
            mode: BackendMode::Docker,
        })
    }
}

fn http_error(res: &DockerResponse, fallback: &str) -> ControlError {
    let body = res.text();
    ControlError::DockerHttp {
        status: res.status,
        body: if body.trim().is_empty() { fallback.to_string() } else { body.trim().to_string() },
    }
}

fn inspect_to_status(
    name: &str,
    inspect: ContainerInspect,
    now: chrono::DateTime<chrono::Utc>,
) -> ProcessStatus {
    let state = inspect.state.unwrap_or_default();
    let uptime_sec = state
        .started_at
        .as_deref()
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|started| (now.timestamp() - started.timestamp()).max(0) as u64)
        .filter(|_| state.status.as_deref() == Some("running"))
        .unwrap_or(0);
    ProcessStatus {
        name: name.to_string(),
        status: state.status.unwrap_or_else(|| "unknown".to_string()),
        uptime_sec,
        restarts: state.restart_count.or(inspect.restart_count).unwrap_or(0),
        pid: state.pid.filter(|p| *p > 0),
        mode: BackendMode::Docker,
    }
}

/// Split the engine's multiplexed log stream (8-byte frame header: stream id,
/// three zero bytes, big-endian payload length) into stdout and stderr.
/// Bodies without frame headers (TTY containers) are returned as stdout.
pub fn demux_logs(body: &[u8]) -> (String, String) {
    let framed = body.len() >= 8 && body[0] <= 2 && body[1..4] == [0, 0, 0];
    if !framed {
        return (String::from_utf8_lossy(body).to_string(), String::new());
    }

    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut pos = 0;
    while pos + 8 <= body.len() {
        let stream = body[pos];
        let len = BigEndian::read_u32(&body[pos + 4..pos + 8]) as usize;
        let start = pos + 8;
        let end = (start + len).min(body.len());
        match stream {
            2 => err.extend_from_slice(&body[start..end]),
            _ => out.extend_from_slice(&body[start..end]),
        }
        pos = end;
    }
    (
        String::from_utf8_lossy(&out).to_string(),
        String::from_utf8_lossy(&err).to_string(),
    )
}
