//! pm2 adapter. Every call shells out to `pm2` through the injected
//! `CommandRunner`; log tails read pm2's own log files.

use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

use crate::control::{Action, BackendMode, LogTail, ProcessStatus};
use crate::error::ControlError;
use crate::utils::{tail_lines, CommandOutput, CommandRunner};

/// One entry of `pm2 jlist`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Pm2Process {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub pm2_env: Pm2Env,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Pm2Env {
    #[serde(default)]
    pub status: Option<String>,
    /// Epoch millis of the last (re)start.
    #[serde(default)]
    pub pm_uptime: Option<i64>,
    #[serde(default)]
    pub restart_time: Option<u64>,
}

impl Pm2Process {
    pub fn status_str(&self) -> &str {
        self.pm2_env.status.as_deref().unwrap_or("unknown")
    }

    pub fn is_online(&self) -> bool {
        self.status_str() == "online"
    }

    pub fn to_status(&self, now_ms: i64) -> ProcessStatus {
        let uptime_sec = match self.pm2_env.pm_uptime {
            Some(started) if started > 0 => ((now_ms - started).max(0) / 1000) as u64,
            _ => 0,
        };
        ProcessStatus {
            name: self.name.clone(),
            status: self.status_str().to_string(),
            uptime_sec,
            restarts: self.pm2_env.restart_time.unwrap_or(0),
            pid: self.pid.filter(|p| *p > 0),
            mode: BackendMode::Pm2,
        }
    }
}

#[derive(Clone)]
pub struct Pm2Backend {
    runner: Arc<dyn CommandRunner>,
    log_dir: PathBuf,
}

impl Pm2Backend {
    pub fn new(runner: Arc<dyn CommandRunner>, log_dir: PathBuf) -> Self {
        Self { runner, log_dir }
    }

    async fn run(&self, args: &[&str]) -> Result<CommandOutput, ControlError> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        match self.runner.run("pm2", &args).await {
            Ok(out) if out.success => Ok(out),
            Ok(out) => {
                let msg = if out.stderr.trim().is_empty() {
                    format!("pm2 {} failed", args.join(" "))
                } else {
                    out.stderr.trim().to_string()
                };
                Err(ControlError::Pm2Failed(msg))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("pm2 binary not found");
                Err(ControlError::Pm2Unavailable)
            }
            Err(e) => Err(ControlError::Pm2Failed(e.to_string())),
        }
    }

    pub async fn list(&self) -> Result<Vec<Pm2Process>, ControlError> {
        let out = self.run(&["jlist"]).await?;
        parse_jlist(&out.stdout)
    }

    /// First candidate that pm2 currently knows about.
    pub async fn find(&self, candidates: &[String]) -> Result<String, ControlError> {
        let list = self.list().await?;
        candidates
            .iter()
            .find(|c| list.iter().any(|p| &p.name == *c))
            .cloned()
            .ok_or_else(|| {
                ControlError::Pm2ProcessNotFound(candidates.first().cloned().unwrap_or_default())
            })
    }

    pub async fn status(&self, name: &str) -> Result<ProcessStatus, ControlError> {
        let list = self.list().await?;
        let row = list
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| ControlError::Pm2ProcessNotFound(name.to_string()))?;
        Ok(row.to_status(chrono::Utc::now().timestamp_millis()))
    }

    pub async fn act(&self, name: &str, action: Action) -> Result<(), ControlError> {
        tracing::info!("pm2 {} {}", action.as_str(), name);
        self.run(&[action.as_str(), name]).await.map(|_| ())
    }

    pub async fn save(&self) -> Result<(), ControlError> {
        self.run(&["save"]).await.map(|_| ())
    }

    /// Tail `<name>-out.log` and `<name>-error.log`. Missing files read as empty.
    pub async fn logs(&self, name: &str, lines: usize) -> LogTail {
        let out = read_tail(self.log_dir.join(format!("{}-out.log", name)), lines).await;
        let err = read_tail(self.log_dir.join(format!("{}-error.log", name)), lines).await;
        LogTail {
            process_name: name.to_string(),
            lines,
            out,
            err,
            mode: BackendMode::Pm2,
        }
    }
}

pub fn parse_jlist(stdout: &str) -> Result<Vec<Pm2Process>, ControlError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).map_err(|e| {
        tracing::warn!("pm2 jlist parse failed: {}", e);
        ControlError::Pm2Parse
    })
}

async fn read_tail(path: PathBuf, lines: usize) -> String {
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => tail_lines(&content, lines),
        Err(_) => String::new(),
    }
}
