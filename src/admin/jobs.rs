use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::ops::AdminOps;
use super::AdminError;
use crate::persist::{load_or_warn, JsonPort};
use crate::utils::tail_chars;

/// Newest jobs kept in the store.
pub const MAX_JOBS: usize = 500;
/// Output kept per stream on a finished job.
pub const JOB_OUTPUT_KEEP: usize = 2_000;
pub const TICK_INTERVAL_SECS: u64 = 5;
const DEFAULT_DELAY_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub ok: bool,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminJob {
    pub id: String,
    pub op: String,
    pub run_at: String,
    pub status: JobStatus,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl AdminJob {
    fn due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued
            && DateTime::parse_from_rfc3339(&self.run_at)
                .map(|at| at.with_timezone(&Utc) <= now)
                .unwrap_or(false)
    }
}

fn iso(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The job list lives in one JSON document, newest first.
pub struct JobStore {
    port: Arc<dyn JsonPort>,
    lock: Mutex<()>,
}

impl JobStore {
    pub fn new(port: Arc<dyn JsonPort>) -> Self {
        Self { port, lock: Mutex::new(()) }
    }

    async fn read(&self) -> Vec<AdminJob> {
        let Some(raw) = load_or_warn(self.port.as_ref(), "admin jobs").await else {
            return Vec::new();
        };
        let items = match raw {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("jobs") {
                Some(Value::Array(items)) => items,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        items
            .into_iter()
            .filter_map(|item| match serde_json::from_value::<AdminJob>(item) {
                Ok(job) => Some(job),
                Err(e) => {
                    tracing::warn!("Skipping malformed job entry: {}", e);
                    None
                }
            })
            .collect()
    }

    async fn write(&self, jobs: &[AdminJob]) -> Result<(), AdminError> {
        let value = serde_json::to_value(jobs).map_err(anyhow::Error::from)?;
        self.port.save(&value).await?;
        Ok(())
    }

    pub async fn list(&self) -> Vec<AdminJob> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    /// `run_at` defaults to one minute from `now`. The op name is stored as
    /// given; unknown names fail when the job runs.
    pub async fn create(
        &self,
        op: &str,
        run_at: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<AdminJob, AdminError> {
        let op = op.trim();
        if op.is_empty() {
            return Err(AdminError::MissingOp);
        }
        let run_at = match run_at.map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => DateTime::parse_from_rfc3339(raw)
                .map(|at| iso(at.with_timezone(&Utc)))
                .map_err(|_| AdminError::InvalidRunAt(raw.to_string()))?,
            None => iso(now + Duration::seconds(DEFAULT_DELAY_SECS)),
        };

        let suffix: String = uuid::Uuid::new_v4().simple().to_string().chars().take(6).collect();
        let stamp = iso(now);
        let job = AdminJob {
            id: format!("job_{}_{}", now.timestamp_millis(), suffix),
            op: op.to_string(),
            run_at,
            status: JobStatus::Queued,
            created_at: stamp.clone(),
            updated_at: stamp,
            result: None,
        };

        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await;
        jobs.insert(0, job.clone());
        jobs.truncate(MAX_JOBS);
        self.write(&jobs).await?;
        tracing::info!("Job {} queued: {} at {}", job.id, job.op, job.run_at);
        Ok(job)
    }

    /// Removing an unknown id is not an error.
    pub async fn delete(&self, id: &str) -> Result<(), AdminError> {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() != before {
            self.write(&jobs).await?;
            tracing::info!("Job {} deleted", id);
        }
        Ok(())
    }

    async fn update<F>(&self, id: &str, apply: F) -> Result<(), AdminError>
    where
        F: FnOnce(&mut AdminJob),
    {
        let _guard = self.lock.lock().await;
        let mut jobs = self.read().await;
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            apply(job);
            self.write(&jobs).await?;
        }
        Ok(())
    }

    async fn due(&self, now: DateTime<Utc>) -> Vec<AdminJob> {
        let _guard = self.lock.lock().await;
        self.read().await.into_iter().filter(|j| j.due(now)).collect()
    }
}

pub struct JobScheduler {
    store: Arc<JobStore>,
    ops: Arc<AdminOps>,
}

impl JobScheduler {
    pub fn new(store: Arc<JobStore>, ops: Arc<AdminOps>) -> Self {
        Self { store, ops }
    }

    /// Run every queued job whose time has come. Returns how many ran.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, AdminError> {
        let due = self.store.due(now).await;
        for job in &due {
            let started = iso(Utc::now());
            self.store
                .update(&job.id, |j| {
                    j.status = JobStatus::Running;
                    j.updated_at = started;
                })
                .await?;

            let args = json!({ "via": "job", "id": job.id });
            let result = match self.ops.run(&job.op, args, JOB_OUTPUT_KEEP).await {
                Ok(out) => JobResult { ok: out.ok, stdout: out.stdout, stderr: out.stderr },
                Err(e) => JobResult { ok: false, stdout: String::new(), stderr: e.to_string() },
            };
            let status = if result.ok { JobStatus::Done } else { JobStatus::Failed };
            tracing::info!("Job {} ({}) finished: {:?}", job.id, job.op, status);

            let finished = iso(Utc::now());
            self.store
                .update(&job.id, |j| {
                    j.status = status;
                    j.updated_at = finished;
                    j.result = Some(JobResult {
                        ok: result.ok,
                        stdout: tail_chars(&result.stdout, JOB_OUTPUT_KEEP),
                        stderr: tail_chars(&result.stderr, JOB_OUTPUT_KEEP),
                    });
                })
                .await?;
        }
        Ok(due.len())
    }

    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(TICK_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let Err(e) = self.tick(Utc::now()).await {
                    tracing::error!("Job scheduler tick failed: {}", e);
                }
            }
        })
    }
}
