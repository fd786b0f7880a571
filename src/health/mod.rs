//! Health snapshot: database reachability, free disk on the data root and
//! managed-process liveness, recomputed on every call.

pub mod alerts;
pub mod metrics;
pub mod probe;

use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::control::{ManagedTarget, TargetResolver};
use probe::{SystemProbe, SystemReadings};

pub const SERVICE_NAME: &str = "cipherphantom-owner-app";
pub const MIN_FREE_BYTES: u64 = 256 * 1024 * 1024;

#[async_trait]
pub trait DbPing: Send + Sync {
    async fn ping(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DbCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_bytes: Option<u64>,
    pub min_free_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessCheck {
    pub ok: bool,
    pub managed: bool,
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub online: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checks {
    pub db: DbCheck,
    pub pm2: ProcessCheck,
    pub disk: DiskCheck,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Runtime {
    pub uptime_sec: u64,
    pub rss_bytes: u64,
    pub load_avg_1m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub ok: bool,
    pub service: String,
    pub ts: String,
    pub checks: Checks,
    pub runtime: Runtime,
}

pub struct HealthAggregator {
    db: Arc<dyn DbPing>,
    probe: Arc<dyn SystemProbe>,
    resolver: TargetResolver,
    data_root: PathBuf,
    started: Instant,
}

impl HealthAggregator {
    pub fn new(
        db: Arc<dyn DbPing>,
        probe: Arc<dyn SystemProbe>,
        resolver: TargetResolver,
        data_root: PathBuf,
    ) -> Self {
        Self {
            db,
            probe,
            resolver,
            data_root,
            started: Instant::now(),
        }
    }

    pub fn uptime_sec(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub async fn snapshot(&self) -> HealthSnapshot {
        self.snapshot_with_readings().await.0
    }

    /// Snapshot plus the raw host readings it was built from (the alert
    /// rules need memory figures the snapshot does not carry).
    pub async fn snapshot_with_readings(&self) -> (HealthSnapshot, SystemReadings) {
        let db = self.check_db().await;
        let pm2 = self.check_processes().await;
        let disk = self.check_disk().await;
        let readings = self.probe.readings().await;

        let snapshot = HealthSnapshot {
            ok: db.ok && disk.ok,
            service: SERVICE_NAME.to_string(),
            ts: crate::utils::now_iso(),
            checks: Checks { db, pm2, disk },
            runtime: Runtime {
                uptime_sec: self.uptime_sec(),
                rss_bytes: readings.rss_bytes,
                load_avg_1m: (readings.load_avg[0] * 100.0).round() / 100.0,
            },
        };
        if !snapshot.ok {
            tracing::warn!(
                "Health degraded: db={} disk={}",
                snapshot.checks.db.ok,
                snapshot.checks.disk.ok
            );
        }
        (snapshot, readings)
    }

    async fn check_db(&self) -> DbCheck {
        match self.db.ping().await {
            Ok(()) => DbCheck { ok: true, error: None },
            Err(e) => DbCheck { ok: false, error: Some(e) },
        }
    }

    async fn check_disk(&self) -> DiskCheck {
        match self.probe.disk_available(&self.data_root).await {
            Ok(available) => DiskCheck {
                ok: available >= MIN_FREE_BYTES,
                available_bytes: Some(available),
                min_free_bytes: MIN_FREE_BYTES,
                error: None,
            },
            Err(e) => DiskCheck {
                ok: false,
                available_bytes: None,
                min_free_bytes: MIN_FREE_BYTES,
                error: Some(e.to_string()),
            },
        }
    }

    async fn check_processes(&self) -> ProcessCheck {
        let candidates = self.resolver.all_process_candidates();
        match self.resolver.pm2().list().await {
            Ok(list) => {
                let relevant: Vec<_> = list.iter().filter(|p| candidates.contains(&p.name)).collect();
                let online = relevant.iter().filter(|p| p.is_online()).count();
                ProcessCheck {
                    ok: online >= 1,
                    managed: true,
                    mode: "pm2".to_string(),
                    reason: None,
                    error: None,
                    online,
                    total: relevant.len(),
                }
            }
            Err(e) if e.is_pm2_unavailable() => {
                let mut total = 0;
                let mut online = 0;
                for t in ManagedTarget::ALL {
                    let Ok(unit) = self.resolver.resolve_container(t).await else {
                        continue;
                    };
                    // a discovered unit counts even when its status call fails
                    total += 1;
                    match self.resolver.docker().status(&unit.unit_name).await {
                        Ok(status) if status.status == "running" => online += 1,
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Container {} status failed: {}", unit.unit_name, e),
                    }
                }
                let managed = total > 0;
                ProcessCheck {
                    ok: managed && online >= 1,
                    managed,
                    mode: if managed { "docker" } else { "unmanaged" }.to_string(),
                    reason: Some("pm2_unavailable".to_string()),
                    error: Some(e.to_string()),
                    online,
                    total,
                }
            }
            Err(e) => ProcessCheck {
                ok: false,
                managed: true,
                mode: "pm2".to_string(),
                reason: None,
                error: Some(e.to_string()),
                online: 0,
                total: 0,
            },
        }
    }
}
