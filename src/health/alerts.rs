use serde::Serialize;

use super::probe::SystemReadings;
use super::HealthSnapshot;
use crate::utils::format_bytes;

pub const LOAD_THRESHOLD: f64 = 2.5;
pub const FREE_RAM_THRESHOLD: f64 = 0.12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Critical,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub level: AlertLevel,
    pub code: &'static str,
    pub message: String,
}

impl Alert {
    fn warning(code: &'static str, message: String) -> Self {
        Self { level: AlertLevel::Warning, code, message }
    }
}

/// Independent rules, evaluated in a fixed order.
pub fn derive_alerts(snapshot: &HealthSnapshot, readings: &SystemReadings) -> Vec<Alert> {
    let mut alerts = Vec::new();
    let checks = &snapshot.checks;

    if !checks.db.ok {
        alerts.push(Alert {
            level: AlertLevel::Critical,
            code: "DB_DOWN",
            message: checks.db.error.clone().unwrap_or_else(|| "DB check failed".to_string()),
        });
    }
    if !checks.disk.ok {
        alerts.push(Alert::warning(
            "DISK_LOW",
            format!("Free disk space low ({})", format_bytes(checks.disk.available_bytes.unwrap_or(0))),
        ));
    }
    if !checks.pm2.ok {
        alerts.push(Alert::warning("PM2_PROC_DOWN", "Not all core processes are online.".to_string()));
    }
    if snapshot.runtime.load_avg_1m > LOAD_THRESHOLD {
        alerts.push(Alert::warning(
            "LOAD_HIGH",
            format!("High CPU load ({})", snapshot.runtime.load_avg_1m),
        ));
    }
    if let Some(ratio) = readings.free_ratio() {
        if ratio < FREE_RAM_THRESHOLD {
            alerts.push(Alert::warning("RAM_LOW", format!("Low free RAM ({:.1}%)", ratio * 100.0)));
        }
    }
    alerts
}
