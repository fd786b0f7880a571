use super::HealthSnapshot;

/// Prometheus text exposition (format 0.0.4) of a health snapshot.
pub fn render(snapshot: &HealthSnapshot) -> String {
    let flag = |b: bool| if b { 1 } else { 0 };
    let gauges: [(&str, &str, String); 7] = [
        ("owner_app_up", "Owner app health snapshot (1=ok,0=fail)", flag(snapshot.ok).to_string()),
        ("owner_app_db_up", "Database check (1=ok,0=fail)", flag(snapshot.checks.db.ok).to_string()),
        ("owner_app_pm2_up", "PM2 summary check (1=ok,0=fail)", flag(snapshot.checks.pm2.ok).to_string()),
        ("owner_app_disk_up", "Disk free check (1=ok,0=fail)", flag(snapshot.checks.disk.ok).to_string()),
        ("owner_app_process_rss_bytes", "Console process RSS memory bytes", snapshot.runtime.rss_bytes.to_string()),
        ("owner_app_process_uptime_seconds", "Console process uptime in seconds", snapshot.runtime.uptime_sec.to_string()),
        ("owner_app_pm2_online", "Number of relevant managed processes online", snapshot.checks.pm2.online.to_string()),
    ];

    let mut out = String::new();
    for (name, help, value) in gauges {
        out.push_str(&format!("# HELP {} {}\n# TYPE {} gauge\n{} {}\n", name, help, name, name, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{Checks, DbCheck, DiskCheck, ProcessCheck, Runtime};

    #[test]
    fn test_render_gauges() {
        let snap = HealthSnapshot {
            ok: false,
            service: "svc".to_string(),
            ts: String::new(),
            checks: Checks {
                db: DbCheck { ok: false, error: None },
                pm2: ProcessCheck {
                    ok: true,
                    managed: true,
                    mode: "pm2".to_string(),
                    reason: None,
                    error: None,
                    online: 2,
                    total: 3,
                },
                disk: DiskCheck { ok: true, available_bytes: None, min_free_bytes: 0, error: None },
            },
            runtime: Runtime { uptime_sec: 42, rss_bytes: 2048, load_avg_1m: 0.0 },
        };
        let text = render(&snap);
        assert!(text.contains("# TYPE owner_app_up gauge\nowner_app_up 0\n"));
        assert!(text.contains("owner_app_db_up 0\n"));
        assert!(text.contains("owner_app_pm2_online 2\n"));
        assert!(text.contains("owner_app_process_uptime_seconds 42\n"));
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().filter(|l| l.starts_with("# HELP")).count(), 7);
    }
}
