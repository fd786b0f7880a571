use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

/// Host readings taken once per health snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemReadings {
    pub host_name: String,
    pub platform: String,
    pub cpu_cores: usize,
    pub load_avg: [f64; 3],
    pub total_memory: u64,
    pub available_memory: u64,
    /// Resident memory of this process.
    pub rss_bytes: u64,
    pub host_uptime_sec: u64,
}

impl SystemReadings {
    /// Free/total memory; `None` when the total is unknown.
    pub fn free_ratio(&self) -> Option<f64> {
        if self.total_memory == 0 {
            return None;
        }
        Some(self.available_memory as f64 / self.total_memory as f64)
    }
}

#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn readings(&self) -> SystemReadings;
    /// Available bytes on the filesystem holding `path`.
    async fn disk_available(&self, path: &Path) -> anyhow::Result<u64>;
}

pub fn read_system() -> SystemReadings {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.refresh_cpu();

    let rss_bytes = match sysinfo::get_current_pid() {
        Ok(pid) => {
            sys.refresh_process(pid);
            sys.process(pid).map(|p| p.memory()).unwrap_or(0)
        }
        Err(_) => 0,
    };
    let load = System::load_average();

    SystemReadings {
        host_name: System::host_name().unwrap_or_else(|| "unknown".to_string()),
        platform: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
        cpu_cores: sys.cpus().len(),
        load_avg: [load.one, load.five, load.fifteen],
        total_memory: sys.total_memory(),
        available_memory: sys.available_memory(),
        rss_bytes,
        host_uptime_sec: System::uptime(),
    }
}

/// Longest mount point that prefixes `path` wins.
pub fn disk_available(path: &Path) -> anyhow::Result<u64> {
    let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| target.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
        .ok_or_else(|| anyhow::anyhow!("no mounted disk holds {}", target.display()))
}

// sysinfo scans the OS tables synchronously; keep it off the runtime workers.
#[derive(Debug, Default, Clone)]
pub struct SysinfoProbe;

#[async_trait]
impl SystemProbe for SysinfoProbe {
    async fn readings(&self) -> SystemReadings {
        tokio::task::spawn_blocking(read_system)
            .await
            .unwrap_or_default()
    }

    async fn disk_available(&self, path: &Path) -> anyhow::Result<u64> {
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || disk_available(&path)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_ratio() {
        let r = SystemReadings { total_memory: 1000, available_memory: 100, ..Default::default() };
        assert_eq!(r.free_ratio(), Some(0.1));
        assert_eq!(SystemReadings::default().free_ratio(), None);
    }

    #[tokio::test]
    async fn test_probe_reads_host() {
        let readings = SysinfoProbe.readings().await;
        assert!(readings.total_memory > 0);
        assert!(readings.rss_bytes > 0);
    }
}
