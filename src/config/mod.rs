use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Console settings. Read from `config/console.toml` (or `CONSOLE_CONFIG`),
/// then overridden by environment variables.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ConsoleConfig {
    pub host: String,
    pub port: u16,
    /// Deployment root; `data/` and the owner app live below it.
    pub project_root: PathBuf,
    pub session_ttl_hours: u64,
    pub owner_ids: Vec<String>,
    pub allow_server_reboot: bool,
    pub server_reboot_cmd: String,
    pub allow_query_token: bool,
    pub public_base_url: Option<String>,
    pub db_backup_keep: usize,
    pub docker: DockerSettings,
    pub units: UnitNames,
    pub apk: ApkSettings,
    /// Directory holding pm2 `<name>-out.log` / `<name>-error.log` files.
    pub pm2_log_dir: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DockerSettings {
    pub socket: PathBuf,
    pub api_prefix: String,
}

/// Candidate unit names per managed target, in lookup order.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UnitNames {
    pub bot_processes: Vec<String>,
    pub app_processes: Vec<String>,
    pub bot_containers: Vec<String>,
    pub app_containers: Vec<String>,
    pub bot_service: String,
    pub app_service: String,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ApkSettings {
    pub latest_version_code: u32,
    pub min_version_code: u32,
    pub download_url: Option<String>,
    pub file: Option<PathBuf>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            project_root: PathBuf::from("."),
            session_ttl_hours: 12,
            owner_ids: Vec::new(),
            allow_server_reboot: false,
            server_reboot_cmd: "sudo /sbin/shutdown -r +1".to_string(),
            allow_query_token: false,
            public_base_url: None,
            db_backup_keep: 20,
            docker: DockerSettings::default(),
            units: UnitNames::default(),
            apk: ApkSettings::default(),
            pm2_log_dir: None,
        }
    }
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/var/run/docker.sock"),
            api_prefix: "/v1.44".to_string(),
        }
    }
}

impl Default for UnitNames {
    fn default() -> Self {
        Self {
            bot_processes: vec!["cipherphantom-bot".to_string()],
            app_processes: vec![
                "cipherphantom-owner-app".to_string(),
                "cipherphantom-owner-remote".to_string(),
            ],
            bot_containers: vec!["cipherphantom-bot".to_string(), "bot".to_string()],
            app_containers: vec!["cipherphantom-owner-app".to_string(), "owner-app".to_string()],
            bot_service: "bot".to_string(),
            app_service: "owner-app".to_string(),
        }
    }
}

impl Default for ApkSettings {
    fn default() -> Self {
        Self {
            latest_version_code: 1,
            min_version_code: 1,
            download_url: None,
            file: None,
        }
    }
}

impl ConsoleConfig {
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var("CONSOLE_CONFIG").unwrap_or_else(|_| "config/console.toml".to_string());
        let mut cfg = Self::from_file(Path::new(&path))?;
        cfg.apply_env(|key| std::env::var(key).ok());
        Ok(cfg)
    }

    /// Missing file yields defaults; a malformed file is an error.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&raw)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(cfg)
    }

    pub fn apply_env<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let flag = |v: String| v == "1" || v.eq_ignore_ascii_case("true");

        if let Some(v) = get("CONSOLE_HOST") {
            self.host = v;
        }
        if let Some(port) = get("CONSOLE_PORT").and_then(|v| v.parse::<u16>().ok()).filter(|p| *p > 0) {
            self.port = port;
        }
        if let Some(v) = get("CONSOLE_PROJECT_ROOT") {
            self.project_root = PathBuf::from(v);
        }
        if let Some(ttl) = get("CONSOLE_SESSION_TTL_HOURS").and_then(|v| v.parse::<u64>().ok()).filter(|t| *t > 0) {
            self.session_ttl_hours = ttl;
        }
        if let Some(v) = get("CONSOLE_OWNER_IDS") {
            self.owner_ids = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        if let Some(v) = get("CONSOLE_ALLOW_SERVER_REBOOT") {
            self.allow_server_reboot = flag(v);
        }
        if let Some(v) = get("CONSOLE_SERVER_REBOOT_CMD") {
            self.server_reboot_cmd = v;
        }
        if let Some(v) = get("CONSOLE_ALLOW_QUERY_TOKEN") {
            self.allow_query_token = flag(v);
        }
        if let Some(v) = get("CONSOLE_PUBLIC_BASE_URL") {
            self.public_base_url = Some(v.trim_end_matches('/').to_string());
        }
        if let Some(keep) = get("CONSOLE_DB_BACKUP_KEEP").and_then(|v| v.parse::<usize>().ok()).filter(|k| *k > 0) {
            self.db_backup_keep = keep;
        }
        if let Some(v) = get("DOCKER_SOCK") {
            self.docker.socket = PathBuf::from(v);
        }
        if let Some(v) = get("DOCKER_API_PREFIX") {
            self.docker.api_prefix = v;
        }
        if let Some(n) = get("CONSOLE_LATEST_APK_VERSION").and_then(|v| v.parse::<u32>().ok()) {
            self.apk.latest_version_code = n;
        }
        if let Some(n) = get("CONSOLE_MIN_APK_VERSION").and_then(|v| v.parse::<u32>().ok()) {
            self.apk.min_version_code = n;
        }
        if let Some(v) = get("CONSOLE_APK_DOWNLOAD_URL") {
            self.apk.download_url = Some(v);
        }
        if let Some(v) = get("CONSOLE_APK_FILE") {
            self.apk.file = Some(PathBuf::from(v));
        }
    }

    pub fn owner_set(&self) -> HashSet<String> {
        self.owner_ids.iter().cloned().collect()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.project_root.join("data")
    }

    pub fn db_file(&self) -> PathBuf {
        self.data_dir().join("cipherphantom.db")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.data_dir().join("backups")
    }

    pub fn avatar_dir(&self) -> PathBuf {
        self.data_dir().join("avatars")
    }

    pub fn flags_file(&self) -> PathBuf {
        self.data_dir().join("admin-flags.json")
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.data_dir().join("admin-jobs.json")
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.data_dir().join("owner-sessions.json")
    }

    pub fn owner_dir(&self) -> PathBuf {
        self.project_root.join("owner-app")
    }

    pub fn web_dir(&self) -> PathBuf {
        self.owner_dir().join("web")
    }

    pub fn android_dir(&self) -> PathBuf {
        self.owner_dir().join("android")
    }

    pub fn local_properties(&self) -> PathBuf {
        self.android_dir().join("local.properties")
    }

    pub fn default_apk_file(&self) -> PathBuf {
        self.android_dir().join("app/build/outputs/apk/debug/app-debug.apk")
    }

    pub fn pm2_logs(&self) -> PathBuf {
        self.pm2_log_dir.clone().unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(".pm2").join("logs")
        })
    }
}
