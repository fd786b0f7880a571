//! Target resolution across the two process backends.
//!
//! `bot` and `app` are looked up in pm2 first. Only when the pm2 binary is
//! missing does the lookup move on to Docker; any other pm2 failure is
//! reported as-is. `all` fans out over both targets and never lets one
//! failure abort the other. `server` is the host itself.

use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::UnitNames;
use crate::docker::DockerBackend;
use crate::error::ControlError;
use crate::supervisor::Pm2Backend;
use crate::utils::{shell_args, CommandRunner};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Bot,
    App,
    All,
    Server,
}

impl FromStr for Target {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "bot" => Ok(Self::Bot),
            "app" => Ok(Self::App),
            "all" => Ok(Self::All),
            "server" => Ok(Self::Server),
            other => Err(ControlError::BadTarget(other.to_string())),
        }
    }
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::App => "app",
            Self::All => "all",
            Self::Server => "server",
        }
    }

    pub fn managed(&self) -> Option<ManagedTarget> {
        match self {
            Self::Bot => Some(ManagedTarget::Bot),
            Self::App => Some(ManagedTarget::App),
            _ => None,
        }
    }
}

/// A single workload with a backing unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagedTarget {
    Bot,
    App,
}

impl ManagedTarget {
    pub const ALL: [ManagedTarget; 2] = [ManagedTarget::Bot, ManagedTarget::App];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bot => "bot",
            Self::App => "app",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Start,
    Stop,
    Restart,
}

impl FromStr for Action {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "start" => Ok(Self::Start),
            "stop" => Ok(Self::Stop),
            "restart" => Ok(Self::Restart),
            other => Err(ControlError::BadAction(other.to_string())),
        }
    }
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    Pm2,
    Docker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedUnit {
    pub mode: BackendMode,
    pub unit_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStatus {
    pub name: String,
    pub status: String,
    pub uptime_sec: u64,
    pub restarts: u64,
    pub pid: Option<u32>,
    pub mode: BackendMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTail {
    pub process_name: String,
    pub lines: usize,
    pub out: String,
    pub err: String,
    pub mode: BackendMode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionOutcome {
    pub process_name: String,
    pub mode: BackendMode,
    pub action: Action,
    /// Fresh status after the action; `None` when the re-read failed.
    pub status: Option<ProcessStatus>,
}

/// Per-target results of an `all` request, in bot, app order.
pub type FanOut<T> = Vec<(ManagedTarget, Result<T, ControlError>)>;

/// True when a fan-out failure means "no backend manages this target"
/// (pm2 missing and no reachable container).
pub fn is_unmanaged(err: &ControlError) -> bool {
    matches!(
        err,
        ControlError::Pm2Unavailable | ControlError::ContainerNotFound | ControlError::DockerFailed(_)
    )
}

#[derive(Clone)]
pub struct TargetResolver {
    pm2: Pm2Backend,
    docker: DockerBackend,
    units: UnitNames,
    runner: Arc<dyn CommandRunner>,
}

impl TargetResolver {
    pub fn new(pm2: Pm2Backend, docker: DockerBackend, units: UnitNames, runner: Arc<dyn CommandRunner>) -> Self {
        Self { pm2, docker, units, runner }
    }

    pub fn pm2(&self) -> &Pm2Backend {
        &self.pm2
    }

    pub fn docker(&self) -> &DockerBackend {
        &self.docker
    }

    pub fn units(&self) -> &UnitNames {
        &self.units
    }

    fn process_candidates(&self, target: ManagedTarget) -> &[String] {
        match target {
            ManagedTarget::Bot => &self.units.bot_processes,
            ManagedTarget::App => &self.units.app_processes,
        }
    }

    /// Every pm2 name either target may run under.
    pub fn all_process_candidates(&self) -> Vec<String> {
        self.units
            .bot_processes
            .iter()
            .chain(self.units.app_processes.iter())
            .cloned()
            .collect()
    }

    pub async fn resolve(&self, target: ManagedTarget) -> Result<ResolvedUnit, ControlError> {
        match self.pm2.find(self.process_candidates(target)).await {
            Ok(unit_name) => Ok(ResolvedUnit { mode: BackendMode::Pm2, unit_name }),
            Err(e) if e.is_pm2_unavailable() => {
                tracing::debug!("pm2 unavailable, resolving {} via docker", target.as_str());
                self.resolve_container(target).await
            }
            Err(e) => Err(e),
        }
    }

    pub async fn resolve_container(&self, target: ManagedTarget) -> Result<ResolvedUnit, ControlError> {
        let (candidates, service) = match target {
            ManagedTarget::Bot => (&self.units.bot_containers, &self.units.bot_service),
            ManagedTarget::App => (&self.units.app_containers, &self.units.app_service),
        };
        let unit_name = self.docker.discover(candidates, service).await?;
        Ok(ResolvedUnit { mode: BackendMode::Docker, unit_name })
    }

    pub async fn container_status(&self, target: ManagedTarget) -> Result<ProcessStatus, ControlError> {
        let unit = self.resolve_container(target).await?;
        self.docker.status(&unit.unit_name).await
    }

    pub async fn status(&self, target: ManagedTarget) -> Result<ProcessStatus, ControlError> {
        let unit = self.resolve(target).await?;
        match unit.mode {
            BackendMode::Pm2 => match self.pm2.status(&unit.unit_name).await {
                Err(e) if e.is_pm2_unavailable() => self.container_status(target).await,
                other => other,
            },
            BackendMode::Docker => self.docker.status(&unit.unit_name).await,
        }
    }

    pub async fn logs(&self, target: ManagedTarget, lines: usize) -> Result<LogTail, ControlError> {
        let unit = self.resolve(target).await?;
        self.unit_logs(&unit, lines).await
    }

    async fn unit_logs(&self, unit: &ResolvedUnit, lines: usize) -> Result<LogTail, ControlError> {
        match unit.mode {
            BackendMode::Pm2 => Ok(self.pm2.logs(&unit.unit_name, lines).await),
            BackendMode::Docker => self.docker.logs(&unit.unit_name, lines).await,
        }
    }

    /// Host logs are the app unit's logs. When pm2 runs but does not list
    /// the app, its default log files are still read.
    pub async fn server_logs(&self, lines: usize) -> Result<LogTail, ControlError> {
        match self.resolve(ManagedTarget::App).await {
            Ok(unit) => self.unit_logs(&unit, lines).await,
            Err(ControlError::Pm2ProcessNotFound(name)) => Ok(self.pm2.logs(&name, lines).await),
            Err(e) => Err(e),
        }
    }

    pub async fn act(&self, target: ManagedTarget, action: Action) -> Result<ActionOutcome, ControlError> {
        let mut unit = self.resolve(target).await?;
        if unit.mode == BackendMode::Pm2 {
            match self.pm2.act(&unit.unit_name, action).await {
                Err(e) if e.is_pm2_unavailable() => {
                    tracing::warn!("pm2 vanished during {} {}, retrying via docker", action.as_str(), target.as_str());
                    unit = self.resolve_container(target).await?;
                }
                other => other?,
            }
        }
        if unit.mode == BackendMode::Docker {
            self.docker.act(&unit.unit_name, action).await?;
        }

        let status = match unit.mode {
            BackendMode::Pm2 => self.pm2.status(&unit.unit_name).await,
            BackendMode::Docker => self.docker.status(&unit.unit_name).await,
        };
        if let Err(e) = &status {
            tracing::warn!("Status re-read after {} failed: {}", action.as_str(), e);
        }
        Ok(ActionOutcome {
            process_name: unit.unit_name,
            mode: unit.mode,
            action,
            status: status.ok(),
        })
    }

    pub async fn status_all(&self) -> FanOut<ProcessStatus> {
        let mut out = Vec::with_capacity(2);
        for t in ManagedTarget::ALL {
            out.push((t, self.status(t).await));
        }
        out
    }

    pub async fn logs_all(&self, lines: usize) -> FanOut<LogTail> {
        let mut out = Vec::with_capacity(2);
        for t in ManagedTarget::ALL {
            out.push((t, self.logs(t, lines).await));
        }
        out
    }

    pub async fn act_all(&self, action: Action) -> FanOut<ActionOutcome> {
        let mut out = Vec::with_capacity(2);
        for t in ManagedTarget::ALL {
            let res = self.act(t, action).await;
            if let Err(e) = &res {
                tracing::warn!("{} {} failed: {}", action.as_str(), t.as_str(), e);
            }
            out.push((t, res));
        }
        out
    }

    /// Persist the pm2 process list, then hand the reboot command to a
    /// detached shell. `allowed` combines the config switch and the flag.
    pub async fn reboot_server(&self, action: Action, allowed: bool, command: &str) -> Result<(), ControlError> {
        if action != Action::Restart {
            return Err(ControlError::ServerActionNotAllowed(action.as_str().to_string()));
        }
        if !allowed {
            return Err(ControlError::Forbidden(
                "Server reboot is disabled (set CONSOLE_ALLOW_SERVER_REBOOT=1 and enable rebootEnabled)".to_string(),
            ));
        }
        if let Err(e) = self.pm2.save().await {
            tracing::warn!("pm2 save before reboot failed: {}", e);
        }
        tracing::warn!("Server reboot requested: {}", command);
        self.runner
            .spawn_detached("bash", &shell_args(command))
            .map_err(|e| ControlError::CommandFailed(format!("Reboot command could not be started: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockTransport, ScriptedRunner};
    use std::path::PathBuf;

    const JLIST: &str = r#"[
        {"name":"cipherphantom-bot","pid":11,"pm2_env":{"status":"online","restart_time":1}},
        {"name":"cipherphantom-owner-remote","pid":12,"pm2_env":{"status":"online"}}
    ]"#;

    fn resolver(runner: Arc<ScriptedRunner>, docker: Arc<MockTransport>) -> TargetResolver {
        TargetResolver::new(
            Pm2Backend::new(runner.clone(), PathBuf::from("/nonexistent")),
            DockerBackend::new(docker, "/v1.44"),
            UnitNames::default(),
            runner,
        )
    }

    #[test]
    fn test_parse_target_and_action() {
        assert_eq!("BOT".parse::<Target>().unwrap(), Target::Bot);
        assert_eq!(
            "db".parse::<Target>(),
            Err(ControlError::BadTarget("db".to_string()))
        );
        assert_eq!("Restart".parse::<Action>().unwrap(), Action::Restart);
        assert!("kill".parse::<Action>().is_err());
        assert_eq!(Target::All.managed(), None);
    }

    #[tokio::test]
    async fn test_pm2_online_never_touches_docker() {
        let runner = Arc::new(ScriptedRunner::with_jlist(JLIST));
        let docker = Arc::new(MockTransport::new());
        let r = resolver(runner, docker.clone());

        let unit = r.resolve(ManagedTarget::App).await.unwrap();
        assert_eq!(unit.mode, BackendMode::Pm2);
        assert_eq!(unit.unit_name, "cipherphantom-owner-remote");

        let st = r.status(ManagedTarget::Bot).await.unwrap();
        assert_eq!(st.status, "online");
        assert_eq!(st.mode, BackendMode::Pm2);
        assert!(docker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pm2_failure_is_not_masked_by_docker() {
        let runner = Arc::new(ScriptedRunner::failing_pm2("connect EACCES"));
        let docker = Arc::new(MockTransport::new());
        let r = resolver(runner, docker.clone());
        let err = r.resolve(ManagedTarget::Bot).await.unwrap_err();
        assert_eq!(err.code(), "PM2_FAILED");
        assert!(docker.calls().is_empty());
    }

    #[tokio::test]
    async fn test_pm2_missing_falls_back_to_container() {
        let runner = Arc::new(ScriptedRunner::missing_pm2());
        let docker = Arc::new(MockTransport::new());
        docker.respond("GET", "/v1.44/containers/owner-app/json", 200, r#"{"State":{"Status":"running","Pid":9}}"#);
        docker.respond("POST", "/v1.44/containers/owner-app/restart", 204, "");
        let r = resolver(runner, docker);

        let out = r.act(ManagedTarget::App, Action::Restart).await.unwrap();
        assert_eq!(out.mode, BackendMode::Docker);
        assert_eq!(out.process_name, "owner-app");
        assert_eq!(out.status.unwrap().pid, Some(9));
    }

    #[tokio::test]
    async fn test_all_records_each_target() {
        let runner = Arc::new(ScriptedRunner::missing_pm2());
        let docker = Arc::new(MockTransport::new());
        docker.respond("GET", "/v1.44/containers/cipherphantom-bot/json", 200, r#"{"State":{"Status":"running"}}"#);
        let r = resolver(runner, docker);

        let all = r.status_all().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, ManagedTarget::Bot);
        assert!(all[0].1.is_ok());
        assert_eq!(all[1].1, Err(ControlError::ContainerNotFound));
        assert!(is_unmanaged(all[1].1.as_ref().unwrap_err()));
    }

    #[tokio::test]
    async fn test_server_reboot_gating() {
        let runner = Arc::new(ScriptedRunner::with_jlist("[]"));
        let r = resolver(runner.clone(), Arc::new(MockTransport::new()));

        let err = r.reboot_server(Action::Stop, true, "reboot").await.unwrap_err();
        assert_eq!(err.code(), "BAD_ACTION");
        let err = r.reboot_server(Action::Restart, false, "reboot").await.unwrap_err();
        assert_eq!(err.status_code(), axum::http::StatusCode::FORBIDDEN);
        assert!(runner.detached().is_empty());

        r.reboot_server(Action::Restart, true, "sudo /sbin/shutdown -r +1").await.unwrap();
        assert!(runner.calls().contains(&"pm2 save".to_string()));
        assert_eq!(runner.detached(), vec!["bash -lc sudo /sbin/shutdown -r +1"]);
    }

    #[tokio::test]
    async fn test_server_logs_default_app_name() {
        let runner = Arc::new(ScriptedRunner::with_jlist("[]"));
        let r = resolver(runner, Arc::new(MockTransport::new()));
        let tail = r.server_logs(50).await.unwrap();
        assert_eq!(tail.process_name, "cipherphantom-owner-app");
        assert_eq!(tail.mode, BackendMode::Pm2);
    }
}
