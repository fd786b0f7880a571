use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use super::flags::FlagStore;
use super::AdminError;
use crate::utils::{shell_args, tail_chars, CommandRunner};

/// Output kept from a direct operation run.
pub const OP_OUTPUT_KEEP: usize = 12_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminOp {
    Pm2Save,
    Pm2Resurrect,
    RestartBot,
    RestartApp,
    RestartAll,
    GitPull,
    NpmInstall,
    DeployNow,
    ApkBuildDebug,
}

impl FromStr for AdminOp {
    type Err = AdminError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "pm2_save" => Self::Pm2Save,
            "pm2_resurrect" => Self::Pm2Resurrect,
            "restart_bot" => Self::RestartBot,
            "restart_app" => Self::RestartApp,
            "restart_all" => Self::RestartAll,
            "git_pull" => Self::GitPull,
            "npm_install" => Self::NpmInstall,
            "deploy_now" => Self::DeployNow,
            "apk_build_debug" => Self::ApkBuildDebug,
            other => return Err(AdminError::UnknownOp(other.to_string())),
        })
    }
}

impl AdminOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pm2Save => "pm2_save",
            Self::Pm2Resurrect => "pm2_resurrect",
            Self::RestartBot => "restart_bot",
            Self::RestartApp => "restart_app",
            Self::RestartAll => "restart_all",
            Self::GitPull => "git_pull",
            Self::NpmInstall => "npm_install",
            Self::DeployNow => "deploy_now",
            Self::ApkBuildDebug => "apk_build_debug",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpResult {
    pub ok: bool,
    pub op: String,
    pub cmd: String,
    pub stdout: String,
    pub stderr: String,
    pub args: Value,
}

/// Where the operations run and which pm2 names they restart.
#[derive(Debug, Clone)]
pub struct OpContext {
    pub project_root: PathBuf,
    pub android_dir: PathBuf,
    pub bot_process: String,
    pub app_process: String,
}

fn quote(path: &std::path::Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', r"'\''"))
}

impl OpContext {
    pub fn command(&self, op: AdminOp) -> String {
        let root = quote(&self.project_root);
        let bot = &self.bot_process;
        let app = &self.app_process;
        match op {
            AdminOp::Pm2Save => "pm2 save".to_string(),
            AdminOp::Pm2Resurrect => "pm2 resurrect".to_string(),
            AdminOp::RestartBot => format!("pm2 restart {}", bot),
            AdminOp::RestartApp => format!("pm2 restart {}", app),
            AdminOp::RestartAll => format!("pm2 restart {} && pm2 restart {}", bot, app),
            AdminOp::GitPull => format!("cd {} && git pull --ff-only origin main", root),
            AdminOp::NpmInstall => format!("cd {} && npm install", root),
            AdminOp::DeployNow => format!(
                "cd {} && git pull --ff-only origin main && pm2 restart {} && pm2 restart {} && pm2 save",
                root, bot, app
            ),
            AdminOp::ApkBuildDebug => {
                format!("cd {} && ./gradlew assembleDebug --no-daemon", quote(&self.android_dir))
            }
        }
    }
}

pub struct AdminOps {
    runner: Arc<dyn CommandRunner>,
    flags: Arc<FlagStore>,
    ctx: OpContext,
}

impl AdminOps {
    pub fn new(runner: Arc<dyn CommandRunner>, flags: Arc<FlagStore>, ctx: OpContext) -> Self {
        Self { runner, flags, ctx }
    }

    /// Run a named operation through `bash -lc`, keeping the last `keep`
    /// characters of each output stream. Unknown names and flag-gated
    /// operations are refused before anything runs.
    pub async fn run(&self, name: &str, args: Value, keep: usize) -> Result<OpResult, AdminError> {
        let op: AdminOp = name.parse()?;
        let flags = self.flags.get().await;
        match op {
            AdminOp::DeployNow if !flags.deploy_enabled => {
                return Err(AdminError::FeatureDisabled("Deploy is disabled by feature flag."));
            }
            AdminOp::ApkBuildDebug if !flags.apk_build_enabled => {
                return Err(AdminError::FeatureDisabled("APK build is disabled by feature flag."));
            }
            _ => {}
        }

        let cmd = self.ctx.command(op);
        tracing::info!("Admin op {}: {}", op.as_str(), cmd);
        let (ok, stdout, stderr) = match self.runner.run("bash", &shell_args(&cmd)).await {
            Ok(out) => (out.success, out.stdout, out.stderr),
            Err(e) => (false, String::new(), e.to_string()),
        };
        if !ok {
            tracing::warn!("Admin op {} failed", op.as_str());
        }
        Ok(OpResult {
            ok,
            op: op.as_str().to_string(),
            cmd,
            stdout: tail_chars(&stdout, keep),
            stderr: tail_chars(&stderr, keep),
            args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::flags::AdminFlags;
    use crate::persist::MemoryJsonPort;
    use crate::testing::ScriptedRunner;
    use serde_json::json;

    fn ctx() -> OpContext {
        OpContext {
            project_root: PathBuf::from("/srv/bot"),
            android_dir: PathBuf::from("/srv/bot/owner-app/android"),
            bot_process: "cipherphantom-bot".to_string(),
            app_process: "cipherphantom-owner-app".to_string(),
        }
    }

    fn ops(runner: Arc<ScriptedRunner>, flags: serde_json::Value) -> AdminOps {
        let store = FlagStore::new(Arc::new(MemoryJsonPort::with_value(flags)), AdminFlags::defaults(false));
        AdminOps::new(runner, Arc::new(store), ctx())
    }

    #[test]
    fn test_command_table() {
        let c = ctx();
        assert_eq!(c.command(AdminOp::Pm2Save), "pm2 save");
        assert_eq!(
            c.command(AdminOp::GitPull),
            "cd '/srv/bot' && git pull --ff-only origin main"
        );
        assert_eq!(
            c.command(AdminOp::DeployNow),
            "cd '/srv/bot' && git pull --ff-only origin main && pm2 restart cipherphantom-bot && pm2 restart cipherphantom-owner-app && pm2 save"
        );
        assert_eq!(
            c.command(AdminOp::ApkBuildDebug),
            "cd '/srv/bot/owner-app/android' && ./gradlew assembleDebug --no-daemon"
        );
        assert_eq!("restart_all".parse::<AdminOp>().unwrap(), AdminOp::RestartAll);
        assert!("rm_rf".parse::<AdminOp>().is_err());
    }

    #[test]
    fn test_quote_escapes_single_quotes() {
        assert_eq!(quote(std::path::Path::new("/srv/it's")), r"'/srv/it'\''s'");
    }

    #[tokio::test]
    async fn test_run_through_bash() {
        let runner = Arc::new(ScriptedRunner::missing_pm2());
        let result = ops(runner.clone(), json!({})).run("npm_install", json!({"via": "test"}), 8).await.unwrap();
        assert!(result.ok);
        assert_eq!(result.cmd, "cd '/srv/bot' && npm install");
        assert_eq!(result.stdout.chars().count(), 8);
        assert_eq!(runner.calls(), vec!["bash -lc cd '/srv/bot' && npm install"]);
    }

    #[tokio::test]
    async fn test_gated_ops_refused() {
        let runner = Arc::new(ScriptedRunner::missing_pm2());
        let ops = ops(runner.clone(), json!({"deployEnabled": false, "apkBuildEnabled": false}));
        let err = ops.run("deploy_now", json!({}), OP_OUTPUT_KEEP).await.unwrap_err();
        assert_eq!(err.to_string(), "Deploy is disabled by feature flag.");
        assert!(ops.run("apk_build_debug", json!({}), OP_OUTPUT_KEEP).await.is_err());
        assert!(matches!(
            ops.run("format_disk", json!({}), OP_OUTPUT_KEEP).await,
            Err(AdminError::UnknownOp(_))
        ));
        assert!(runner.calls().is_empty());
    }
}
