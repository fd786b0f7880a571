use std::sync::Arc;

use owner_console::admin::flags::{AdminFlags, FlagStore};
use owner_console::admin::jobs::{JobScheduler, JobStore};
use owner_console::admin::ops::{AdminOps, OpContext};
use owner_console::api::ConsoleServer;
use owner_console::auth::rate_limit::RateLimiter;
use owner_console::auth::{now_ms, SessionStore};
use owner_console::config::ConsoleConfig;
use owner_console::control::TargetResolver;
use owner_console::db::Database;
use owner_console::docker::transport::UnixSocketTransport;
use owner_console::docker::DockerBackend;
use owner_console::health::probe::{SysinfoProbe, SystemProbe};
use owner_console::health::HealthAggregator;
use owner_console::persist::FileJsonPort;
use owner_console::supervisor::Pm2Backend;
use owner_console::utils::{format_bytes, CommandRunner, ProcessRunner};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("Owner console starting (v{})", env!("CARGO_PKG_VERSION"));

    let config = ConsoleConfig::load()?;
    std::fs::create_dir_all(config.data_dir())?;
    let db = Database::open(&config.db_file())?;

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let resolver = TargetResolver::new(
        Pm2Backend::new(runner.clone(), config.pm2_logs()),
        DockerBackend::new(
            Arc::new(UnixSocketTransport::new(config.docker.socket.clone())),
            config.docker.api_prefix.clone(),
        ),
        config.units.clone(),
        runner.clone(),
    );

    let probe: Arc<dyn SystemProbe> = Arc::new(SysinfoProbe);
    let health = Arc::new(HealthAggregator::new(
        Arc::new(db.clone()),
        probe.clone(),
        resolver.clone(),
        config.project_root.clone(),
    ));

    let flags = Arc::new(FlagStore::new(
        Arc::new(FileJsonPort::new(config.flags_file())),
        AdminFlags::defaults(config.allow_server_reboot),
    ));
    let ops = Arc::new(AdminOps::new(
        runner.clone(),
        flags.clone(),
        OpContext {
            project_root: config.project_root.clone(),
            android_dir: config.android_dir(),
            bot_process: config.units.bot_processes.first().cloned().unwrap_or_default(),
            app_process: config.units.app_processes.first().cloned().unwrap_or_default(),
        },
    ));
    let jobs = Arc::new(JobStore::new(Arc::new(FileJsonPort::new(config.jobs_file()))));
    let sessions = Arc::new(SessionStore::load(
        Arc::new(FileJsonPort::new(config.sessions_file())),
        config.session_ttl_hours,
        now_ms(),
    )
    .await);

    let readings = probe.readings().await;
    tracing::info!(
        "Host {} ({}), {} cores, load {:.2}, memory {} free of {}",
        readings.host_name,
        readings.platform,
        readings.cpu_cores,
        readings.load_avg[0],
        format_bytes(readings.available_memory),
        format_bytes(readings.total_memory)
    );
    tracing::info!("Project root: {}", config.project_root.display());
    tracing::info!("Database: {}", config.db_file().display());
    tracing::info!("Web UI: {}", config.web_dir().display());
    tracing::info!(
        "Owners configured: {}, restored sessions: {}",
        config.owner_ids.len(),
        sessions.len().await
    );
    if config.owner_ids.is_empty() {
        tracing::warn!("No owner chat ids configured (CONSOLE_OWNER_IDS); every login will be refused");
    }

    let scheduler = Arc::new(JobScheduler::new(jobs.clone(), ops.clone()));
    let scheduler_task = scheduler.spawn();

    let server = ConsoleServer {
        config: Arc::new(config),
        resolver,
        health,
        probe,
        flags,
        jobs,
        ops,
        sessions,
        db,
        limiter: Arc::new(RateLimiter::new()),
    };
    if let Err(e) = server.start().await {
        tracing::error!("HTTP server error: {}", e);
    }

    scheduler_task.abort();
    tracing::info!("Owner console shutting down");
    Ok(())
}
