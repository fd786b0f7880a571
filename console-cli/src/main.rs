use clap::{Parser, Subcommand};
use console_cli::client::{ConsoleClient, DEFAULT_URL};
use console_cli::forge::{presets, ForgeRunner, StepStatus, TimelineEntry, Workflow};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "console-cli", version, about = "Command-line companion for the owner console")]
struct Cli {
    /// Console base URL
    #[arg(long, env = "CONSOLE_URL", default_value = DEFAULT_URL)]
    url: String,

    /// Session token from a previous login
    #[arg(long, env = "CONSOLE_TOKEN")]
    token: Option<String>,

    #[arg(long, env = "CONSOLE_USERNAME")]
    username: Option<String>,

    #[arg(long, env = "CONSOLE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run and inspect workflows
    Forge {
        #[command(subcommand)]
        action: ForgeAction,
    },
}

#[derive(Subcommand, Debug)]
enum ForgeAction {
    /// List the built-in workflows
    Presets,
    /// Run a built-in workflow by name or a workflow JSON file
    Run { workflow: String },
}

fn load_workflow(spec: &str) -> anyhow::Result<Workflow> {
    if let Some(preset) = presets::get(spec) {
        return Ok(preset?);
    }
    let path = Path::new(spec);
    if !path.is_file() {
        anyhow::bail!("'{}' is neither a preset ({}) nor a file", spec, presets::NAMES.join(", "));
    }
    Ok(Workflow::from_json(&std::fs::read_to_string(path)?)?)
}

fn print_timeline(entries: &[TimelineEntry]) {
    for (i, entry) in entries.iter().enumerate() {
        let mark = match entry.status {
            StepStatus::Pending => " ",
            StepStatus::Running => ">",
            StepStatus::Done => "✓",
            StepStatus::Failed => "✗",
        };
        println!("[{}] {:>2}. {:<24} {}", mark, i + 1, entry.label, entry.detail);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match cli.command {
        Command::Forge { action: ForgeAction::Presets } => {
            for (name, wf) in presets::all() {
                println!("{:<12} {} ({} steps)", name, wf.name, wf.steps.len());
            }
            Ok(())
        }
        Command::Forge { action: ForgeAction::Run { workflow } } => {
            let workflow = load_workflow(&workflow)?;
            let mut client = ConsoleClient::new(Some(cli.url.as_str()), cli.token)?;
            if let (Some(user), Some(pass)) = (cli.username.as_deref(), cli.password.as_deref()) {
                client.login(user, pass).await?;
            }
            if !client.has_token() {
                tracing::warn!("No token or credentials given; protected routes will answer 401");
            }

            let runner = Arc::new(ForgeRunner::new(Arc::new(client)));
            let stopper = runner.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    stopper.stop();
                }
            });

            let result = runner.run(&workflow).await;
            print_timeline(&runner.timeline());
            match result {
                Ok(()) => {
                    println!("Workflow '{}' completed", workflow.name);
                    Ok(())
                }
                Err(e) => anyhow::bail!("Workflow '{}' ended: {}", workflow.name, e),
            }
        }
    }
}
