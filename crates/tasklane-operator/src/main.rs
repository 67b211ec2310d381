//! Tasklane operator - runs tasks as Kubernetes Jobs and follows them to completion

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kube::Client;

use tasklane_common::telemetry::{init_telemetry, TelemetryConfig};
use tasklane_common::TasklaneConfig;
use tasklane_operator::controller_runner::build_task_controller;
use tasklane_operator::webhook_server::serve_webhook;

/// Tasklane - one-shot task execution on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "tasklane", version, about, long_about = None)]
struct Cli {
    /// Path to the operator configuration file
    #[arg(long, env = "TASKLANE_CONFIG", default_value = "/etc/tasklane/config.yaml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    plain_logs: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Commands {
    /// Run the task completion controller only
    Controller,
    /// Run the admission webhook only
    Webhook,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    init_telemetry(TelemetryConfig {
        service_name: "tasklane-operator".to_string(),
        json: !cli.plain_logs,
    })?;

    let config = TasklaneConfig::load(&cli.config)?;
    tracing::info!(config = %cli.config.display(), namespace = %config.namespace, "configuration loaded");

    match cli.command {
        Some(Commands::Controller) => run_controller(&config).await,
        Some(Commands::Webhook) => serve_webhook(&config.webhook).await,
        None => run_all(&config).await,
    }
}

async fn run_controller(config: &TasklaneConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    build_task_controller(client, config)?.await;
    tracing::info!("Task controller shutting down");
    Ok(())
}

async fn run_all(config: &TasklaneConfig) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    let controller = build_task_controller(client, config)?;

    tokio::select! {
        _ = controller => {
            tracing::info!("Task controller completed");
        }
        result = serve_webhook(&config.webhook) => {
            result?;
            tracing::info!("Webhook server completed");
        }
    }

    tracing::info!("Tasklane operator shutting down");
    Ok(())
}
