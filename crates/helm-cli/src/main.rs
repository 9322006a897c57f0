//! helm - operator CLI for the Helm orchestrator.
//!
//! Talks HTTP to the daemon's control API. Exit code 0 means the desired
//! state holds (including "already running" / "already stopped");
//! anything else prints the error kind and exits non-zero.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod client;

use client::{ControlOutcome, DaemonClient};

/// helm - platform service manager
#[derive(Parser, Debug)]
#[command(name = "helm")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon URL (defaults to $HELM_URL, then localhost)
    #[arg(long)]
    url: Option<String>,

    /// Bearer token (defaults to $HELM_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a service
    Start {
        /// Service name
        name: String,

        /// Spawn mode
        #[arg(long, value_parser = ["development", "production"])]
        mode: Option<String>,
    },

    /// Stop a service
    Stop {
        /// Service name
        name: String,
    },

    /// Restart a service
    Restart {
        /// Service name
        name: String,

        /// Spawn mode
        #[arg(long, value_parser = ["development", "production"])]
        mode: Option<String>,
    },

    /// Print one line per service: name, status, health, pid, port
    Status,

    /// Print the service catalog
    List,

    /// Show recent log entries for a service
    Logs {
        /// Service name
        name: String,

        /// Number of entries to show
        #[arg(short = 'n', long, default_value = "20")]
        lines: u32,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match run(cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let url = cli
        .url
        .or_else(|| std::env::var("HELM_URL").ok())
        .unwrap_or_else(|| "http://localhost:5004".to_string());
    let token = cli.token.or_else(|| std::env::var("HELM_TOKEN").ok());
    let client = DaemonClient::new(url, token)?;

    match cli.command {
        Commands::Start { name, mode } => {
            match client.control(&name, "start", mode.as_deref()).await? {
                ControlOutcome::Applied(status) => {
                    println!(
                        "{name} started (pid {}, port {})",
                        status.pid.map_or_else(|| "?".to_string(), |p| p.to_string()),
                        status.port
                    );
                }
                ControlOutcome::AlreadyRunning => println!("{name} is already running"),
            }
        }
        Commands::Stop { name } => {
            if let ControlOutcome::Applied(status) =
                client.control(&name, "stop", None).await?
            {
                println!("{name} {}", status.status);
            }
        }
        Commands::Restart { name, mode } => {
            match client.control(&name, "restart", mode.as_deref()).await? {
                ControlOutcome::Applied(status) => println!(
                    "{name} restarted (pid {})",
                    status.pid.map_or_else(|| "?".to_string(), |p| p.to_string())
                ),
                ControlOutcome::AlreadyRunning => println!("{name} is already running"),
            }
        }
        Commands::Status => {
            let statuses = client.all_status().await?;
            for (name, status) in statuses {
                println!(
                    "{name} {} {} {} {}",
                    status.status,
                    status.health,
                    status.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    status.port
                );
            }
        }
        Commands::List => {
            let catalog = client.list_services().await?;
            let details = catalog
                .get("details")
                .and_then(serde_json::Value::as_object)
                .cloned()
                .unwrap_or_default();
            for (name, entry) in details {
                println!(
                    "{name}  port={}  source={}  order={}",
                    entry.get("port").and_then(serde_json::Value::as_u64).unwrap_or(0),
                    entry
                        .get("source")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("?"),
                    entry
                        .get("install_order")
                        .and_then(serde_json::Value::as_u64)
                        .unwrap_or(0),
                );
            }
        }
        Commands::Logs { name, lines } => {
            let page = client.logs(&name, lines).await?;
            let logs = page
                .get("logs")
                .and_then(serde_json::Value::as_array)
                .cloned()
                .unwrap_or_default();
            // The API returns newest first; print oldest first like tail.
            for entry in logs.iter().rev() {
                println!(
                    "{} [{}] {}",
                    entry
                        .get("timestamp")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("-"),
                    entry
                        .get("level")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or("-"),
                    entry
                        .get("message")
                        .and_then(serde_json::Value::as_str)
                        .unwrap_or(""),
                );
            }
        }
    }
    Ok(())
}
