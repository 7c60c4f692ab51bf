use std::sync::Arc;
use std::time::Duration;

use chatrelay::agent::HttpAgent;
use chatrelay::config::Config;
use chatrelay::error::ChatRelayError;
use chatrelay::logging;
use chatrelay::rate_limit::{LimiterRegistry, RateLimitPreset, SystemClock};
use chatrelay::web::{start_web_server, WebState};
use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(
    name = "chatrelay",
    version = VERSION,
    about = "Rate-limited streaming relay in front of a conversational agent"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start the web server (default)
    Start,
    /// Print the effective rate limit presets
    Presets,
    /// Show version
    Version,
}

fn print_presets(presets: &[RateLimitPreset]) {
    println!("{:<16} {:>14} {:>14}", "feature", "client", "server");
    for preset in presets {
        let client = preset
            .client
            .as_ref()
            .map(|c| format!("{}/{}ms", c.max_requests, c.window_ms))
            .unwrap_or_else(|| "-".into());
        let server = format!("{}/{}ms", preset.server.max_requests, preset.server.window_ms);
        println!("{:<16} {:>14} {:>14}", preset.feature, client, server);
    }
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    logging::init_logging(&config.log_level)?;
    info!("Starting chatrelay v{VERSION}");

    let agent_url = config.agent_url.clone().ok_or_else(|| {
        ChatRelayError::Config("agent_url is required to start the server".into())
    })?;
    let agent = HttpAgent::new(&agent_url, Duration::from_secs(config.agent_timeout_secs))?;
    let registry = LimiterRegistry::new(Arc::new(SystemClock), config.rate_limit_presets()?);
    info!(
        agent_url = %agent_url,
        presets = registry.presets().len(),
        stream_deadline_ms = config.stream_deadline_ms,
        "Configuration loaded"
    );

    let state = WebState::new(
        Arc::new(registry),
        Arc::new(agent),
        Duration::from_millis(config.stream_deadline_ms),
    );
    start_web_server(&config, state, shutdown_signal()).await?;
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(MainCommand::Start) {
        MainCommand::Version => {
            println!("chatrelay {VERSION}");
            Ok(())
        }
        MainCommand::Presets => {
            let config = Config::load()?;
            print_presets(&config.rate_limit_presets()?);
            Ok(())
        }
        MainCommand::Start => run_server(Config::load()?).await,
    }
}
