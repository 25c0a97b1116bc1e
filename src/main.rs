use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use troublemaker::{config::Config, logging, plugin, proxy::Proxy};

/// Troublemaker BLIP Proxy
#[derive(Parser)]
#[command(name = "troublemaker")]
#[command(about = "A proxy that injects faults into BLIP WebSocket traffic")]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = match cli.config {
        Some(path) => path,
        None => prompt_for_config_path()?,
    };

    let config = Config::load(&config_path).await?;

    logging::init_logging(
        &config.log_level,
        config.log_to_file,
        config.log_file_path.as_deref(),
    )?;
    tracing::info!("Using configuration from {}", config_path.display());

    let plugins = plugin::build_plugins(&config.plugins);
    if plugins.is_empty() {
        tracing::warn!("No plugins loaded, traffic will pass through unmodified");
    }

    let proxy = Proxy::new(config, plugins);
    let shutdown = proxy.shutdown_handle();

    // Ctrl+C flips the shutdown channel; the run loop drains and returns
    spawn_signal_handler(shutdown);
    proxy.run().await?;

    tracing::info!("Goodbye");
    Ok(())
}

fn prompt_for_config_path() -> anyhow::Result<PathBuf> {
    eprint!("Please enter the path to the configuration file: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("reading configuration path from stdin")?;
    let trimmed = line.trim();
    if trimmed.is_empty() {
        anyhow::bail!("No configuration file provided");
    }
    Ok(PathBuf::from(trimmed))
}

fn spawn_signal_handler(shutdown: broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Signal handler error: {}", e);
            return;
        }
        tracing::info!("Shutdown signal received");
        let _ = shutdown.send(());
    });
}
