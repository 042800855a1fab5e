use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ps_config::Config;
use ps_streamer::auth::ConfiguredKeyVerifier;

/// PacketStreamer streams network packets from one server to another
#[derive(Parser, Debug)]
#[command(name = "packetstreamer", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Sensor which broadcasts locally captured packets to a receiver
    Sensor,
    /// Receiver which retrieves packets from sensors and writes them to
    /// the configured sinks
    Receiver,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config).with_context(|| {
        format!("could not retrieve configuration from {}", cli.config.display())
    })?;
    init_logger(config.log_filename.as_deref())?;

    let stop = CancellationToken::new();
    spawn_signal_handler(stop.clone());

    match cli.command {
        Command::Sensor => {
            ps_config::validate_sensor(&config).context("invalid configuration")?;
            let config = Arc::new(config);
            let plugins = ps_plugins::start(&config, stop.child_token()).await?;
            let plugin_tx = plugins.as_ref().map(|p| p.sender());
            log::info!("Start sending");
            let result = ps_streamer::sensor::run(config, plugin_tx, stop).await;
            if let Some(plugins) = plugins {
                plugins.shutdown().await;
            }
            result?;
        }
        Command::Receiver => {
            ps_config::validate_receiver(&config).context("invalid configuration")?;
            let config = Arc::new(config);
            let verifier = Arc::new(ConfiguredKeyVerifier::new(config.auth.key.clone()));
            let plugins = ps_plugins::start(&config, stop.child_token()).await?;
            let plugin_tx = plugins.as_ref().map(|p| p.sender());
            log::info!("Start receiving");
            let result = ps_streamer::receiver::run(config, verifier, plugin_tx, stop).await;
            if let Some(plugins) = plugins {
                plugins.shutdown().await;
            }
            result?;
        }
    }

    log::info!("Shutdown complete");
    Ok(())
}

fn init_logger(log_filename: Option<&str>) -> anyhow::Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(path) = log_filename {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("could not open the log file {}", path))?;
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    builder.init();
    Ok(())
}

/// Cancel the stop token on SIGINT or SIGTERM. Stages observe the token
/// alongside their input queues and drain on the way out.
fn spawn_signal_handler(stop: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        log::info!("Shutdown signal received");
        stop.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            log::error!("Could not install the SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
