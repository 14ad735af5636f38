//! # argus-agent
//!
//! Demo host for the Argus bridge, plus a wire probe client.
//!
//! `serve` runs a simulated frame loop that publishes `clock`, `health` and
//! `perf` and drives one scheduling pass per frame. `probe` connects to a
//! running bridge and prints what it receives.

#![deny(unsafe_code)]

mod host;
mod probe;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use argus_bridge::{Bridge, BridgeConfig, CommandDispatcher};
use argus_core::Cadence;
use clap::{Parser, Subcommand};
use tokio::time::{Instant, MissedTickBehavior};

use crate::host::{DemoHost, register_commands, resident_memory_mb};
use crate::probe::ProbeOptions;

/// Argus bridge demo host.
#[derive(Parser, Debug)]
#[command(name = "argus-agent", about = "Argus instrumentation bridge demo host")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the bridge over a simulated frame loop.
    Serve {
        /// Settings file (defaults to `~/.argus/settings.json`).
        #[arg(long)]
        config: Option<PathBuf>,

        /// TCP port (overrides settings).
        #[arg(long)]
        tcp_port: Option<u16>,

        /// HTTP port (overrides settings).
        #[arg(long)]
        http_port: Option<u16>,

        /// Simulated frames per second.
        #[arg(long, default_value = "60")]
        fps: u32,
    },
    /// Connect to a bridge and print envelopes as JSON lines.
    Probe {
        /// Bridge TCP address.
        #[arg(long, default_value = "127.0.0.1:7878")]
        addr: SocketAddr,

        /// Topic to subscribe to (repeatable).
        #[arg(long = "topic", default_values_t = ["health".to_string()])]
        topics: Vec<String>,

        /// Cadence: `every-tick`, `on-change` or `throttled`.
        #[arg(long, default_value = "every-tick")]
        cadence: String,

        /// Deliveries per second for `throttled`.
        #[arg(long)]
        rate: Option<u32>,

        /// Stop after this many telemetry envelopes.
        #[arg(long)]
        count: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Serve {
            config,
            tcp_port,
            http_port,
            fps,
        } => serve(config, tcp_port, http_port, fps).await,
        Command::Probe {
            addr,
            topics,
            cadence,
            rate,
            count,
        } => {
            argus_core::logging::init_subscriber("info", false);
            let cadence = Cadence::parse(&cadence, rate).map_err(anyhow::Error::msg)?;
            let summary = probe::run(ProbeOptions {
                addr,
                topics,
                cadence,
                count,
            })
            .await?;
            tracing::info!(
                telemetry = summary.telemetry,
                gaps = summary.gaps,
                missing = summary.missing,
                "probe finished"
            );
            Ok(())
        }
    }
}

async fn serve(
    config: Option<PathBuf>,
    tcp_port: Option<u16>,
    http_port: Option<u16>,
    fps: u32,
) -> Result<()> {
    let settings_path = config.unwrap_or_else(argus_settings::settings_path);
    let settings = argus_settings::load_settings_from_path(&settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    argus_core::logging::init_subscriber(&settings.logging.level, settings.logging.json);

    let mut config = BridgeConfig::from_settings(&settings).context("Invalid settings")?;
    if let Some(port) = tcp_port {
        config.tcp_port = port;
    }
    if http_port.is_some() {
        config.http_port = http_port;
    }
    let self_ticking = config.tick_interval.is_some();

    let metrics = argus_bridge::metrics::install_recorder().context("Failed to install metrics recorder")?;
    let host = Arc::new(DemoHost::new(settings.perf));
    let mut dispatcher = CommandDispatcher::new();
    register_commands(&host, &mut dispatcher);

    let bridge = Bridge::new(config, host.clone(), dispatcher).with_metrics(metrics);
    let addrs = bridge.serve().await.context("Failed to start bridge")?;
    tracing::info!(tcp = %addrs.tcp, http = ?addrs.http, fps, "argus-agent ready");

    let frame = Duration::from_secs(1) / fps.max(1);
    let mut frames = tokio::time::interval(frame);
    frames.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last = Instant::now();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = &mut shutdown => {
                result.context("Failed to listen for ctrl-c")?;
                break;
            }
            now = frames.tick() => {
                let elapsed = now.duration_since(last);
                last = now;
                host.advance(elapsed.as_secs_f64() * 1000.0, resident_memory_mb());
                if !self_ticking {
                    let _ = bridge.tick();
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    let clean = bridge.shutdown().await;
    tracing::info!(clean, "Shutdown complete");
    Ok(())
}
