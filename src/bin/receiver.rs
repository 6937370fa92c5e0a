//! Audio Receiver Application
//!
//! Receives the PCM stream from a sender and plays it on a desktop output.
//!
//! Usage: `receiver [port] [--config <path>] [--init-config] [--json]`

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulselink::{
    audio::device::list_devices,
    config::AppConfig,
    events::{self, EventBus},
    session::ReceiverSession,
};

#[derive(Debug, Default)]
struct Args {
    port: Option<u16>,
    config: Option<PathBuf>,
    init_config: bool,
    json: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args::default();
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" => args.config = Some(iter.next().context("--config needs a path")?.into()),
                "--init-config" => args.init_config = true,
                "--json" => args.json = true,
                flag if flag.starts_with("--") => bail!("unknown flag {}", flag),
                port if args.port.is_none() => {
                    args.port = Some(port.parse::<u16>().with_context(|| format!("invalid port {}", port))?)
                }
                _ => bail!("unexpected argument {}", arg),
            }
        }
        Ok(args)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse()?;
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.network.port = port;
    }
    config.validate()?;

    if args.init_config {
        let path = args
            .config
            .clone()
            .or_else(AppConfig::default_path)
            .context("no config directory available")?;
        config.save(&path)?;
        println!("Wrote {}", path.display());
        return Ok(());
    }

    tracing::info!("Starting PulseLink Receiver");

    if !args.json {
        // List available output devices
        println!("\n=== Available Output Devices ===");
        for device in list_devices().iter().filter(|d| d.is_output) {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}:", device.name, default_marker);
            println!("    ID: {}", device.id);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
        println!();
    }

    let events = EventBus::new();
    let _printer = events::spawn_printer(events.subscribe(), args.json)?;

    let session_events = events.clone();
    let mut session = tokio::task::spawn_blocking(move || ReceiverSession::start(&config, session_events))
        .await??;

    tracing::info!("Listening on {} - press Ctrl+C to stop", session.local_addr());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(Duration::from_millis(200));
    let mut last_stats = std::time::Instant::now();

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                tracing::info!("Interrupted");
                break;
            }
            _ = tick.tick() => {
                if session.is_finished() {
                    break;
                }

                // Periodic stats logging
                if last_stats.elapsed() >= Duration::from_secs(5) {
                    let stats = session.stats();
                    tracing::info!(
                        "Stats: {} frames played, {} probes, {} malformed, {} sequence gaps, {:.1} KB received",
                        stats.frames_forwarded,
                        stats.probes_received,
                        stats.malformed_packets,
                        stats.sequence_gaps,
                        stats.bytes_received as f64 / 1024.0
                    );
                    last_stats = std::time::Instant::now();
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || session.stop()).await??;
    Ok(())
}
