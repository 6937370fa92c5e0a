//! Audio Sender Application
//!
//! Captures the microphone and streams raw PCM to a receiver over UDP.
//!
//! Usage: `sender [host[:port]] [--config <path>] [--init-config] [--json]`

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulselink::{
    audio::device::list_devices,
    config::AppConfig,
    events::{self, EventBus},
    session::{SenderSession, SessionEnd},
};

#[derive(Debug, Default)]
struct Args {
    target: Option<String>,
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
                _ if args.target.is_none() => args.target = Some(arg.clone()),
                _ => bail!("unexpected argument {}", arg),
            }
        }
        Ok(args)
    }
}

/// Apply `host` or `host:port` from the command line
fn apply_target(config: &mut AppConfig, target: &str) -> Result<()> {
    match target.rsplit_once(':') {
        // Bare IPv6 literals contain colons but no port
        Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
            config.network.host = host.trim_start_matches('[').trim_end_matches(']').to_string();
            config.network.port = port.parse::<u16>().with_context(|| format!("invalid port in {}", target))?;
        }
        _ => config.network.host = target.to_string(),
    }
    Ok(())
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
    if let Some(target) = &args.target {
        apply_target(&mut config, target)?;
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

    tracing::info!("Starting PulseLink Sender");

    if !args.json {
        // List available devices
        println!("\n=== Available Input Devices ===");
        for device in list_devices().iter().filter(|d| d.is_input) {
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

    tracing::info!(
        "Target receiver: {}:{}",
        config.network.host,
        config.network.port
    );

    // Running the binary is the user's consent to capture
    let session_events = events.clone();
    let mut session = tokio::task::spawn_blocking(move || {
        SenderSession::start(&config, true, session_events)
    })
    .await??;

    tracing::info!("Streaming - press Ctrl+C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(Duration::from_millis(200));

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
            }
        }
    }

    let (end, stats) = tokio::task::spawn_blocking(move || {
        let end = session.stop();
        (end, session.client().stats())
    })
    .await?;

    tracing::info!(
        "Sent {} packets ({} send errors)",
        stats.packets_sent,
        stats.send_errors
    );

    match end {
        SessionEnd::Stopped => Ok(()),
        other => bail!("session ended: {}", other),
    }
}
