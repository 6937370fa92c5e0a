//! Local Loopback Application
//!
//! Routes a microphone straight to an output device on the same machine,
//! with the receiver's gain and low-pass applied.
//!
//! Usage: `loopback [--input <id>] [--output <id>] [--config <path>] [--json]`

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pulselink::{
    audio::{CaptureConfig, Loopback, PlayoutConfig},
    config::AppConfig,
    events::{self, EventBus},
};

#[derive(Debug, Default)]
struct Args {
    input: Option<String>,
    output: Option<String>,
    config: Option<PathBuf>,
    json: bool,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args::default();
        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--input" => args.input = Some(iter.next().context("--input needs a device id")?),
                "--output" => args.output = Some(iter.next().context("--output needs a device id")?),
                "--config" => args.config = Some(iter.next().context("--config needs a path")?.into()),
                "--json" => args.json = true,
                other => bail!("unexpected argument {}", other),
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
    if args.input.is_some() {
        config.audio.input_device = args.input;
    }
    if args.output.is_some() {
        config.audio.output_device = args.output;
    }
    config.validate()?;

    tracing::info!("Starting PulseLink Loopback");

    let events = EventBus::new();
    let _printer = events::spawn_printer(events.subscribe(), args.json)?;

    let capture = CaptureConfig::from(&config.audio);
    let playout = PlayoutConfig::from(&config.audio);
    let loopback_events = events.clone();
    let mut loopback = tokio::task::spawn_blocking(move || Loopback::start(capture, playout, loopback_events))
        .await??;

    tracing::info!("Routing - press Ctrl+C to stop");

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut tick = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result?;
                break;
            }
            _ = tick.tick() => {
                if loopback.is_finished() {
                    break;
                }
            }
        }
    }

    let played = tokio::task::spawn_blocking(move || loopback.stop()).await??;
    tracing::info!("Played {} frames", played);
    Ok(())
}
