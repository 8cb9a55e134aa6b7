//! overflowd - overflow monitor daemon
//!
//! This daemon:
//! 1. Loads configuration (file named by OVERFLOW_CONFIG, then OVERFLOW_* env)
//! 2. Serves the local HTTP API (reports, detection log, GPS, stream control)
//! 3. Runs the report scheduler, which emits reports while a stream is active
//! 4. Optionally starts the configured stream at boot

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};

use overflow_monitor::{
    api::{ApiConfig, ApiServer},
    stream::{StartOutcome, StreamController},
    DetectorBackend, MonitorConfig, MonitorContext, ReportScheduler, StubBackend,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Garbage overflow detection monitor")]
struct Args {
    /// Path to a JSON or TOML config file.
    #[arg(long, env = "OVERFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Start streaming immediately instead of waiting for POST /stream/start.
    #[arg(long, env = "OVERFLOW_AUTOSTART")]
    autostart: bool,

    /// Override the stream source locator.
    #[arg(long)]
    source: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut config = MonitorConfig::load_from(args.config.as_deref())?;
    if let Some(source) = args.source {
        config.stream.source = source;
    }
    log::info!("overflowd {} starting", env!("CARGO_PKG_VERSION"));
    log::info!(
        "log capacity {}, window {:?}, report every {:?}, sampling every {} frames",
        config.log_capacity,
        config.report.window,
        config.report.interval,
        config.stream.sample_every
    );
    log::debug!("sink settings: {:?}", config.sink);

    let ctx = MonitorContext::from_config(&config)?;
    let streams = Arc::new(StreamController::new(
        ctx.clone(),
        config.stream.clone(),
        Box::new(|| Box::new(StubBackend::new()) as Box<dyn DetectorBackend>),
    ));

    let scheduler = ReportScheduler::new(ctx.clone(), config.report.interval).spawn()?;

    let api_config = ApiConfig {
        addr: config.api_addr.clone(),
    };
    let api_handle = ApiServer::new(api_config, ctx.clone(), streams.clone()).spawn()?;
    log::info!("overflow api listening on {}", api_handle.addr);

    if args.autostart || config.autostart {
        match streams.start(None, None)? {
            StartOutcome::Started { source } => log::info!("autostarted stream {}", source),
            StartOutcome::AlreadyActive => log::warn!("autostart skipped: stream already active"),
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!("overflowd waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");
    ctx.request_shutdown();

    if let Some(summary) = streams.shutdown() {
        log::info!(
            "final stream: {} frames, {} events logged",
            summary.frames_processed,
            summary.recorder.appended
        );
    }
    let reports = scheduler.join()?;
    api_handle.stop()?;
    log::info!("overflowd stopped ({} reports emitted)", reports);
    Ok(())
}
