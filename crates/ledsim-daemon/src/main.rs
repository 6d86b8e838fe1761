//! Ledsim Daemon - Main entry point
//!
//! Runs one simulated LED device per process: loads the topology, starts the
//! UDP protocol server, announces the device over mDNS, and drives a
//! headless preview consumer until interrupted.

mod preview;

use anyhow::Result;
use clap::Parser;
use ledsim_core::{config, DeviceRuntime};
use ledsim_server::{Announcer, DeviceServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "ledsim")]
#[command(about = "Virtual multi-output LED device for protocol testing")]
#[command(version)]
struct Args {
    /// Path to device config JSON; when omitted, uses the built-in matrix
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Print the effective config as JSON and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("ledsim v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(args.config.as_deref())?;

    if args.print_config {
        println!("{}", config.to_json_pretty());
        return Ok(());
    }

    let runtime = Arc::new(DeviceRuntime::new(&config)?);
    info!(
        name = runtime.name(),
        serial = runtime.serial(),
        port = runtime.udp_port(),
        outputs = runtime.outputs().len(),
        leds = runtime.total_leds(),
        "Device runtime built"
    );

    let mut server = DeviceServer::new(runtime.clone(), &config);
    server.start().await?;

    let mut announcer = Announcer::register(&runtime);

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let preview = tokio::spawn(preview::run(runtime.clone(), stop_rx));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let _ = stop_tx.send(true);
    let _ = preview.await;
    server.stop().await;
    announcer.shutdown();

    Ok(())
}
