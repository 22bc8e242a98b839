//! framecast: broadcast JPEG frames to WebSocket clients.
//!
//! Features:
//! - WebSocket server on a configurable host and port (default localhost:8765)
//! - Frame pump replaying a directory of JPEG files
//! - Configuration via CLI arguments or TOML file

use framecast::frames::{FramePump, JpegDirSource, JpegPassthrough};
use framecast::{Config, Server};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = ?config.workers,
        client_queue = config.client_queue,
        frames_dir = ?config.frames_dir,
        "Starting framecast server"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let frames_dir = config.frames_dir.clone();
    let frame_interval = config.frame_interval;

    let server = Server::new(config);
    let dispatcher = server.dispatcher();
    let (addr, accept_loop) = server.spawn().await?;

    let pump = match frames_dir {
        Some(dir) => {
            let source = JpegDirSource::open(&dir)?;
            Some(FramePump::spawn(
                source,
                JpegPassthrough,
                dispatcher,
                frame_interval,
                tokio::runtime::Handle::current(),
            )?)
        }
        None => {
            info!("No frames directory configured, serving echo only");
            None
        }
    };

    info!(address = %addr, "Running server");

    tokio::select! {
        result = accept_loop => {
            if let Err(e) = result {
                warn!(error = %e, "Accept loop ended");
            }
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, exiting");
        }
    }

    if let Some(pump) = pump {
        let sent = tokio::task::spawn_blocking(move || pump.stop()).await?;
        info!(frames = sent, "Frame pump stopped");
    }

    Ok(())
}
