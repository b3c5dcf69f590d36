//! FrameLink Recorder.
//!
//! Captures a display (Windows) or a generated test pattern, normalizes every
//! frame to a fixed even-sized BGRA surface, and writes the stream to disk.
//!
//! # Architecture
//!
//! ```text
//! capture thread                 blocking task                    tokio main
//! ──────────────                 ─────────────                    ──────────
//! WGC / test pattern  ──▶ pump ──▶ Recorder pull loop ──▶ .bgra     Ctrl-C → StopSignal
//!                                   │                    .json     RecorderStatus log
//!                                   └── status (mpsc) ─────────────▶
//! ```
//!
//! # Usage
//!
//! ```text
//! framelink-recorder [config.json]
//! FRAMELINK_CONFIG=config.json framelink-recorder
//! RUST_LOG=framelink_capture=debug framelink-recorder
//! ```

mod output;
mod recorder;

use std::path::PathBuf;

use anyhow::{Context, Result};
use framelink_core::RecorderConfig;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::recorder::{Recorder, RecorderStatus, StopSignal};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    info!("FrameLink Recorder v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        "Source {:?}, {} fps, {} bps → {}",
        config.source,
        config.frame_rate,
        config.bitrate_bps,
        config.output_path.display()
    );

    let (status_tx, mut status_rx) = mpsc::channel::<RecorderStatus>(32);
    let stop = StopSignal::default();
    let recorder = Recorder::new(config, status_tx);
    let mut task = tokio::task::spawn_blocking({
        let stop = stop.clone();
        move || recorder.run(&stop)
    });

    loop {
        tokio::select! {
            joined = &mut task => {
                if let Some(sidecar) = joined.context("recorder task panicked")?? {
                    info!(
                        "Recorded {} frames ({} ms) at {}, {} session(s)",
                        sidecar.frame_count,
                        sidecar.duration_ms,
                        sidecar.profile.size(),
                        sidecar.sessions
                    );
                }
                break;
            }

            signal = tokio::signal::ctrl_c(), if !stop.is_requested() => {
                signal.context("listen for Ctrl-C")?;
                info!("Ctrl-C received, stopping capture");
                stop.request();
            }

            Some(status) = status_rx.recv() => {
                info!(
                    "Recorder {:?}: {:.1} fps, {} frames written",
                    status.state, status.fps, status.frames_written
                );
            }
        }
    }

    Ok(())
}

/// Config from the first CLI argument, else `FRAMELINK_CONFIG`, else defaults.
fn load_config() -> Result<RecorderConfig> {
    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("FRAMELINK_CONFIG").map(PathBuf::from));

    match path {
        Some(path) => RecorderConfig::from_file(&path)
            .with_context(|| format!("load config {}", path.display())),
        None => {
            info!("No config given, using defaults");
            let config = RecorderConfig::default();
            config.validate()?;
            Ok(config)
        }
    }
}
