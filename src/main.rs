//! Stripe Capture - run one trigger-gated capture session
//!
//! Drives the simulated four-channel grabber bank through a full session: sliding pre-trigger
//! window, trigger latch, retention until the window is full, then reconstitution and storage
//! of every retained frame.
//!
//! # Usage
//!
//! ```bash
//! # Trigger raised by the simulation at acquisition 900
//! stripe-capture --num-buffers 500 --sim-trigger-at 900 --output run1
//!
//! # Interactive: type TRIGGER when ready, QUIT to stop early
//! stripe-capture --interactive --sim-realtime --output run2
//!
//! # Zarr output, give up after 5000 acquisitions without a trigger
//! stripe-capture --format zarr --frame-budget 5000 --output run3
//! ```
//!
//! # Interactive Commands
//!
//! - `TRIGGER` - raise the trigger line
//! - `STATUS` - report capture state
//! - `QUIT` - stop capturing and save what has been retained

use anyhow::Result;
use clap::Parser;
use serde_json::json;
use std::path::Path;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::thread;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use stripe_capture::cli::Args;
use stripe_capture::commands::{CommandTargets, handle_commands};
use stripe_capture::hardware::simulated::SimulatedChannel;
use stripe_capture::session::{SESSION_SNAPSHOT, run_session};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if !args.quiet {
        stripe_capture::display_license_notice("stripe-capture");
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }

    let config = args.session_config();
    config.validate()?;
    std::fs::create_dir_all(&config.output_dir)?;

    let session_id = Uuid::new_v4().to_string();
    let started_at = chrono::Utc::now().to_rfc3339();
    let config_json = args.to_capture_config_json(&session_id, Some(started_at))?;

    let (channels, trigger) = SimulatedChannel::bank(args.sim_geometry(), args.simulation_config());
    let cancel = Arc::new(AtomicBool::new(false));
    let done = Arc::new(AtomicBool::new(false));

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, finishing with the frames captured so far");
                cancel.store(true, Ordering::SeqCst);
            }
        });
    }

    if args.interactive {
        let targets = CommandTargets {
            trigger,
            cancel: cancel.clone(),
            done: done.clone(),
        };
        // stdin blocks until a line arrives, so this thread is not joined
        thread::spawn(move || {
            if let Err(e) = handle_commands(targets) {
                error!("Command handling error: {}", e);
            }
        });
    }

    let session_config = config.clone();
    let session_json = config_json.clone();
    let result = tokio::task::spawn_blocking(move || {
        run_session(channels, &session_config, cancel, &session_json)
    })
    .await?;
    done.store(true, Ordering::SeqCst);

    let outcome = match &result {
        Ok(report) => serde_json::to_value(report)?,
        Err(failure) => json!({ "failure": failure.to_string() }),
    };
    write_snapshot(&config.output_dir, &config_json, outcome)?;

    match result {
        Ok(report) => {
            info!(
                frames = report.drain.frames_written,
                triggered = report.drain.triggered_frames,
                cancelled = report.capture.cancelled,
                output = %config.output_dir.display(),
                "Capture complete"
            );
            Ok(())
        }
        Err(failure) => {
            if args.quiet {
                eprintln!("{}", failure);
            } else {
                error!(stage = %failure.stage, frame = failure.frame_index, "{}", failure);
            }
            std::process::exit(1);
        }
    }
}

fn write_snapshot(dir: &Path, config_json: &str, outcome: serde_json::Value) -> Result<()> {
    let mut snapshot: serde_json::Value = serde_json::from_str(config_json)?;
    snapshot["finished_at"] = json!(chrono::Utc::now().to_rfc3339());
    snapshot["outcome"] = outcome;
    std::fs::write(dir.join(SESSION_SNAPSHOT), serde_json::to_string_pretty(&snapshot)?)?;
    Ok(())
}
