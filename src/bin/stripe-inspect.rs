//! Stripe Inspect - capture directory summary
//!
//! This tool summarizes a directory written by stripe-capture: how many frames were stored,
//! where the trigger latched, the timestamp span and mean frame period, and the configuration
//! the session ran with.
//!
//! # Usage
//!
//! ```bash
//! # Inspect default directory (capture)
//! stripe-inspect
//!
//! # Inspect a specific capture with its full configuration
//! stripe-inspect run1 --verbose
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use zarrs::array::Array;
use zarrs::filesystem::FilesystemStore;

use stripe_capture::persist::read_log;
use stripe_capture::session::{SESSION_SNAPSHOT, TIMESTAMP_LOG, ZARR_STORE};
use stripe_capture::timestamp::format_timestamp;
use stripe_capture::zarr::{CAPTURE_GROUP, FRAMES_ARRAY, read_group_attributes};

#[derive(Parser)]
#[command(name = "stripe-inspect")]
#[command(about = "Inspect capture directories created by stripe-capture")]
#[command(version)]
struct Args {
    /// Capture directory to inspect
    #[arg(default_value = "capture")]
    dir: PathBuf,

    /// Print the full session snapshot
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    stripe_capture::display_license_notice("stripe-inspect");

    println!("Capture: {}", args.dir.display());
    println!();

    let log_path = args.dir.join(TIMESTAMP_LOG);
    let rows = read_log(&log_path).with_context(|| format!("Failed to read {}", log_path.display()))?;

    println!("FRAMES");
    println!("  ├─ Count: {}", rows.len());
    match rows.iter().find(|r| r.triggered) {
        Some(first) => {
            let triggered = rows.iter().filter(|r| r.triggered).count();
            println!(
                "  ├─ Trigger: first at frame {} ({} of {} frames after it)",
                first.image_index,
                triggered,
                rows.len()
            );
        }
        None => println!("  ├─ Trigger: never latched"),
    }
    if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
        let span = last.timestamp.saturating_sub(first.timestamp);
        println!(
            "  ├─ Time: {} .. {} ({} us)",
            format_timestamp(first.timestamp),
            format_timestamp(last.timestamp),
            span
        );
        if rows.len() > 1 {
            let period = span as f64 / (rows.len() - 1) as f64;
            println!("  └─ Mean period: {:.1} us ({:.1} fps)", period, 1e6 / period.max(f64::MIN_POSITIVE));
        } else {
            println!("  └─ Mean period: n/a");
        }
    }
    println!();

    let zarr_path = args.dir.join(ZARR_STORE);
    if zarr_path.is_dir() {
        let store = Arc::new(FilesystemStore::new(&zarr_path)?);
        println!("ZARR");
        match Array::<FilesystemStore>::open(store.clone(), FRAMES_ARRAY) {
            Ok(array) => println!("  ├─ frames: {:?}", array.shape()),
            Err(e) => println!("  ├─ WARNING: could not open {}: {}", FRAMES_ARRAY, e),
        }
        let attrs = read_group_attributes(&store, CAPTURE_GROUP)?;
        if let Some(geometry) = attrs.get("geometry") {
            println!("  └─ geometry: {}", geometry);
        }
        println!();
    }

    let snapshot_path = args.dir.join(SESSION_SNAPSHOT);
    if snapshot_path.is_file() {
        let snapshot: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&snapshot_path)?)?;
        println!("SESSION");
        for key in ["session_id", "host", "started_at", "finished_at"] {
            if let Some(value) = snapshot.get(key).and_then(|v| v.as_str()) {
                println!("  ├─ {}: {}", key, value);
            }
        }
        if let Some(session) = snapshot.get("session") {
            println!(
                "  ├─ window: {} x {} buffers, pre-trigger fraction {}",
                session["num_buffers"], session["buffer_size"], session["pre_trigger_fraction"]
            );
        }
        match snapshot.get("outcome").and_then(|o| o.get("failure")) {
            Some(failure) => println!("  └─ outcome: FAILED {}", failure),
            None => println!("  └─ outcome: ok"),
        }
        if args.verbose {
            println!();
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
    }

    Ok(())
}
