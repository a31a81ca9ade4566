//! Stripe Capture - trigger-gated acquisition from four-channel striped frame grabbers
//!
//! This crate drives four frame grabber channels in lockstep, keeps a bounded history of frames
//! around an external trigger, rebuilds each full sensor image from the four striped sub-images
//! and writes the frames together with a timestamp log.
//!
//! # Overview
//!
//! High-speed cameras with wide sensors are often read out by several grabber channels at once,
//! each delivering a horizontal stripe pattern of the image. The interesting event (the trigger)
//! usually happens at an unpredictable moment, so the capture keeps a sliding pre-trigger window
//! in device memory and only commits once the trigger has been seen.
//!
//! # Key Features
//!
//! - **Lockstep acquisition** of four channels with scoped, always-released hardware buffers
//! - **Sliding pre-trigger window** that switches to straight retention when the trigger latches
//! - **Checked buffer references** that turn reads of recycled hardware slots into errors
//! - **Frame reconstitution** of the folded quadrant interleave
//! - **Raw or Zarr output** with a CSV timestamp log and a JSON session snapshot
//! - **Interactive control** via stdin commands (TRIGGER/STATUS/QUIT)
//!
//! # Command-Line Tools
//!
//! - `stripe-capture` - run one capture session against the simulated grabber bank
//! - `stripe-inspect` - summarize a finished capture directory
//! - `stripe-validate` - check a capture's timestamp log for ordering and trigger consistency
//!
//! # Quick Start
//!
//! ```bash
//! # 100-frame window, trigger raised at acquisition 250
//! stripe-capture --num-buffers 100 --sim-trigger-at 250 --output run1
//!
//! # Trigger by hand
//! stripe-capture --num-buffers 100 --interactive --output run2
//! # Commands: TRIGGER, STATUS, QUIT
//!
//! stripe-inspect run1
//! stripe-validate run1
//! ```
//!
//! # Output Layout
//!
//! ```text
//! run1/
//! ├── frame.000.raw ...     composite frames (raw format)
//! ├── frames.zarr/          composite frames (zarr format)
//! │   └── capture/frames    [N × lines × pitch] uint8
//! ├── timestamps.csv        Image Index,Timestamp(in microseconds),Trigger
//! └── session.json          configuration and outcome
//! ```
//!
//! # Library Usage
//!
//! - [`hardware`] - channel trait, scoped buffers and the simulated channel
//! - [`acquisition`] - the orchestrator and retention policy
//! - [`stitch`] - frame reconstitution
//! - [`persist`] - encoders, log sinks and the drain loop
//! - [`session`] - configuration and the session driver
//! - [`zarr`] - Zarr frame storage
//!
//! # License
//!
//! This project is licensed under the GNU General Public License v3.0.
//! See LICENSE.md for details.

pub mod acquisition;
pub mod cli;
pub mod commands;
pub mod error;
pub mod hardware;
pub mod persist;
pub mod session;
pub mod stitch;
pub mod timestamp;
pub mod trigger;
pub mod window;
pub mod zarr;

pub use error::{CaptureError, CaptureResult, SessionFailure, Stage};

use chrono::Datelike;

/// Display GPL license notice for a program
pub fn display_license_notice(program_name: &str) {
	let version = env!("CARGO_PKG_VERSION");
	let current_year = chrono::Utc::now().year();
	let copyright_year = if current_year == 2025 {
		"2025".to_string()
	} else {
		format!("2025-{}", current_year)
	};

	println!("{} {} Copyright (C) {} the stripe-capture authors", program_name, version, copyright_year);
	println!("This program comes with ABSOLUTELY NO WARRANTY.");
	println!("For details see https://www.gnu.org/licenses/gpl-3.0.html#license-text.");
	println!("This is free software, and you are welcome to redistribute it under certain conditions.");
	println!();
}
