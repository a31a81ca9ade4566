//! One capture session from start to disk.
//!
//! A session validates its configuration, opens the output sinks, runs the orchestrator until the
//! window is complete and drains it through the persistence writer. The first fatal error ends
//! the session as a [`SessionFailure`].

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, atomic::AtomicBool};
use std::time::Duration;
use tracing::{info, info_span};

use crate::acquisition::{CaptureSummary, Orchestrator, RetentionPolicy};
use crate::error::{CaptureError, CaptureResult, SessionFailure, Stage};
use crate::hardware::simulated::DEFAULT_TRIGGER_COUNTER;
use crate::hardware::{AcquireConfig, HardwareChannel, MASTER_CHANNEL};
use crate::persist::{CsvLogSink, DrainSummary, FrameEncoder, LogSink, PersistenceWriter, RawFileEncoder};
use crate::stitch::{CompositeGeometry, DEFAULT_LINE_HEIGHT, Reconstitutor};
use crate::zarr::ZarrFrameWriter;

/// Timestamp log written next to the frames.
pub const TIMESTAMP_LOG: &str = "timestamps.csv";
/// Configuration and outcome snapshot of a session.
pub const SESSION_SNAPSHOT: &str = "session.json";
/// Zarr store name used by [`OutputFormat::Zarr`].
pub const ZARR_STORE: &str = "frames.zarr";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// One raw file per frame, named from the output template.
    Raw,
    /// All frames in one chunked Zarr array.
    Zarr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Hardware buffers per channel.
    pub num_buffers: usize,
    /// Sub-images per hardware buffer.
    pub buffer_size: usize,
    pub pre_trigger_fraction: f64,
    pub line_height: usize,
    /// Total acquisitions after which an untriggered session stops. `None` waits for a trigger.
    pub frame_budget: Option<u64>,
    pub acquire_timeout_ms: u64,
    pub max_acquire_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub trigger_counter: String,
    pub max_timestamp_skew_us: u64,
    pub output_dir: PathBuf,
    pub output_template: String,
    pub format: OutputFormat,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            num_buffers: 500,
            buffer_size: 1,
            pre_trigger_fraction: 0.8,
            line_height: DEFAULT_LINE_HEIGHT,
            frame_budget: None,
            acquire_timeout_ms: 1000,
            max_acquire_attempts: 3,
            retry_base_delay_ms: 50,
            trigger_counter: DEFAULT_TRIGGER_COUNTER.to_string(),
            max_timestamp_skew_us: 50,
            output_dir: PathBuf::from("capture"),
            output_template: "frame.NNN.raw".to_string(),
            format: OutputFormat::Raw,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> CaptureResult<()> {
        if !(0.0..=1.0).contains(&self.pre_trigger_fraction) {
            return Err(CaptureError::InvalidConfig(format!(
                "pre-trigger fraction {} is outside [0, 1]",
                self.pre_trigger_fraction
            )));
        }
        if self.num_buffers == 0 || self.buffer_size == 0 {
            return Err(CaptureError::InvalidConfig(
                "num_buffers and buffer_size must both be at least 1".to_string(),
            ));
        }
        if self.line_height == 0 {
            return Err(CaptureError::InvalidConfig("line_height must be at least 1".to_string()));
        }
        if self.trigger_counter.is_empty() {
            return Err(CaptureError::InvalidConfig("trigger counter name is empty".to_string()));
        }
        Ok(())
    }

    /// Frames retained by a completed session.
    pub fn target_count(&self) -> usize {
        self.num_buffers * self.buffer_size
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::new(self.num_buffers, self.buffer_size, self.pre_trigger_fraction)
            .with_frame_budget(self.frame_budget)
    }

    pub fn acquire_config(&self) -> AcquireConfig {
        AcquireConfig {
            timeout: Duration::from_millis(self.acquire_timeout_ms),
            max_attempts: self.max_acquire_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
        }
    }
}

/// Outcome of a successful session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub capture: CaptureSummary,
    pub drain: DrainSummary,
    pub geometry: CompositeGeometry,
}

/// Run a session writing to `config.output_dir` with the encoder selected by `config.format`.
///
/// Sinks are opened before the first acquisition so an unwritable destination fails before the
/// trigger does.
pub fn run_session<C: HardwareChannel>(
    channels: Vec<C>,
    config: &SessionConfig,
    cancel: Arc<AtomicBool>,
    capture_config_json: &str,
) -> Result<SessionReport, SessionFailure> {
    let setup = |e: CaptureError| SessionFailure::new(Stage::Setup, 0, e);

    config.validate().map_err(setup)?;
    std::fs::create_dir_all(&config.output_dir)
        .map_err(|e| setup(e.into()))?;

    let master = channels.get(MASTER_CHANNEL).ok_or_else(|| {
        setup(CaptureError::InvalidConfig("no channels to capture from".to_string()))
    })?;
    let composite = CompositeGeometry::from_sub_image(&master.geometry());

    // the encoder refuses a used store, so it opens before the log truncates anything
    let encoder: Box<dyn FrameEncoder> = match config.format {
        OutputFormat::Raw => Box::new(RawFileEncoder::new(&config.output_dir).map_err(setup)?),
        OutputFormat::Zarr => Box::new(
            ZarrFrameWriter::create(&config.output_dir.join(ZARR_STORE), composite, capture_config_json)
                .map_err(|e| setup(CaptureError::Encoder(format!("{:#}", e))))?,
        ),
    };
    let log = CsvLogSink::open(config.output_dir.join(TIMESTAMP_LOG)).map_err(setup)?;

    run_session_with(channels, config, cancel, encoder, log)
}

/// Run a session against caller-provided sinks.
pub fn run_session_with<C, E, L>(
    channels: Vec<C>,
    config: &SessionConfig,
    cancel: Arc<AtomicBool>,
    encoder: E,
    log: L,
) -> Result<SessionReport, SessionFailure>
where
    C: HardwareChannel,
    E: FrameEncoder,
    L: LogSink,
{
    let setup = |e: CaptureError| SessionFailure::new(Stage::Setup, 0, e);
    config.validate().map_err(setup)?;

    let mut orchestrator = Orchestrator::new(channels, config, cancel).map_err(setup)?;
    let sub = orchestrator.channels()[MASTER_CHANNEL].geometry();
    let reconstitutor = Reconstitutor::new(sub, config.line_height).map_err(setup)?;
    let mut writer = PersistenceWriter::new(encoder, log, config.output_template.clone(), reconstitutor);
    let geometry = writer.composite_geometry().clone();

    info!(
        target_count = config.target_count(),
        pre_trigger_fraction = config.pre_trigger_fraction,
        width = geometry.width,
        height = geometry.height,
        "Starting capture session"
    );

    let capture = {
        let _span = info_span!("capture").entered();
        orchestrator.capture()?
    };

    let drain = {
        let _span = info_span!("persist").entered();
        let (window, channels) = orchestrator.parts_mut();
        writer.drain(window, channels)?
    };

    Ok(SessionReport {
        capture,
        drain,
        geometry,
    })
}
