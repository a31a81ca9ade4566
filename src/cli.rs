use clap::{Parser, ValueEnum};
use serde_json::json;
use std::path::PathBuf;

use crate::hardware::Geometry;
use crate::hardware::simulated::{DEFAULT_TRIGGER_COUNTER, Pattern, SimulationConfig};
use crate::session::{OutputFormat, SessionConfig};
use crate::stitch::DEFAULT_LINE_HEIGHT;

/// Content of the simulated sub-images.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SimPattern {
    /// Channel id fill with the acquisition number in the first bytes
    Stamped,
    /// Brightness ramp down the composite image
    Gradient,
    /// Mid-grey
    Flat,
}

impl From<SimPattern> for Pattern {
    fn from(p: SimPattern) -> Self {
        match p {
            SimPattern::Stamped => Pattern::Stamped,
            SimPattern::Gradient => Pattern::Gradient,
            SimPattern::Flat => Pattern::Constant(128),
        }
    }
}

#[derive(Parser, Clone)]
#[command(name = "stripe-capture")]
#[command(about = "Trigger-gated capture from a four-channel striped frame grabber bank")]
pub struct Args {
    #[arg(long, short = 'o', help = "Output directory for frames and logs", default_value = "capture")]
    pub output: PathBuf,

    #[arg(long, default_value = "500", help = "Hardware buffers per channel")]
    pub num_buffers: usize,

    #[arg(long, default_value = "1", help = "Sub-images per hardware buffer")]
    pub buffer_size: usize,

    #[arg(
        long,
        default_value = "0.8",
        help = "Share of the window that must be captured before a trigger is accepted"
    )]
    pub pre_trigger_fraction: f64,

    #[arg(long, default_value_t = DEFAULT_LINE_HEIGHT, help = "Lines per interleaved stripe")]
    pub line_height: usize,

    #[arg(long, help = "Give up after this many acquisitions if no trigger arrives")]
    pub frame_budget: Option<u64>,

    #[arg(long, default_value = "1000", help = "Buffer wait timeout in milliseconds")]
    pub acquire_timeout_ms: u64,

    #[arg(long, default_value = "3", help = "Attempts per buffer before the session fails")]
    pub max_acquire_attempts: u32,

    #[arg(long, default_value = "50", help = "Base delay in milliseconds between buffer retries")]
    pub retry_base_delay_ms: u64,

    #[arg(long, default_value = DEFAULT_TRIGGER_COUNTER, help = "Event counter sampled for the trigger")]
    pub trigger_counter: String,

    #[arg(long, default_value = "50", help = "Warn when channel timestamps spread wider (microseconds)")]
    pub max_timestamp_skew_us: u64,

    #[arg(
        long,
        default_value = "frame.NNN.raw",
        help = "Frame file name; a run of N is replaced by the frame index"
    )]
    pub output_template: String,

    #[arg(long, value_enum, default_value_t = OutputFormat::Raw, help = "Frame storage format")]
    pub format: OutputFormat,

    #[arg(long, short = 'i', help = "Interactive mode - accept commands via stdin")]
    pub interactive: bool,

    #[arg(long, short = 'q', help = "Minimal output mode")]
    pub quiet: bool,

    #[arg(long, help = "Notes for the session snapshot")]
    pub notes: Option<String>,

    #[arg(long, default_value = "640", help = "Simulated sub-image width in pixels")]
    pub sim_width: usize,

    #[arg(long, default_value = "120", help = "Simulated sub-image height in lines")]
    pub sim_height: usize,

    #[arg(long, value_enum, default_value_t = SimPattern::Stamped, help = "Simulated image content")]
    pub sim_pattern: SimPattern,

    #[arg(long, default_value = "1000", help = "Simulated frame period in microseconds")]
    pub sim_period_us: u64,

    #[arg(long, default_value = "0", help = "Simulated per-channel timestamp lag in microseconds")]
    pub sim_jitter_us: u64,

    #[arg(long, help = "Raise the simulated trigger line at this acquisition")]
    pub sim_trigger_at: Option<u64>,

    #[arg(long, help = "Pace the simulation at the frame period")]
    pub sim_realtime: bool,
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            num_buffers: self.num_buffers,
            buffer_size: self.buffer_size,
            pre_trigger_fraction: self.pre_trigger_fraction,
            line_height: self.line_height,
            frame_budget: self.frame_budget,
            acquire_timeout_ms: self.acquire_timeout_ms,
            max_acquire_attempts: self.max_acquire_attempts,
            retry_base_delay_ms: self.retry_base_delay_ms,
            trigger_counter: self.trigger_counter.clone(),
            max_timestamp_skew_us: self.max_timestamp_skew_us,
            output_dir: self.output.clone(),
            output_template: self.output_template.clone(),
            format: self.format,
        }
    }

    /// Geometry of one simulated sub-image (8-bit mono).
    pub fn sim_geometry(&self) -> Geometry {
        Geometry {
            width: self.sim_width,
            height: self.sim_height,
            pitch: self.sim_width,
            pixel_format: "Mono8".to_string(),
        }
    }

    /// The simulated ring holds one buffer more than the window. Evicting one part of a multi-part
    /// buffer leaves its other parts retained, so the next buffer must not land on top of them.
    pub fn simulation_config(&self) -> SimulationConfig {
        SimulationConfig {
            num_buffers: self.num_buffers + 1,
            parts_per_buffer: self.buffer_size,
            pattern: self.sim_pattern.into(),
            period_us: self.sim_period_us,
            jitter_us: self.sim_jitter_us,
            trigger_at: self.sim_trigger_at,
            realtime: self.sim_realtime,
            counter_name: self.trigger_counter.clone(),
            ..Default::default()
        }
    }

    /// Serialize capture configuration to JSON string
    pub fn to_capture_config_json(&self, session_id: &str, started_at: Option<String>) -> anyhow::Result<String> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_default();

        let config_json = json!({
            "session_id": session_id,
            "host": host,
            "started_at": started_at,
            "session": self.session_config(),
            "notes": self.notes,
            "interactive": self.interactive,
            "simulation": {
                "width": self.sim_width,
                "height": self.sim_height,
                "pattern": format!("{:?}", self.sim_pattern),
                "period_us": self.sim_period_us,
                "jitter_us": self.sim_jitter_us,
                "trigger_at": self.sim_trigger_at,
                "realtime": self.sim_realtime,
            },
            "capture_version": env!("CARGO_PKG_VERSION")
        });

        Ok(serde_json::to_string_pretty(&config_json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_session_defaults() {
        let args = Args::parse_from(["stripe-capture"]);
        let config = args.session_config();
        let defaults = SessionConfig::default();
        assert_eq!(config.num_buffers, defaults.num_buffers);
        assert_eq!(config.pre_trigger_fraction, defaults.pre_trigger_fraction);
        assert_eq!(config.trigger_counter, defaults.trigger_counter);
        assert_eq!(config.output_template, defaults.output_template);
        assert_eq!(config.format, OutputFormat::Raw);
    }

    #[test]
    fn simulation_ring_has_a_spare_buffer() {
        let args = Args::parse_from(["stripe-capture", "--num-buffers", "20", "--buffer-size", "3"]);
        let sim = args.simulation_config();
        assert_eq!(sim.parts_per_buffer, 3);
        assert_eq!(
            sim.num_buffers * sim.parts_per_buffer,
            args.session_config().target_count() + sim.parts_per_buffer
        );
    }

    #[test]
    fn config_json_embeds_session() -> anyhow::Result<()> {
        let args = Args::parse_from(["stripe-capture", "--format", "zarr", "--notes", "bench"]);
        let json: serde_json::Value = serde_json::from_str(&args.to_capture_config_json("abc", None)?)?;
        assert_eq!(json["session_id"], "abc");
        assert_eq!(json["session"]["format"], "zarr");
        assert_eq!(json["notes"], "bench");
        Ok(())
    }
}
