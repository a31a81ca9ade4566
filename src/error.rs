//! Error types for the capture pipeline.
//!
//! Library code returns [`CaptureError`]; the session driver wraps the first fatal error in a
//! [`SessionFailure`] that names the stage and frame index it happened at. Binaries work in
//! `anyhow::Result` and only ever print the `SessionFailure` diagnostic.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the capture error type.
pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// Pop from an empty window. The lockstep invariant makes this a logic error.
    #[error("pop from an empty frame window")]
    EmptyWindow,

    #[error("channel {channel}: no buffer delivered after {attempts} attempt(s)")]
    AcquisitionTimeout { channel: usize, attempts: u32 },

    #[error("geometry mismatch: {0}")]
    GeometryMismatch(String),

    /// A sub-image reference outlived the hardware slot it points into.
    #[error(
        "channel {channel}: buffer slot {slot} was reused (held generation {expected}, slot is at {found})"
    )]
    StaleBuffer {
        channel: usize,
        slot: usize,
        expected: u64,
        found: u64,
    },

    #[error("channel {channel}: {message}")]
    Hardware { channel: usize, message: String },

    #[error("persistence I/O error: {0}")]
    PersistenceIo(#[from] std::io::Error),

    #[error("CSV log error: {0}")]
    Csv(#[from] csv::Error),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CaptureError {
    pub fn hardware(channel: usize, message: impl Into<String>) -> Self {
        CaptureError::Hardware {
            channel,
            message: message.into(),
        }
    }

    /// Whether the acquisition loop may retry the operation that produced this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CaptureError::AcquisitionTimeout { .. })
    }
}

/// Pipeline stage a fatal error is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Acquire,
    Retain,
    Reconstitute,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Acquire => "acquisition",
            Stage::Retain => "retention",
            Stage::Reconstitute => "reconstitution",
            Stage::Persist => "persistence",
        };
        f.write_str(name)
    }
}

/// The single fatal diagnostic of a failed session.
#[derive(Error, Debug)]
#[error("capture session failed during {stage} at frame {frame_index}: {source}")]
pub struct SessionFailure {
    pub stage: Stage,
    pub frame_index: u64,
    #[source]
    pub source: CaptureError,
}

impl SessionFailure {
    pub fn new(stage: Stage, frame_index: u64, source: CaptureError) -> Self {
        Self {
            stage,
            frame_index,
            source,
        }
    }
}
