//! Lockstep acquisition across the grabber bank.
//!
//! Every tick borrows one buffer from each channel, keeps a checked reference to this frame's
//! sub-image in each, averages the channel timestamps and samples the master channel's trigger
//! counter. Until the trigger latches the window slides: once it holds `target_count` frames the
//! oldest is evicted before the next capture. After the trigger the window simply fills up to
//! `target_count` and the capture ends.

use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{debug, info, warn};

use crate::error::{CaptureError, CaptureResult, SessionFailure, Stage};
use crate::hardware::{AcquireConfig, HardwareChannel, MASTER_CHANNEL, NUM_CHANNELS, ScopedBuffer, SubImageRef};
use crate::session::SessionConfig;
use crate::timestamp;
use crate::trigger::TriggerDetector;
use crate::window::{FrameRecord, FrameSlot, FrameWindow};

/// Retention phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetentionState {
    /// Sliding pre-trigger history.
    Filling,
    /// Trigger seen; keep everything until the window is full.
    Retaining,
}

/// How many frames to keep and when a trigger may latch.
#[derive(Debug, Clone, Serialize)]
pub struct RetentionPolicy {
    pub target_count: usize,
    pub pre_trigger_fraction: f64,
    /// Total acquisitions allowed before an untriggered session gives up.
    pub frame_budget: Option<u64>,
}

impl RetentionPolicy {
    pub fn new(num_buffers: usize, buffer_size: usize, pre_trigger_fraction: f64) -> Self {
        Self {
            target_count: num_buffers * buffer_size,
            pre_trigger_fraction,
            frame_budget: None,
        }
    }

    pub fn with_frame_budget(mut self, budget: Option<u64>) -> Self {
        self.frame_budget = budget;
        self
    }

    /// First frame index at which a trigger is allowed to latch.
    pub fn gate_frame(&self) -> u64 {
        let needed = (self.target_count as f64 * self.pre_trigger_fraction).ceil() as u64;
        needed.saturating_sub(1)
    }
}

/// Result of one call to [`Orchestrator::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Captured(FrameRecord),
    Complete,
}

/// Counters reported when acquisition ends.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureSummary {
    pub frames_retained: usize,
    pub acquisitions: u64,
    pub evictions: u64,
    pub triggered_at: Option<u64>,
    pub state: RetentionState,
    pub cancelled: bool,
}

pub struct Orchestrator<C: HardwareChannel> {
    channels: Vec<C>,
    window: FrameWindow,
    detector: TriggerDetector,
    policy: RetentionPolicy,
    acquire: AcquireConfig,
    trigger_counter: String,
    buffer_size: usize,
    max_skew_us: u64,
    state: RetentionState,
    started: bool,
    cancelled: bool,
    frame_index: u64,
    acquisitions: u64,
    evictions: u64,
    cancel: Arc<AtomicBool>,
}

impl<C: HardwareChannel> Orchestrator<C> {
    pub fn new(channels: Vec<C>, config: &SessionConfig, cancel: Arc<AtomicBool>) -> CaptureResult<Self> {
        if channels.len() != NUM_CHANNELS {
            return Err(CaptureError::InvalidConfig(format!(
                "expected {} channels, got {}",
                NUM_CHANNELS,
                channels.len()
            )));
        }
        let reference = channels[MASTER_CHANNEL].geometry();
        for channel in &channels {
            if channel.geometry() != reference {
                return Err(CaptureError::GeometryMismatch(format!(
                    "channel {} reports {:?}, master reports {:?}",
                    channel.id(),
                    channel.geometry(),
                    reference
                )));
            }
        }

        let policy = config.retention_policy();
        Ok(Self {
            channels,
            window: FrameWindow::new(policy.target_count),
            detector: TriggerDetector::new(0),
            policy,
            acquire: config.acquire_config(),
            trigger_counter: config.trigger_counter.clone(),
            buffer_size: config.buffer_size.max(1),
            max_skew_us: config.max_timestamp_skew_us,
            state: RetentionState::Filling,
            started: false,
            cancelled: false,
            frame_index: 0,
            acquisitions: 0,
            evictions: 0,
            cancel,
        })
    }

    /// Start every channel, master last, and read the trigger counter baseline.
    pub fn start(&mut self) -> CaptureResult<()> {
        for channel in self.channels.iter_mut().rev() {
            channel.start()?;
        }
        let baseline = self.channels[MASTER_CHANNEL].read_event_counter(&self.trigger_counter)?;
        self.detector = TriggerDetector::new(baseline);
        self.started = true;

        info!(
            target_count = self.policy.target_count,
            gate_frame = self.policy.gate_frame(),
            baseline,
            "Acquisition started"
        );
        Ok(())
    }

    /// Advance the session by one frame.
    pub fn tick(&mut self) -> Result<TickOutcome, SessionFailure> {
        if !self.started {
            return Err(SessionFailure::new(
                Stage::Setup,
                self.frame_index,
                CaptureError::InvalidConfig("tick before start".to_string()),
            ));
        }

        if self.cancel.load(Ordering::SeqCst) {
            if !self.cancelled {
                info!(frame = self.frame_index, "Capture stopped on request");
            }
            self.cancelled = true;
            return Ok(TickOutcome::Complete);
        }

        if self.state == RetentionState::Retaining && self.window.is_full() {
            return Ok(TickOutcome::Complete);
        }

        if let Some(budget) = self.policy.frame_budget
            && self.acquisitions >= budget
        {
            if self.state == RetentionState::Filling {
                info!(
                    acquisitions = self.acquisitions,
                    retained = self.window.len(),
                    "Frame budget exhausted without a trigger"
                );
            }
            return Ok(TickOutcome::Complete);
        }

        if self.state == RetentionState::Filling && self.window.is_full() {
            let evicted = self
                .window
                .pop_back()
                .map_err(|e| SessionFailure::new(Stage::Retain, self.frame_index, e))?;
            self.evictions += 1;
            debug!(evicted = evicted.record.frame_index, "Slid pre-trigger window");
        }

        let record = self
            .capture_frame()
            .map_err(|e| SessionFailure::new(Stage::Acquire, self.frame_index, e))?;
        Ok(TickOutcome::Captured(record))
    }

    /// Run ticks until the window is complete, the budget runs out or the session is cancelled.
    pub fn capture(&mut self) -> Result<CaptureSummary, SessionFailure> {
        if !self.started {
            self.start()
                .map_err(|e| SessionFailure::new(Stage::Setup, 0, e))?;
        }
        while let TickOutcome::Captured(_) = self.tick()? {}

        let summary = self.summary();
        info!(
            retained = summary.frames_retained,
            acquisitions = summary.acquisitions,
            evictions = summary.evictions,
            triggered_at = ?summary.triggered_at,
            "Acquisition finished"
        );
        Ok(summary)
    }

    fn capture_frame(&mut self) -> CaptureResult<FrameRecord> {
        let frame_index = self.frame_index;
        let part = (frame_index % self.buffer_size as u64) as usize;

        let mut guards = Vec::with_capacity(NUM_CHANNELS);
        for channel in self.channels.iter_mut() {
            guards.push(ScopedBuffer::acquire(channel, &self.acquire)?);
        }

        let mut timestamps = [0u64; NUM_CHANNELS];
        let mut sub_images = [SubImageRef::default(); NUM_CHANNELS];
        for (i, guard) in guards.iter().enumerate() {
            timestamps[i] = guard.timestamp()?;
            sub_images[i] = guard.handle()?.sub_image(part, self.buffer_size)?;
        }

        let timestamp = timestamp::aggregate(&timestamps).unwrap_or_default();
        let skew = timestamp::spread(&timestamps);
        if skew > self.max_skew_us {
            warn!(frame = frame_index, skew_us = skew, "Channel timestamps disagree");
        }

        let count = guards[MASTER_CHANNEL]
            .channel()
            .read_event_counter(&self.trigger_counter)?;
        let triggered = self.detector.observe(
            count,
            frame_index,
            self.policy.target_count,
            self.policy.pre_trigger_fraction,
        );

        for guard in guards {
            guard.release()?;
        }

        let record = FrameRecord {
            frame_index,
            timestamp,
            triggered,
        };
        self.window.push_front(FrameSlot { sub_images, record });

        if triggered && self.state == RetentionState::Filling {
            self.state = RetentionState::Retaining;
            info!(frame = frame_index, retained = self.window.len(), "Retaining until window is full");
        }

        self.frame_index += 1;
        self.acquisitions += 1;

        debug!(frame = frame_index, timestamp = %timestamp::format_timestamp(timestamp), triggered, "Grabbed frame");
        if self.acquisitions % 100 == 0 {
            info!(acquisitions = self.acquisitions, retained = self.window.len(), "Grabbing");
        }

        Ok(record)
    }

    pub fn summary(&self) -> CaptureSummary {
        CaptureSummary {
            frames_retained: self.window.len(),
            acquisitions: self.acquisitions,
            evictions: self.evictions,
            triggered_at: self.detector.triggered_at(),
            state: self.state,
            cancelled: self.cancelled,
        }
    }

    pub fn state(&self) -> RetentionState {
        self.state
    }

    pub fn window(&self) -> &FrameWindow {
        &self.window
    }

    pub fn channels(&self) -> &[C] {
        &self.channels
    }

    /// Window and channels together, for draining.
    pub fn parts_mut(&mut self) -> (&mut FrameWindow, &[C]) {
        (&mut self.window, &self.channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Geometry;
    use crate::hardware::simulated::{SimulatedChannel, SimulationConfig};

    fn geometry() -> Geometry {
        Geometry {
            width: 8,
            height: 4,
            pitch: 8,
            pixel_format: "Mono8".to_string(),
        }
    }

    fn config(num_buffers: usize, fraction: f64) -> SessionConfig {
        SessionConfig {
            num_buffers,
            buffer_size: 1,
            pre_trigger_fraction: fraction,
            retry_base_delay_ms: 0,
            ..Default::default()
        }
    }

    fn orchestrator(
        config: &SessionConfig,
        sim: SimulationConfig,
    ) -> Orchestrator<SimulatedChannel> {
        let (channels, _) = SimulatedChannel::bank(geometry(), sim);
        let mut orch = Orchestrator::new(channels, config, Arc::new(AtomicBool::new(false))).unwrap();
        orch.start().unwrap();
        orch
    }

    #[test]
    fn gate_frame_follows_fraction() {
        assert_eq!(RetentionPolicy::new(10, 1, 0.8).gate_frame(), 7);
        assert_eq!(RetentionPolicy::new(5, 1, 0.8).gate_frame(), 3);
        assert_eq!(RetentionPolicy::new(10, 1, 0.0).gate_frame(), 0);
    }

    #[test]
    fn window_slides_before_trigger() {
        let config = config(5, 0.8);
        let mut orch = orchestrator(
            &config,
            SimulationConfig {
                num_buffers: 5,
                ..Default::default()
            },
        );

        for _ in 0..5 {
            assert!(matches!(orch.tick().unwrap(), TickOutcome::Captured(_)));
        }
        assert_eq!(orch.window().len(), 5);
        assert_eq!(orch.summary().evictions, 0);

        orch.tick().unwrap();
        assert_eq!(orch.summary().evictions, 1);
        assert_eq!(orch.window().len(), 5);
        assert_eq!(orch.window().back().unwrap().record.frame_index, 1);

        for _ in 0..20 {
            orch.tick().unwrap();
            assert!(orch.window().len() <= 5);
        }
        assert_eq!(orch.state(), RetentionState::Filling);
    }

    #[test]
    fn buffers_are_returned_every_tick() {
        let config = config(3, 0.5);
        let mut orch = orchestrator(
            &config,
            SimulationConfig {
                num_buffers: 3,
                ..Default::default()
            },
        );
        for _ in 0..7 {
            orch.tick().unwrap();
            assert!(orch.channels().iter().all(|c| c.outstanding() == 0));
        }
    }

    #[test]
    fn trigger_switches_to_retaining_and_completes() {
        let config = config(10, 0.8);
        let mut orch = orchestrator(
            &config,
            SimulationConfig {
                num_buffers: 10,
                trigger_at: Some(8),
                ..Default::default()
            },
        );
        let summary = orch.capture().unwrap();
        assert_eq!(summary.frames_retained, 10);
        assert_eq!(summary.evictions, 0);
        assert_eq!(summary.triggered_at, Some(8));
        assert_eq!(summary.state, RetentionState::Retaining);

        let flags: Vec<bool> = orch.window().records().map(|r| r.triggered).collect();
        assert_eq!(flags, [vec![false; 8], vec![true; 2]].concat());
    }

    #[test]
    fn untriggered_session_ends_on_budget() {
        let config = SessionConfig {
            frame_budget: Some(12),
            ..config(4, 0.5)
        };
        let mut orch = orchestrator(
            &config,
            SimulationConfig {
                num_buffers: 4,
                ..Default::default()
            },
        );
        let summary = orch.capture().unwrap();
        assert_eq!(summary.acquisitions, 12);
        assert_eq!(summary.frames_retained, 4);
        assert_eq!(summary.evictions, 8);
        assert_eq!(summary.triggered_at, None);
        let indices: Vec<u64> = orch.window().records().map(|r| r.frame_index).collect();
        assert_eq!(indices, vec![8, 9, 10, 11]);
        assert!(orch.window().records().all(|r| !r.triggered));
    }

    #[test]
    fn cancellation_stops_between_ticks() {
        let config = config(4, 0.5);
        let (channels, _) = SimulatedChannel::bank(geometry(), SimulationConfig::default());
        let cancel = Arc::new(AtomicBool::new(false));
        let mut orch = Orchestrator::new(channels, &config, cancel.clone()).unwrap();
        orch.start().unwrap();
        orch.tick().unwrap();
        cancel.store(true, Ordering::SeqCst);
        assert_eq!(orch.tick().unwrap(), TickOutcome::Complete);
        let summary = orch.summary();
        assert!(summary.cancelled);
        assert_eq!(summary.frames_retained, 1);
    }

    #[test]
    fn stalled_channel_fails_with_frame_index() {
        let config = SessionConfig {
            max_acquire_attempts: 2,
            ..config(4, 0.5)
        };
        let mut orch = orchestrator(
            &config,
            SimulationConfig {
                stall_after: Some(3),
                ..Default::default()
            },
        );
        let failure = orch.capture().unwrap_err();
        assert_eq!(failure.stage, Stage::Acquire);
        assert_eq!(failure.frame_index, 3);
        assert!(matches!(
            failure.source,
            CaptureError::AcquisitionTimeout { attempts: 2, .. }
        ));
        // buffers taken from channels that did deliver were handed back
        assert!(orch.channels().iter().all(|c| c.outstanding() == 0));
    }

    #[test]
    fn rejects_wrong_channel_count() {
        let (mut channels, _) = SimulatedChannel::bank(geometry(), SimulationConfig::default());
        channels.pop();
        let result = Orchestrator::new(channels, &config(4, 0.5), Arc::new(AtomicBool::new(false)));
        assert!(matches!(result, Err(CaptureError::InvalidConfig(_))));
    }

    #[test]
    fn tick_before_start_is_a_setup_error() {
        let (channels, _) = SimulatedChannel::bank(geometry(), SimulationConfig::default());
        let mut orch =
            Orchestrator::new(channels, &config(4, 0.5), Arc::new(AtomicBool::new(false))).unwrap();
        assert_eq!(orch.tick().unwrap_err().stage, Stage::Setup);
    }
}
