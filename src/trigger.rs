//! Trigger latch driven by a hardware event counter.
//!
//! The detector compares the master channel's event counter against the value it had when the
//! session started. An increase only counts once enough pre-trigger history has been captured;
//! after that the latch holds for the rest of the session.

use tracing::info;

#[derive(Debug, Clone)]
pub struct TriggerDetector {
    baseline: u64,
    triggered: bool,
    triggered_at: Option<u64>,
}

impl TriggerDetector {
    /// Create a detector with the counter value read at session start.
    pub fn new(baseline: u64) -> Self {
        Self {
            baseline,
            triggered: false,
            triggered_at: None,
        }
    }

    /// Feed one counter reading taken while capturing frame `frames_so_far`.
    ///
    /// Latches on the first reading that is above the baseline while
    /// `frames_so_far + 1 >= window_target * pre_trigger_fraction`.
    pub fn observe(
        &mut self,
        current_count: u64,
        frames_so_far: u64,
        window_target: usize,
        pre_trigger_fraction: f64,
    ) -> bool {
        if self.triggered {
            return true;
        }

        let gate_open = (frames_so_far + 1) as f64 >= window_target as f64 * pre_trigger_fraction;
        if current_count > self.baseline && gate_open {
            self.triggered = true;
            self.triggered_at = Some(frames_so_far);
            info!(
                frame = frames_so_far,
                counter = current_count,
                baseline = self.baseline,
                "Trigger latched"
            );
        }

        self.triggered
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Frame index the latch fired on.
    pub fn triggered_at(&self) -> Option<u64> {
        self.triggered_at
    }
}
