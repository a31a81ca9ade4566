//! Software frame grabber channel.
//!
//! Behaves like one channel of a striped grabber bank: a ring of `num_buffers` slots, each
//! holding `parts_per_buffer` sub-images that are delivered one per acquisition. Refilling a
//! slot bumps its generation, so stale [`SubImageRef`]s are caught. The master channel can raise
//! the shared event counter at a chosen acquisition to stand in for the external trigger line.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::thread;
use std::time::Duration;
use tracing::debug;

use super::{ChannelBufferHandle, Geometry, HardwareChannel, MASTER_CHANNEL, NUM_CHANNELS, SubImageRef};
use crate::error::{CaptureError, CaptureResult};

/// Default name of the trigger line event counter.
pub const DEFAULT_TRIGGER_COUNTER: &str = "EventCount[LIN8]";

/// Event counter shared by every channel of a simulated bank.
#[derive(Debug, Clone, Default)]
pub struct EventCounter(Arc<AtomicU64>);

impl EventCounter {
    /// Register one trigger edge. Returns the new count.
    pub fn fire(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Pixel content written into each delivered sub-image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    /// Every byte set to the same value.
    Constant(u8),
    /// Filled with the channel id, with the acquisition sequence number (u64, little endian)
    /// in the first eight bytes.
    Stamped,
    /// Brightness ramps with line number across the four channels.
    Gradient,
}

#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub num_buffers: usize,
    pub parts_per_buffer: usize,
    pub pattern: Pattern,
    pub start_timestamp_us: u64,
    pub period_us: u64,
    /// Channel `n` lags the master by `n * jitter_us`.
    pub jitter_us: u64,
    /// Master acquisition at which the trigger counter is raised.
    pub trigger_at: Option<u64>,
    /// Stop delivering buffers after this many acquisitions.
    pub stall_after: Option<u64>,
    /// Number of timeouts to report before the first delivery.
    pub transient_timeouts: u32,
    /// Sleep one frame period per acquisition.
    pub realtime: bool,
    pub counter_name: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            num_buffers: 4,
            parts_per_buffer: 1,
            pattern: Pattern::Stamped,
            start_timestamp_us: 1_000_000,
            period_us: 1_000,
            jitter_us: 0,
            trigger_at: None,
            stall_after: None,
            transient_timeouts: 0,
            realtime: false,
            counter_name: DEFAULT_TRIGGER_COUNTER.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct SimulatedChannel {
    id: usize,
    geometry: Geometry,
    config: SimulationConfig,
    counter: EventCounter,
    started: bool,
    slots: Vec<Vec<u8>>,
    generations: Vec<u64>,
    held: Vec<bool>,
    sequence: u64,
    pending_timeouts: u32,
}

impl SimulatedChannel {
    pub fn new(id: usize, geometry: Geometry, config: SimulationConfig, counter: EventCounter) -> Self {
        let num_buffers = config.num_buffers.max(1);
        let buffer_len = geometry.sub_image_len() * config.parts_per_buffer.max(1);
        Self {
            id,
            geometry,
            pending_timeouts: config.transient_timeouts,
            config,
            counter,
            started: false,
            slots: vec![vec![0u8; buffer_len]; num_buffers],
            generations: vec![0; num_buffers],
            held: vec![false; num_buffers],
            sequence: 0,
        }
    }

    /// Four channels sharing one event counter.
    pub fn bank(geometry: Geometry, config: SimulationConfig) -> (Vec<SimulatedChannel>, EventCounter) {
        let counter = EventCounter::default();
        let channels = (0..NUM_CHANNELS)
            .map(|id| SimulatedChannel::new(id, geometry.clone(), config.clone(), counter.clone()))
            .collect();
        (channels, counter)
    }

    /// Buffers currently borrowed and not yet released.
    pub fn outstanding(&self) -> usize {
        self.held.iter().filter(|&&h| h).count()
    }

    fn timeout(&self) -> CaptureError {
        CaptureError::AcquisitionTimeout {
            channel: self.id,
            attempts: 1,
        }
    }

    fn fill(&mut self, slot: usize, part: usize) {
        let part_len = self.geometry.sub_image_len();
        let pitch = self.geometry.pitch.max(1);
        let height = self.geometry.height.max(1);
        let id = self.id;
        let sequence = self.sequence;
        let region = &mut self.slots[slot][part * part_len..(part + 1) * part_len];

        match self.config.pattern {
            Pattern::Constant(value) => region.fill(value),
            Pattern::Stamped => {
                region.fill(id as u8);
                let stamp = sequence.to_le_bytes();
                let n = stamp.len().min(region.len());
                region[..n].copy_from_slice(&stamp[..n]);
            }
            Pattern::Gradient => {
                let total_lines = height * NUM_CHANNELS;
                for (line, row) in region.chunks_mut(pitch).enumerate() {
                    let value = ((id * height + line) * 255 / total_lines) as u8;
                    row.fill(value);
                }
            }
        }
    }
}

impl HardwareChannel for SimulatedChannel {
    fn id(&self) -> usize {
        self.id
    }

    fn start(&mut self) -> CaptureResult<()> {
        self.started = true;
        debug!(channel = self.id, "Simulated channel started");
        Ok(())
    }

    fn acquire_buffer(&mut self, timeout: Duration) -> CaptureResult<ChannelBufferHandle> {
        if !self.started {
            return Err(CaptureError::hardware(self.id, "acquisition before start"));
        }
        if self.pending_timeouts > 0 {
            self.pending_timeouts -= 1;
            return Err(self.timeout());
        }
        if let Some(limit) = self.config.stall_after
            && self.sequence >= limit
        {
            return Err(self.timeout());
        }

        let parts = self.config.parts_per_buffer.max(1) as u64;
        let slot = ((self.sequence / parts) % self.slots.len() as u64) as usize;
        let part = (self.sequence % parts) as usize;

        // a slot still borrowed from a previous tick means the pool is exhausted
        if self.held[slot] {
            return Err(self.timeout());
        }

        if self.config.realtime {
            thread::sleep(Duration::from_micros(self.config.period_us).min(timeout));
        }

        if part == 0 {
            self.generations[slot] += 1;
        }
        self.fill(slot, part);
        self.held[slot] = true;

        if self.id == MASTER_CHANNEL && self.config.trigger_at == Some(self.sequence) {
            let count = self.counter.fire();
            debug!(sequence = self.sequence, count, "Simulated trigger edge");
        }

        let timestamp = self.config.start_timestamp_us
            + self.sequence * self.config.period_us
            + self.id as u64 * self.config.jitter_us;
        self.sequence += 1;

        Ok(ChannelBufferHandle::new(
            self.id,
            slot,
            self.generations[slot],
            self.slots[slot].len(),
            timestamp,
        ))
    }

    fn release(&mut self, handle: ChannelBufferHandle) -> CaptureResult<()> {
        let slot = handle.slot();
        if handle.channel() != self.id || slot >= self.held.len() {
            return Err(CaptureError::hardware(
                self.id,
                format!("foreign buffer (channel {}, slot {})", handle.channel(), slot),
            ));
        }
        if !self.held[slot] {
            return Err(CaptureError::hardware(self.id, format!("slot {} released twice", slot)));
        }
        self.held[slot] = false;
        Ok(())
    }

    fn read_event_counter(&self, name: &str) -> CaptureResult<u64> {
        if name != self.config.counter_name {
            return Err(CaptureError::hardware(self.id, format!("unknown event counter '{}'", name)));
        }
        Ok(self.counter.value())
    }

    fn geometry(&self) -> Geometry {
        self.geometry.clone()
    }

    fn sub_image(&self, view: &SubImageRef) -> CaptureResult<&[u8]> {
        if view.channel != self.id || view.slot >= self.slots.len() {
            return Err(CaptureError::hardware(
                self.id,
                format!("reference to channel {} slot {} does not belong here", view.channel, view.slot),
            ));
        }
        let found = self.generations[view.slot];
        if found != view.generation {
            return Err(CaptureError::StaleBuffer {
                channel: self.id,
                slot: view.slot,
                expected: view.generation,
                found,
            });
        }
        let buffer = &self.slots[view.slot];
        buffer.get(view.offset..view.offset + view.len).ok_or_else(|| {
            CaptureError::GeometryMismatch(format!(
                "sub-image {}..{} exceeds {} byte buffer",
                view.offset,
                view.offset + view.len,
                buffer.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry {
            width: 16,
            height: 8,
            pitch: 16,
            pixel_format: "Mono8".to_string(),
        }
    }

    fn started(config: SimulationConfig) -> SimulatedChannel {
        let mut ch = SimulatedChannel::new(0, geometry(), config, EventCounter::default());
        ch.start().unwrap();
        ch
    }

    #[test]
    fn refuses_acquisition_before_start() {
        let mut ch = SimulatedChannel::new(1, geometry(), SimulationConfig::default(), EventCounter::default());
        assert!(ch.acquire_buffer(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn stamps_sequence_number() {
        let mut ch = started(SimulationConfig::default());
        for expected in 0..3u64 {
            let handle = ch.acquire_buffer(Duration::from_millis(1)).unwrap();
            let view = handle.sub_image(0, 1).unwrap();
            let data = ch.sub_image(&view).unwrap();
            assert_eq!(u64::from_le_bytes(data[..8].try_into().unwrap()), expected);
            ch.release(handle).unwrap();
        }
    }

    #[test]
    fn reused_slot_invalidates_old_reference() {
        let mut ch = started(SimulationConfig {
            num_buffers: 2,
            ..Default::default()
        });
        let first = ch.acquire_buffer(Duration::from_millis(1)).unwrap();
        let view = first.sub_image(0, 1).unwrap();
        ch.release(first).unwrap();
        for _ in 0..2 {
            let h = ch.acquire_buffer(Duration::from_millis(1)).unwrap();
            ch.release(h).unwrap();
        }
        match ch.sub_image(&view) {
            Err(CaptureError::StaleBuffer { slot, expected, found, .. }) => {
                assert_eq!(slot, 0);
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected stale buffer, got {:?}", other),
        }
    }

    #[test]
    fn parts_share_a_slot_generation() {
        let mut ch = started(SimulationConfig {
            num_buffers: 2,
            parts_per_buffer: 2,
            ..Default::default()
        });
        let a = ch.acquire_buffer(Duration::from_millis(1)).unwrap();
        let va = a.sub_image(0, 2).unwrap();
        ch.release(a).unwrap();
        let b = ch.acquire_buffer(Duration::from_millis(1)).unwrap();
        let vb = b.sub_image(1, 2).unwrap();
        ch.release(b).unwrap();

        assert_eq!(va.slot, vb.slot);
        assert!(ch.sub_image(&va).is_ok());
        assert!(ch.sub_image(&vb).is_ok());
    }

    #[test]
    fn held_slot_blocks_ring() {
        let mut ch = started(SimulationConfig {
            num_buffers: 1,
            ..Default::default()
        });
        let held = ch.acquire_buffer(Duration::from_millis(1)).unwrap();
        assert!(matches!(
            ch.acquire_buffer(Duration::from_millis(1)),
            Err(CaptureError::AcquisitionTimeout { .. })
        ));
        ch.release(held).unwrap();
    }

    #[test]
    fn double_release_is_rejected() {
        let mut ch = started(SimulationConfig::default());
        let h = ch.acquire_buffer(Duration::from_millis(1)).unwrap();
        let forged = ChannelBufferHandle::new(0, h.slot(), h.generation(), h.size_bytes(), 0);
        ch.release(h).unwrap();
        assert!(ch.release(forged).is_err());
    }

    #[test]
    fn master_raises_counter_at_configured_acquisition() {
        let (mut bank, counter) = SimulatedChannel::bank(
            geometry(),
            SimulationConfig {
                trigger_at: Some(2),
                ..Default::default()
            },
        );
        let master = &mut bank[MASTER_CHANNEL];
        master.start().unwrap();
        for _ in 0..2 {
            let h = master.acquire_buffer(Duration::from_millis(1)).unwrap();
            master.release(h).unwrap();
        }
        assert_eq!(counter.value(), 0);
        let h = master.acquire_buffer(Duration::from_millis(1)).unwrap();
        master.release(h).unwrap();
        assert_eq!(master.read_event_counter(DEFAULT_TRIGGER_COUNTER).unwrap(), 1);
        assert!(master.read_event_counter("EventCount[LIN1]").is_err());
    }

    #[test]
    fn gradient_rises_with_channel() {
        let config = SimulationConfig {
            pattern: Pattern::Gradient,
            ..Default::default()
        };
        let mut low = SimulatedChannel::new(0, geometry(), config.clone(), EventCounter::default());
        let mut high = SimulatedChannel::new(3, geometry(), config, EventCounter::default());
        low.start().unwrap();
        high.start().unwrap();
        let hl = low.acquire_buffer(Duration::from_millis(1)).unwrap();
        let hh = high.acquire_buffer(Duration::from_millis(1)).unwrap();
        let l = low.sub_image(&hl.sub_image(0, 1).unwrap()).unwrap()[0];
        let h = high.sub_image(&hh.sub_image(0, 1).unwrap()).unwrap()[0];
        assert!(h > l);
        low.release(hl).unwrap();
        high.release(hh).unwrap();
    }
}
