//! Hardware channel seam.
//!
//! A frame grabber channel hands out buffers from a finite ring. The capture loop borrows one
//! buffer per channel per tick through [`ScopedBuffer`], which returns it to the ring on every
//! exit path. What outlives the tick is a [`SubImageRef`]: a checked reference carrying the
//! slot's generation, so reading it after the device has refilled that slot is reported as
//! [`CaptureError::StaleBuffer`] instead of silently returning the wrong image.

pub mod simulated;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

use crate::error::{CaptureError, CaptureResult};

/// Number of channels in a striped grabber bank.
pub const NUM_CHANNELS: usize = 4;

/// Channel that owns the trigger input and drives the camera cycle.
pub const MASTER_CHANNEL: usize = 0;

/// Sub-image geometry reported by a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Pixels per line.
    pub width: usize,
    /// Lines per sub-image.
    pub height: usize,
    /// Bytes per line.
    pub pitch: usize,
    pub pixel_format: String,
}

impl Geometry {
    pub fn sub_image_len(&self) -> usize {
        self.pitch * self.height
    }
}

/// One hardware buffer borrowed for the duration of a tick.
///
/// Deliberately not `Clone`: releasing consumes it.
#[derive(Debug)]
pub struct ChannelBufferHandle {
    channel: usize,
    slot: usize,
    generation: u64,
    size_bytes: usize,
    timestamp: u64,
}

impl ChannelBufferHandle {
    /// Called by channel implementations when a filled buffer is handed out.
    pub fn new(channel: usize, slot: usize, generation: u64, size_bytes: usize, timestamp: u64) -> Self {
        Self {
            channel,
            slot,
            generation,
            size_bytes,
            timestamp,
        }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Reference to part `part` of a buffer split into `parts` equal sub-images.
    pub fn sub_image(&self, part: usize, parts: usize) -> CaptureResult<SubImageRef> {
        if parts == 0 || part >= parts {
            return Err(CaptureError::GeometryMismatch(format!(
                "part {} out of range for a buffer of {} part(s)",
                part, parts
            )));
        }
        let len = self.size_bytes / parts;
        Ok(SubImageRef {
            channel: self.channel,
            slot: self.slot,
            generation: self.generation,
            offset: part * len,
            len,
        })
    }
}

/// Checked reference to a sub-image inside a hardware buffer slot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubImageRef {
    pub channel: usize,
    pub slot: usize,
    pub generation: u64,
    pub offset: usize,
    pub len: usize,
}

/// Acquisition wait and retry settings.
#[derive(Debug, Clone)]
pub struct AcquireConfig {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            max_attempts: 3,
            retry_base_delay_ms: 50,
        }
    }
}

/// A frame grabber channel.
pub trait HardwareChannel {
    fn id(&self) -> usize;

    fn start(&mut self) -> CaptureResult<()>;

    /// Block until the next filled buffer is available or `timeout` elapses.
    fn acquire_buffer(&mut self, timeout: Duration) -> CaptureResult<ChannelBufferHandle>;

    /// Return a buffer to the device ring.
    fn release(&mut self, handle: ChannelBufferHandle) -> CaptureResult<()>;

    fn read_timestamp(&self, handle: &ChannelBufferHandle) -> u64 {
        handle.timestamp()
    }

    fn read_event_counter(&self, name: &str) -> CaptureResult<u64>;

    fn geometry(&self) -> Geometry;

    /// Resolve a reference taken during capture. Fails with `StaleBuffer` if the slot has been
    /// refilled since.
    fn sub_image(&self, view: &SubImageRef) -> CaptureResult<&[u8]>;
}

/// A buffer held for one tick, released when dropped.
pub struct ScopedBuffer<'a, C: HardwareChannel + ?Sized> {
    channel: &'a mut C,
    handle: Option<ChannelBufferHandle>,
}

impl<'a, C: HardwareChannel + ?Sized> ScopedBuffer<'a, C> {
    /// Acquire one buffer, retrying timeouts up to `config.max_attempts` times.
    pub fn acquire(channel: &'a mut C, config: &AcquireConfig) -> CaptureResult<Self> {
        let max_attempts = config.max_attempts.max(1);
        let mut attempt = 0;

        let handle = loop {
            attempt += 1;
            match channel.acquire_buffer(config.timeout) {
                Ok(handle) => break handle,
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let jitter = fastrand::u64(0..20);
                    let delay = Duration::from_millis(config.retry_base_delay_ms + jitter);
                    warn!(
                        channel = channel.id(),
                        attempt,
                        "Buffer wait timed out, retrying in {:?}",
                        delay
                    );
                    std::thread::sleep(delay);
                }
                Err(CaptureError::AcquisitionTimeout { channel: id, .. }) => {
                    return Err(CaptureError::AcquisitionTimeout {
                        channel: id,
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        };

        Ok(Self {
            channel,
            handle: Some(handle),
        })
    }

    pub fn handle(&self) -> CaptureResult<&ChannelBufferHandle> {
        self.handle
            .as_ref()
            .ok_or_else(|| CaptureError::hardware(self.channel.id(), "buffer already released"))
    }

    pub fn channel(&self) -> &C {
        &*self.channel
    }

    pub fn timestamp(&self) -> CaptureResult<u64> {
        let handle = self.handle()?;
        Ok(self.channel.read_timestamp(handle))
    }

    /// Release now and surface any device error.
    pub fn release(mut self) -> CaptureResult<()> {
        match self.handle.take() {
            Some(handle) => self.channel.release(handle),
            None => Ok(()),
        }
    }
}

impl<C: HardwareChannel + ?Sized> Drop for ScopedBuffer<'_, C> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let slot = handle.slot();
            if let Err(e) = self.channel.release(handle) {
                warn!(channel = self.channel.id(), slot, "Failed to release buffer: {}", e);
            }
        }
    }
}
