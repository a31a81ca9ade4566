use anyhow::Result;
use fs2::FileExt;
use ndarray::{Array3, Ix3};
use serde_json::json;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use zarrs::array::Array;
use zarrs::filesystem::FilesystemStore;

use super::{CAPTURE_GROUP, open_or_create_zarr_store, setup_frame_array, write_group_attributes};
use crate::error::{CaptureError, CaptureResult};
use crate::persist::FrameEncoder;
use crate::stitch::CompositeGeometry;

/// Frames buffered in memory before a write.
pub const DEFAULT_FLUSH_FRAMES: usize = 16;

/// Stores composite frames in a chunked, Blosc-compressed Zarr array, one chunk per frame.
pub struct ZarrFrameWriter {
    store: Arc<FilesystemStore>,
    frames_array: Array<FilesystemStore>,
    geometry: CompositeGeometry,
    pending: Vec<u8>,
    pending_frames: usize,
    flush_frames: usize,
    /// Frames already in the array.
    current_length: u64,
    slow_flush_warnings: u32,
    // coordinates metadata writes with other processes sharing the store
    metadata_lock: File,
}

impl ZarrFrameWriter {
    pub fn create(store_path: &Path, geometry: CompositeGeometry, capture_config_json: &str) -> Result<Self> {
        let store = open_or_create_zarr_store(store_path)?;
        let frames_array = setup_frame_array(&store, &geometry, capture_config_json)?;
        let current_length = frames_array.shape()[0];

        let lock_path = store_path.join(".zarr_metadata.lock");
        let metadata_lock = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(lock_path)?;

        Ok(Self {
            store,
            frames_array,
            geometry,
            pending: Vec::new(),
            pending_frames: 0,
            flush_frames: DEFAULT_FLUSH_FRAMES,
            current_length,
            slow_flush_warnings: 0,
            metadata_lock,
        })
    }

    pub fn with_flush_frames(mut self, frames: usize) -> Self {
        self.flush_frames = frames.max(1);
        self
    }

    /// Frames written to the array so far, excluding any still buffered.
    pub fn frames_written(&self) -> u64 {
        self.current_length
    }

    pub fn push_frame(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() != self.geometry.byte_len() {
            return Err(anyhow::anyhow!(
                "Frame has {} bytes, composite geometry needs {}",
                frame.len(),
                self.geometry.byte_len()
            ));
        }
        self.pending.extend_from_slice(frame);
        self.pending_frames += 1;
        if self.pending_frames >= self.flush_frames {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.pending_frames == 0 {
            return Ok(());
        }
        let flush_start = Instant::now();

        let lines = self.geometry.height;
        let pitch = self.geometry.pitch;
        let count = self.pending_frames;
        let new_length = self.current_length + count as u64;

        // zarrs does not grow arrays on write
        self.frames_array
            .set_shape(vec![new_length, lines as u64, pitch as u64])?;

        let block = Array3::<u8>::from_shape_vec((count, lines, pitch), std::mem::take(&mut self.pending))?;
        self.frames_array
            .store_array_subset_ndarray::<u8, Ix3>(&[self.current_length, 0, 0], block)?;

        self.current_length = new_length;
        self.pending_frames = 0;

        let flush_duration = flush_start.elapsed();
        if flush_duration > Duration::from_millis(100) {
            self.slow_flush_warnings += 1;
            if self.slow_flush_warnings <= 5 {
                warn!(
                    frames = count,
                    millis = flush_duration.as_millis() as u64,
                    "Slow Zarr flush ({}/5)",
                    self.slow_flush_warnings
                );
            }
        }
        debug!(frames = count, total = self.current_length, "Zarr: wrote frames");

        self.metadata_lock.lock_exclusive()?;
        let metadata_result = self.frames_array.store_metadata();
        self.metadata_lock.unlock()?;
        metadata_result?;

        Ok(())
    }

    /// Flush buffered frames and record the final frame count on the capture group.
    pub fn close(&mut self) -> Result<()> {
        self.flush()?;
        let mut attrs = serde_json::Map::new();
        attrs.insert("frame_count".to_string(), json!(self.current_length));
        attrs.insert("closed_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
        write_group_attributes(&self.store, CAPTURE_GROUP, attrs)
    }
}

fn encoder_error(e: anyhow::Error) -> CaptureError {
    CaptureError::Encoder(format!("{:#}", e))
}

impl FrameEncoder for ZarrFrameWriter {
    /// Frames are addressed by their index in the array, so the template is not used.
    fn encode_and_store(
        &mut self,
        frame: &[u8],
        geometry: &CompositeGeometry,
        sequence_index: u64,
        _output_template: &str,
    ) -> CaptureResult<()> {
        if geometry != &self.geometry {
            return Err(CaptureError::Encoder(format!(
                "frame {} geometry {:?} differs from store geometry {:?}",
                sequence_index, geometry, self.geometry
            )));
        }
        let expected = self.current_length + self.pending_frames as u64;
        if sequence_index != expected {
            return Err(CaptureError::Encoder(format!(
                "frame {} arrived out of order, store expects {}",
                sequence_index, expected
            )));
        }
        self.push_frame(frame).map_err(encoder_error)
    }

    fn finish(&mut self) -> CaptureResult<()> {
        self.close().map_err(encoder_error)
    }
}
