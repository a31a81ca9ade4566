//! Draining a finished capture to storage.
//!
//! [`PersistenceWriter::drain`] empties the frame window oldest first. Each slot is resolved
//! against the hardware ring, reconstituted into a composite frame, handed to a [`FrameEncoder`]
//! under a sequential output index and logged as one row of the timestamp CSV.

use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{CaptureError, CaptureResult, SessionFailure, Stage};
use crate::hardware::{HardwareChannel, NUM_CHANNELS};
use crate::stitch::{CompositeGeometry, Reconstitutor};
use crate::timestamp;
use crate::window::FrameWindow;

/// Column names of the timestamp log.
pub const LOG_HEADER: [&str; 3] = ["Image Index", "Timestamp(in microseconds)", "Trigger"];

/// One row of the timestamp log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LogRow {
    /// Sequential output index, matching the stored frame's name.
    pub image_index: u64,
    pub timestamp: u64,
    pub triggered: bool,
}

/// Stores composite frames.
pub trait FrameEncoder {
    fn encode_and_store(
        &mut self,
        frame: &[u8],
        geometry: &CompositeGeometry,
        sequence_index: u64,
        output_template: &str,
    ) -> CaptureResult<()>;

    /// Flush anything buffered. Called once after the last frame.
    fn finish(&mut self) -> CaptureResult<()> {
        Ok(())
    }
}

impl<E: FrameEncoder + ?Sized> FrameEncoder for Box<E> {
    fn encode_and_store(
        &mut self,
        frame: &[u8],
        geometry: &CompositeGeometry,
        sequence_index: u64,
        output_template: &str,
    ) -> CaptureResult<()> {
        (**self).encode_and_store(frame, geometry, sequence_index, output_template)
    }

    fn finish(&mut self) -> CaptureResult<()> {
        (**self).finish()
    }
}

/// Receives one row per stored frame.
pub trait LogSink {
    fn append_row(&mut self, row: &LogRow) -> CaptureResult<()>;

    fn close(&mut self) -> CaptureResult<()>;
}

impl<L: LogSink + ?Sized> LogSink for Box<L> {
    fn append_row(&mut self, row: &LogRow) -> CaptureResult<()> {
        (**self).append_row(row)
    }

    fn close(&mut self) -> CaptureResult<()> {
        (**self).close()
    }
}

/// Timestamp log written as CSV with a fixed header.
pub struct CsvLogSink {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: u64,
}

impl CsvLogSink {
    /// Create the file and write the header row.
    pub fn open(path: impl AsRef<Path>) -> CaptureResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(LOG_HEADER)?;
        debug!(path = %path.display(), "Opened timestamp log");
        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }
}

impl LogSink for CsvLogSink {
    fn append_row(&mut self, row: &LogRow) -> CaptureResult<()> {
        self.writer.write_record(&[
            row.image_index.to_string(),
            row.timestamp.to_string(),
            u8::from(row.triggered).to_string(),
        ])?;
        self.rows += 1;
        Ok(())
    }

    fn close(&mut self) -> CaptureResult<()> {
        self.writer.flush()?;
        debug!(path = %self.path.display(), rows = self.rows, "Closed timestamp log");
        Ok(())
    }
}

/// Writes each composite frame verbatim to its own file.
pub struct RawFileEncoder {
    dir: PathBuf,
    written: u64,
}

impl RawFileEncoder {
    pub fn new(dir: impl Into<PathBuf>) -> CaptureResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, written: 0 })
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

impl FrameEncoder for RawFileEncoder {
    fn encode_and_store(
        &mut self,
        frame: &[u8],
        geometry: &CompositeGeometry,
        sequence_index: u64,
        output_template: &str,
    ) -> CaptureResult<()> {
        if frame.len() != geometry.byte_len() {
            return Err(CaptureError::Encoder(format!(
                "frame {} has {} bytes, geometry describes {}",
                sequence_index,
                frame.len(),
                geometry.byte_len()
            )));
        }
        let path = self.dir.join(expand_output_template(output_template, sequence_index));
        fs::write(&path, frame)?;
        self.written += 1;
        Ok(())
    }
}

/// Substitute the sequence index into an output name.
///
/// The first run of three or more `N` is replaced by the index, zero-padded to the run's length.
/// Without such a run the index is inserted before the extension.
pub fn expand_output_template(template: &str, index: u64) -> String {
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'N' {
            let start = i;
            while i < bytes.len() && bytes[i] == b'N' {
                i += 1;
            }
            let width = i - start;
            if width >= 3 {
                return format!("{}{:0width$}{}", &template[..start], index, &template[i..]);
            }
        } else {
            i += 1;
        }
    }

    let name_start = template.rfind('/').map_or(0, |p| p + 1);
    match template[name_start..].rfind('.') {
        Some(dot) if dot > 0 => {
            let dot = name_start + dot;
            format!("{}.{:03}{}", &template[..dot], index, &template[dot..])
        }
        _ => format!("{}.{:03}", template, index),
    }
}

/// What a drain wrote.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DrainSummary {
    pub frames_written: u64,
    pub triggered_frames: u64,
    /// Output index of the first triggered frame.
    pub first_triggered: Option<u64>,
    pub first_timestamp: Option<u64>,
    pub last_timestamp: Option<u64>,
}

pub struct PersistenceWriter<E: FrameEncoder, L: LogSink> {
    encoder: E,
    log: L,
    output_template: String,
    reconstitutor: Reconstitutor,
    composite: CompositeGeometry,
}

impl<E: FrameEncoder, L: LogSink> PersistenceWriter<E, L> {
    pub fn new(encoder: E, log: L, output_template: impl Into<String>, reconstitutor: Reconstitutor) -> Self {
        let composite = reconstitutor.composite_geometry();
        Self {
            encoder,
            log,
            output_template: output_template.into(),
            reconstitutor,
            composite,
        }
    }

    pub fn composite_geometry(&self) -> &CompositeGeometry {
        &self.composite
    }

    /// Empty `window` oldest first, storing one frame and one log row per slot.
    pub fn drain<C: HardwareChannel>(
        &mut self,
        window: &mut FrameWindow,
        channels: &[C],
    ) -> Result<DrainSummary, SessionFailure> {
        if channels.len() != NUM_CHANNELS {
            return Err(SessionFailure::new(
                Stage::Persist,
                0,
                CaptureError::InvalidConfig(format!("expected {} channels, got {}", NUM_CHANNELS, channels.len())),
            ));
        }

        let total = window.len();
        let mut summary = DrainSummary::default();
        info!(frames = total, "Saving captured frames");

        let mut sequence_index = 0u64;
        while !window.is_empty() {
            let slot = window
                .pop_back()
                .map_err(|e| SessionFailure::new(Stage::Retain, sequence_index, e))?;
            let record = slot.record;

            let mut sources: [&[u8]; NUM_CHANNELS] = [&[]; NUM_CHANNELS];
            for (i, (channel, view)) in channels.iter().zip(slot.sub_images.iter()).enumerate() {
                sources[i] = channel
                    .sub_image(view)
                    .map_err(|e| SessionFailure::new(Stage::Reconstitute, record.frame_index, e))?;
            }
            let frame = self
                .reconstitutor
                .stitch(sources)
                .map_err(|e| SessionFailure::new(Stage::Reconstitute, record.frame_index, e))?;

            self.encoder
                .encode_and_store(frame, &self.composite, sequence_index, &self.output_template)
                .map_err(|e| SessionFailure::new(Stage::Persist, record.frame_index, e))?;

            let row = LogRow {
                image_index: sequence_index,
                timestamp: record.timestamp,
                triggered: record.triggered,
            };
            self.log
                .append_row(&row)
                .map_err(|e| SessionFailure::new(Stage::Persist, record.frame_index, e))?;

            if record.triggered {
                summary.triggered_frames += 1;
                summary.first_triggered.get_or_insert(sequence_index);
            }
            summary.first_timestamp.get_or_insert(record.timestamp);
            summary.last_timestamp = Some(record.timestamp);

            debug!(
                frame = sequence_index,
                captured_as = record.frame_index,
                timestamp = %timestamp::format_timestamp(record.timestamp),
                "Saved frame to disk"
            );
            sequence_index += 1;
            if sequence_index % 100 == 0 {
                info!(saved = sequence_index, of = total, "Saving");
            }
        }
        summary.frames_written = sequence_index;

        self.encoder
            .finish()
            .map_err(|e| SessionFailure::new(Stage::Persist, sequence_index, e))?;
        self.log
            .close()
            .map_err(|e| SessionFailure::new(Stage::Persist, sequence_index, e))?;

        info!(
            frames = summary.frames_written,
            triggered = summary.triggered_frames,
            "Capture persisted"
        );
        Ok(summary)
    }

    pub fn into_parts(self) -> (E, L) {
        (self.encoder, self.log)
    }
}

/// Read back a timestamp log written by [`CsvLogSink`].
pub fn read_log(path: impl AsRef<Path>) -> CaptureResult<Vec<LogRow>> {
    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path.as_ref())?;
    let headers = reader.headers()?.clone();
    if headers.iter().ne(LOG_HEADER.iter().copied()) {
        return Err(CaptureError::InvalidConfig(format!(
            "unexpected log header: {:?}",
            headers.iter().collect::<Vec<_>>()
        )));
    }

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        let field = |i: usize| -> CaptureResult<u64> {
            record
                .get(i)
                .and_then(|v| v.trim().parse().ok())
                .ok_or_else(|| CaptureError::InvalidConfig(format!("row {}: bad {} field", line + 1, LOG_HEADER[i])))
        };
        let triggered = match field(2)? {
            0 => false,
            1 => true,
            other => {
                return Err(CaptureError::InvalidConfig(format!(
                    "row {}: trigger flag {} is not 0 or 1",
                    line + 1,
                    other
                )));
            }
        };
        rows.push(LogRow {
            image_index: field(0)?,
            timestamp: field(1)?,
            triggered,
        });
    }
    Ok(rows)
}

/// Problems found in a timestamp log; empty when it is consistent.
pub fn check_log(rows: &[LogRow]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut latched = false;

    for (i, row) in rows.iter().enumerate() {
        if row.image_index != i as u64 {
            problems.push(format!("row {}: image index {} is out of sequence", i, row.image_index));
        }
        if let Some(prev) = i.checked_sub(1).map(|p| &rows[p])
            && row.timestamp < prev.timestamp
        {
            problems.push(format!(
                "row {}: timestamp {} precedes {}",
                i, row.timestamp, prev.timestamp
            ));
        }
        if latched && !row.triggered {
            problems.push(format!("row {}: trigger flag cleared after it was set", i));
        }
        latched |= row.triggered;
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Geometry, SubImageRef};
    use crate::window::{FrameRecord, FrameSlot};

    #[derive(Default)]
    struct MemoryLog {
        rows: Vec<LogRow>,
        closed: bool,
    }

    impl LogSink for MemoryLog {
        fn append_row(&mut self, row: &LogRow) -> CaptureResult<()> {
            self.rows.push(*row);
            Ok(())
        }

        fn close(&mut self) -> CaptureResult<()> {
            self.closed = true;
            Ok(())
        }
    }

    #[test]
    fn template_pads_to_placeholder_width() {
        assert_eq!(expand_output_template("frame.NNN.raw", 7), "frame.007.raw");
        assert_eq!(expand_output_template("img_NNNNN.bin", 42), "img_00042.bin");
        assert_eq!(expand_output_template("frame.NNN.raw", 1234), "frame.1234.raw");
    }

    #[test]
    fn template_without_placeholder_gets_index() {
        assert_eq!(expand_output_template("frame.raw", 3), "frame.003.raw");
        assert_eq!(expand_output_template("NN.raw", 3), "NN.003.raw");
        assert_eq!(expand_output_template("frame", 3), "frame.003");
    }

    #[test]
    fn csv_log_has_header_and_flag_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.csv");
        let mut log = CsvLogSink::open(&path).unwrap();
        log.append_row(&LogRow {
            image_index: 0,
            timestamp: 1_000_250,
            triggered: false,
        })
        .unwrap();
        log.append_row(&LogRow {
            image_index: 1,
            timestamp: 1_001_250,
            triggered: true,
        })
        .unwrap();
        log.close().unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "Image Index,Timestamp(in microseconds),Trigger\n0,1000250,0\n1,1001250,1\n"
        );
        assert_eq!(read_log(&path).unwrap().len(), 2);
    }

    #[test]
    fn empty_log_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.csv");
        let mut log = CsvLogSink::open(&path).unwrap();
        log.close().unwrap();
        assert!(read_log(&path).unwrap().is_empty());
    }

    #[test]
    fn check_log_flags_each_violation() {
        let row = |image_index, timestamp, triggered| LogRow {
            image_index,
            timestamp,
            triggered,
        };
        assert!(check_log(&[row(0, 10, false), row(1, 20, true), row(2, 30, true)]).is_empty());

        let problems = check_log(&[row(0, 10, true), row(2, 5, false)]);
        assert_eq!(problems.len(), 3);
    }

    #[test]
    fn raw_encoder_rejects_wrong_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut encoder = RawFileEncoder::new(dir.path()).unwrap();
        let geometry = CompositeGeometry {
            width: 4,
            height: 8,
            pitch: 4,
            pixel_format: "Mono8".to_string(),
        };
        assert!(encoder.encode_and_store(&[0u8; 3], &geometry, 0, "f.NNN.raw").is_err());
        encoder.encode_and_store(&[1u8; 32], &geometry, 5, "f.NNN.raw").unwrap();
        assert_eq!(fs::read(dir.path().join("f.005.raw")).unwrap().len(), 32);
        assert_eq!(encoder.written(), 1);
    }

    #[test]
    fn drain_with_wrong_channel_count_fails() {
        let sub = Geometry {
            width: 4,
            height: 4,
            pitch: 4,
            pixel_format: "Mono8".to_string(),
        };
        let dir = tempfile::tempdir().unwrap();
        let mut writer = PersistenceWriter::new(
            RawFileEncoder::new(dir.path()).unwrap(),
            MemoryLog::default(),
            "frame.NNN.raw",
            Reconstitutor::new(sub, 2).unwrap(),
        );
        let mut window = FrameWindow::new(1);
        window.push_front(FrameSlot {
            sub_images: [SubImageRef::default(); NUM_CHANNELS],
            record: FrameRecord {
                frame_index: 0,
                timestamp: 0,
                triggered: false,
            },
        });
        let channels: Vec<crate::hardware::simulated::SimulatedChannel> = Vec::new();
        let failure = writer.drain(&mut window, &channels).unwrap_err();
        assert_eq!(failure.stage, Stage::Persist);
        let (_, log) = writer.into_parts();
        assert!(log.rows.is_empty());
        assert!(!log.closed);
    }
}
