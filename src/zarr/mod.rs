pub mod writer;

use anyhow::Result;
use fs2::FileExt;
use serde_json::json;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use zarrs::array::codec::{BloscCodec, BloscCompressionLevel, BloscCompressor, BloscShuffleMode};
use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::filesystem::FilesystemStore;
use zarrs::group::GroupBuilder;
use zarrs::storage::{ReadableStorageTraits, StoreKey};

use crate::stitch::CompositeGeometry;

pub use writer::ZarrFrameWriter;

/// Group holding everything written by one capture.
pub const CAPTURE_GROUP: &str = "/capture";
/// Frames array, shape `[frames, lines, pitch]`.
pub const FRAMES_ARRAY: &str = "/capture/frames";

/// Initialize or open a Zarr store, serializing initialization across processes.
pub fn open_or_create_zarr_store(store_path: &Path) -> Result<Arc<FilesystemStore>> {
    info!(path = %store_path.display(), "Writing to Zarr store");

    std::fs::create_dir_all(store_path)?;
    let store = Arc::new(FilesystemStore::new(store_path)?);

    let lock_path = store_path.join(".zarr_init.lock");
    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)?;
    lock_file.lock_exclusive()?;

    let mut last_error = None;
    for attempt in 0..2 {
        match initialize_store_structure(&store) {
            Ok(()) => {
                lock_file.unlock()?;
                return Ok(store);
            }
            Err(e) => {
                warn!(attempt = attempt + 1, "Failed to initialize Zarr store: {}", e);
                last_error = Some(e);
                std::thread::sleep(Duration::from_millis(10 + fastrand::u64(0..20)));
            }
        }
    }

    lock_file.unlock()?;
    match last_error {
        Some(e) => Err(e.context("Failed to initialize Zarr store after 2 attempts")),
        None => Err(anyhow::anyhow!("Failed to initialize Zarr store")),
    }
}

fn initialize_store_structure(store: &Arc<FilesystemStore>) -> Result<()> {
    create_group_if_not_exists(store, "/")?;
    create_group_if_not_exists(store, CAPTURE_GROUP)?;
    Ok(())
}

/// Key of the `zarr.json` metadata document for the node at `path`.
fn metadata_key(path: &str) -> Result<StoreKey> {
    let trimmed = path.trim_end_matches('/').trim_start_matches('/');
    let metadata_path = if trimmed.is_empty() {
        "zarr.json".to_string()
    } else {
        format!("{}/zarr.json", trimmed)
    };
    Ok(StoreKey::new(&metadata_path)?)
}

/// Zarr v3 nodes carry their type in `zarr.json`.
fn node_type(store: &Arc<FilesystemStore>, path: &str) -> Result<Option<String>> {
    match store.get(&metadata_key(path)?) {
        Ok(Some(data)) => {
            let json: serde_json::Value = serde_json::from_slice(&data)?;
            Ok(json.get("node_type").and_then(|v| v.as_str()).map(str::to_string))
        }
        _ => Ok(None),
    }
}

fn group_exists(store: &Arc<FilesystemStore>, path: &str) -> Result<bool> {
    Ok(node_type(store, path)?.as_deref() == Some("group"))
}

fn array_exists(store: &Arc<FilesystemStore>, path: &str) -> Result<bool> {
    Ok(node_type(store, path)?.as_deref() == Some("array"))
}

fn create_group_if_not_exists(store: &Arc<FilesystemStore>, path: &str) -> Result<()> {
    if !group_exists(store, path)? {
        let group = GroupBuilder::new().build(store.clone(), path)?;
        group.store_metadata()?;
    }
    Ok(())
}

/// Create the frames array and record the capture's geometry and configuration on its group.
///
/// An existing, still empty frames array is reopened. One that already holds frames belongs to an
/// earlier capture and is refused.
pub fn setup_frame_array(
    store: &Arc<FilesystemStore>,
    geometry: &CompositeGeometry,
    capture_config_json: &str,
) -> Result<Array<FilesystemStore>> {
    if array_exists(store, FRAMES_ARRAY)? {
        let array = Array::open(store.clone(), FRAMES_ARRAY)?;
        let shape = array.shape();
        if shape.len() != 3 || shape[1] != geometry.height as u64 || shape[2] != geometry.pitch as u64 {
            return Err(anyhow::anyhow!(
                "Existing frames array has shape {:?}, capture needs [_, {}, {}]",
                shape,
                geometry.height,
                geometry.pitch
            ));
        }
        if shape[0] > 0 {
            return Err(anyhow::anyhow!(
                "Frames array already holds {} frames from an earlier capture",
                shape[0]
            ));
        }
        return Ok(array);
    }

    let compression_level = BloscCompressionLevel::try_from(5u8)
        .map_err(|e| anyhow::anyhow!("Invalid compression level: {}", e))?;
    // pixels are single bytes, nothing to shuffle
    let blosc_codec = Arc::new(BloscCodec::new(
        BloscCompressor::LZ4,
        compression_level,
        None,
        BloscShuffleMode::NoShuffle,
        Some(1),
    )?);

    let lines = geometry.height as u64;
    let pitch = geometry.pitch as u64;
    let array = ArrayBuilder::new(
        vec![0, lines, pitch],
        vec![1, lines, pitch],
        DataType::UInt8,
        FillValue::from(0u8),
    )
    .dimension_names(Some(vec![
        Some("frames".to_string()),
        Some("lines".to_string()),
        Some("bytes".to_string()),
    ]))
    .bytes_to_bytes_codecs(vec![blosc_codec])
    .build(store.clone(), FRAMES_ARRAY)?;
    array.store_metadata()?;

    let config: serde_json::Value = serde_json::from_str(capture_config_json)?;
    let mut attrs = serde_json::Map::new();
    attrs.insert("geometry".to_string(), serde_json::to_value(geometry)?);
    attrs.insert("capture_config".to_string(), config);
    attrs.insert("created_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
    write_group_attributes(store, CAPTURE_GROUP, attrs)?;

    Ok(array)
}

/// Merge `attrs` into a group's attributes.
pub fn write_group_attributes(
    store: &Arc<FilesystemStore>,
    path: &str,
    attrs: serde_json::Map<String, serde_json::Value>,
) -> Result<()> {
    let mut group = zarrs::group::Group::open(store.clone(), path)?;
    group.attributes_mut().extend(attrs);
    group.store_metadata()?;
    Ok(())
}

/// Read attributes from a group's zarr.json file (Zarr v3 format)
pub fn read_group_attributes(store: &Arc<FilesystemStore>, path: &str) -> Result<serde_json::Value> {
    let zarr_key = metadata_key(path)?;
    let zarr_bytes = store
        .get(&zarr_key)?
        .ok_or_else(|| anyhow::anyhow!("Metadata not found at {}", zarr_key.as_str()))?;
    let zarr_metadata: serde_json::Value = serde_json::from_slice(&zarr_bytes)?;

    Ok(zarr_metadata
        .get("attributes")
        .cloned()
        .unwrap_or_else(|| json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> CompositeGeometry {
        CompositeGeometry {
            width: 8,
            height: 16,
            pitch: 8,
            pixel_format: "Mono8".to_string(),
        }
    }

    #[test]
    fn store_gets_capture_group_and_attributes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_or_create_zarr_store(dir.path())?;
        assert!(group_exists(&store, CAPTURE_GROUP)?);

        let array = setup_frame_array(&store, &geometry(), r#"{"num_buffers": 10}"#)?;
        assert_eq!(array.shape(), &[0, 16, 8]);

        let attrs = read_group_attributes(&store, CAPTURE_GROUP)?;
        assert_eq!(attrs["capture_config"]["num_buffers"], 10);
        assert_eq!(attrs["geometry"]["height"], 16);
        Ok(())
    }

    #[test]
    fn reopening_checks_frame_shape() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_or_create_zarr_store(dir.path())?;
        setup_frame_array(&store, &geometry(), "{}")?;

        let store = open_or_create_zarr_store(dir.path())?;
        assert!(setup_frame_array(&store, &geometry(), "{}").is_ok());
        let taller = CompositeGeometry {
            height: 32,
            ..geometry()
        };
        assert!(setup_frame_array(&store, &taller, "{}").is_err());
        Ok(())
    }

    #[test]
    fn array_with_frames_is_not_reused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = open_or_create_zarr_store(dir.path())?;
        let mut array = setup_frame_array(&store, &geometry(), "{}")?;
        array.set_shape(vec![3, 16, 8])?;
        array.store_metadata()?;

        let store = open_or_create_zarr_store(dir.path())?;
        let Err(err) = setup_frame_array(&store, &geometry(), "{}") else {
            panic!("array holding frames was reopened");
        };
        assert!(err.to_string().contains("3 frames"), "{err}");
        Ok(())
    }
}
