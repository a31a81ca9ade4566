//! Frame reconstitution from four striped sub-images.
//!
//! The sensor is read out by four channels in stripes of `line_height` lines, and adjacent
//! stripes are mounted in alternating orientation. The composite is rebuilt in two halves:
//! the top half takes one row-group from channels 3, 2, 1, 0 in turn, the bottom half from
//! channels 0, 1, 2, 3. Swapping the orders mirrors one half of the image.

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, CaptureResult};
use crate::hardware::{Geometry, NUM_CHANNELS};

/// Lines per row-group when the grabbers are set up with a 2-line stripe.
pub const DEFAULT_LINE_HEIGHT: usize = 2;

const TOP_ORDER: [usize; NUM_CHANNELS] = [3, 2, 1, 0];
const BOTTOM_ORDER: [usize; NUM_CHANNELS] = [0, 1, 2, 3];

/// Geometry of a reconstituted frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeGeometry {
    pub width: usize,
    /// Lines in the composite, four times the sub-image height.
    pub height: usize,
    pub pitch: usize,
    pub pixel_format: String,
}

impl CompositeGeometry {
    pub fn from_sub_image(sub: &Geometry) -> Self {
        Self {
            width: sub.width,
            height: sub.height * NUM_CHANNELS,
            pitch: sub.pitch,
            pixel_format: sub.pixel_format.clone(),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.pitch * self.height
    }
}

/// One channel's sub-image viewed as a stack of row-groups.
#[derive(Debug, Clone, Copy)]
pub struct SubImage<'a> {
    data: &'a [u8],
    block: usize,
}

impl<'a> SubImage<'a> {
    fn new(channel: usize, data: &'a [u8], sub: &Geometry, line_height: usize) -> CaptureResult<Self> {
        let expected = sub.sub_image_len();
        if data.len() < expected {
            return Err(CaptureError::GeometryMismatch(format!(
                "channel {} sub-image has {} bytes, geometry needs {}",
                channel,
                data.len(),
                expected
            )));
        }
        Ok(Self {
            data: &data[..expected],
            block: sub.pitch * line_height,
        })
    }

    pub fn row_group(&self, index: usize) -> &'a [u8] {
        &self.data[index * self.block..(index + 1) * self.block]
    }
}

/// Check that a sub-image geometry divides evenly into top and bottom row-groups.
fn check_geometry(sub: &Geometry, line_height: usize) -> CaptureResult<()> {
    if line_height == 0 || sub.pitch == 0 || sub.height == 0 {
        return Err(CaptureError::GeometryMismatch(format!(
            "degenerate geometry: pitch {}, height {}, line height {}",
            sub.pitch, sub.height, line_height
        )));
    }
    if sub.pitch < sub.width {
        return Err(CaptureError::GeometryMismatch(format!(
            "pitch {} is narrower than width {}",
            sub.pitch, sub.width
        )));
    }
    if sub.height % (2 * line_height) != 0 {
        return Err(CaptureError::GeometryMismatch(format!(
            "sub-image height {} is not a multiple of two {}-line row-groups",
            sub.height, line_height
        )));
    }
    Ok(())
}

/// Interleave four sub-images into `dest`.
pub fn reconstitute_into(
    dest: &mut [u8],
    sources: [&[u8]; NUM_CHANNELS],
    sub: &Geometry,
    line_height: usize,
) -> CaptureResult<()> {
    check_geometry(sub, line_height)?;

    let composite_len = sub.sub_image_len() * NUM_CHANNELS;
    if dest.len() != composite_len {
        return Err(CaptureError::GeometryMismatch(format!(
            "destination holds {} bytes, composite needs {}",
            dest.len(),
            composite_len
        )));
    }

    let mut planes = Vec::with_capacity(NUM_CHANNELS);
    for (channel, data) in sources.into_iter().enumerate() {
        planes.push(SubImage::new(channel, data, sub, line_height)?);
    }

    let block = sub.pitch * line_height;
    let groups_per_half = sub.height / (2 * line_height);
    let mut out = dest.chunks_exact_mut(block);

    for (half, order) in [TOP_ORDER, BOTTOM_ORDER].iter().enumerate() {
        for g in 0..groups_per_half {
            let group = half * groups_per_half + g;
            for &channel in order {
                let target = out.next().ok_or_else(|| {
                    CaptureError::GeometryMismatch("composite buffer exhausted".to_string())
                })?;
                target.copy_from_slice(planes[channel].row_group(group));
            }
        }
    }

    Ok(())
}

/// Reconstitutes frames into one reusable composite buffer.
pub struct Reconstitutor {
    sub: Geometry,
    line_height: usize,
    buffer: Vec<u8>,
}

impl Reconstitutor {
    pub fn new(sub: Geometry, line_height: usize) -> CaptureResult<Self> {
        check_geometry(&sub, line_height)?;
        let buffer = vec![0u8; sub.sub_image_len() * NUM_CHANNELS];
        Ok(Self {
            sub,
            line_height,
            buffer,
        })
    }

    pub fn composite_geometry(&self) -> CompositeGeometry {
        CompositeGeometry::from_sub_image(&self.sub)
    }

    pub fn stitch(&mut self, sources: [&[u8]; NUM_CHANNELS]) -> CaptureResult<&[u8]> {
        reconstitute_into(&mut self.buffer, sources, &self.sub, self.line_height)?;
        Ok(&self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(height: usize, pitch: usize) -> Geometry {
        Geometry {
            width: pitch,
            height,
            pitch,
            pixel_format: "Mono8".to_string(),
        }
    }

    fn constant_planes(len: usize) -> Vec<Vec<u8>> {
        (0..NUM_CHANNELS as u8).map(|v| vec![v; len]).collect()
    }

    #[test]
    fn halves_interleave_in_opposite_orders() {
        let sub = geometry(8, 4);
        let planes = constant_planes(sub.sub_image_len());
        let mut rec = Reconstitutor::new(sub.clone(), DEFAULT_LINE_HEIGHT).unwrap();
        let out = rec
            .stitch([&planes[0], &planes[1], &planes[2], &planes[3]])
            .unwrap()
            .to_vec();

        let block = sub.pitch * DEFAULT_LINE_HEIGHT;
        assert_eq!(out.len(), sub.sub_image_len() * NUM_CHANNELS);

        let blocks: Vec<&[u8]> = out.chunks(block).collect();
        let half = blocks.len() / 2;
        for (i, b) in blocks.iter().enumerate() {
            let expected = if i < half {
                [3u8, 2, 1, 0][i % 4]
            } else {
                [0u8, 1, 2, 3][i % 4]
            };
            assert!(b.iter().all(|&v| v == expected), "block {i} should be {expected}");
        }
    }

    #[test]
    fn each_channel_is_consumed_in_order() {
        // Each row-group of channel c is tagged c*16 + group index.
        let sub = geometry(8, 2);
        let block = sub.pitch * DEFAULT_LINE_HEIGHT;
        let planes: Vec<Vec<u8>> = (0..NUM_CHANNELS)
            .map(|c| {
                (0..sub.height / DEFAULT_LINE_HEIGHT)
                    .flat_map(|g| vec![(c * 16 + g) as u8; block])
                    .collect()
            })
            .collect();
        let mut dest = vec![0u8; sub.sub_image_len() * NUM_CHANNELS];
        reconstitute_into(
            &mut dest,
            [&planes[0], &planes[1], &planes[2], &planes[3]],
            &sub,
            DEFAULT_LINE_HEIGHT,
        )
        .unwrap();

        let tags: Vec<u8> = dest.chunks(block).map(|b| b[0]).collect();
        assert_eq!(
            tags,
            vec![
                0x30, 0x20, 0x10, 0x00, // top, group 0
                0x31, 0x21, 0x11, 0x01, // top, group 1
                0x02, 0x12, 0x22, 0x32, // bottom, group 2
                0x03, 0x13, 0x23, 0x33, // bottom, group 3
            ]
        );
    }

    #[test]
    fn rejects_short_source() {
        let sub = geometry(4, 4);
        let planes = constant_planes(sub.sub_image_len());
        let short = vec![0u8; 3];
        let mut rec = Reconstitutor::new(sub, DEFAULT_LINE_HEIGHT).unwrap();
        assert!(matches!(
            rec.stitch([&planes[0], &short, &planes[2], &planes[3]]),
            Err(CaptureError::GeometryMismatch(_))
        ));
    }

    #[test]
    fn rejects_height_not_split_into_halves() {
        assert!(Reconstitutor::new(geometry(6, 4), DEFAULT_LINE_HEIGHT).is_err());
        assert!(Reconstitutor::new(geometry(6, 4), 3).is_ok());
        assert!(Reconstitutor::new(geometry(8, 4), 0).is_err());
    }

    #[test]
    fn rejects_wrong_destination_size() {
        let sub = geometry(4, 4);
        let planes = constant_planes(sub.sub_image_len());
        let mut dest = vec![0u8; 10];
        let result = reconstitute_into(
            &mut dest,
            [&planes[0], &planes[1], &planes[2], &planes[3]],
            &sub,
            DEFAULT_LINE_HEIGHT,
        );
        assert!(result.is_err());
    }

    #[test]
    fn composite_geometry_stacks_channels() {
        let rec = Reconstitutor::new(geometry(8, 32), DEFAULT_LINE_HEIGHT).unwrap();
        let g = rec.composite_geometry();
        assert_eq!(g.height, 32);
        assert_eq!(g.byte_len(), 32 * 32);
    }
}
