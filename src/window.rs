//! Bounded capture windows.
//!
//! Entries are pushed at the front and drained from the back, so the back is always the oldest
//! frame. Per-channel sub-image references and the frame's metadata travel together in one
//! [`FrameSlot`], which keeps every channel's history the same length by construction.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::error::{CaptureError, CaptureResult};
use crate::hardware::{NUM_CHANNELS, SubImageRef};

/// Metadata of one captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub frame_index: u64,
    /// Mean channel timestamp in microseconds.
    pub timestamp: u64,
    pub triggered: bool,
}

/// Everything retained for one frame: a sub-image reference per channel plus its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub sub_images: [SubImageRef; NUM_CHANNELS],
    pub record: FrameRecord,
}

/// Most-recent-first double-ended window with a target length.
///
/// `capacity` is the retention target, not a hard limit: pushing onto a full window still
/// succeeds, the caller decides when to evict.
#[derive(Debug, Clone)]
pub struct SlidingWindow<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> SlidingWindow<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push_front(&mut self, item: T) {
        self.items.push_front(item);
    }

    /// Remove the oldest entry.
    pub fn pop_back(&mut self) -> CaptureResult<T> {
        self.items.pop_back().ok_or(CaptureError::EmptyWindow)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    /// Newest entry.
    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    /// Oldest entry.
    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterate newest to oldest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.items.iter()
    }
}

pub type FrameWindow = SlidingWindow<FrameSlot>;

impl FrameWindow {
    /// Frame records oldest first, the order they will be persisted in.
    pub fn records(&self) -> impl Iterator<Item = &FrameRecord> {
        self.iter().rev().map(|slot| &slot.record)
    }
}
