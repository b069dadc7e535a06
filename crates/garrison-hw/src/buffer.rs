//! Shared two-slot frame buffer between the camera producers and the engine.
//!
//! Each producer owns one slot and overwrites it with its newest frame
//! (latest frame wins, nothing is queued). Readers get an `Arc` to a complete
//! frame; a slot is swapped under its lock, never written in place.

use garrison_core::BgrImage;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Feed {
    Visual,
    Thermal,
}

impl std::fmt::Display for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feed::Visual => f.write_str("visual"),
            Feed::Thermal => f.write_str("thermal"),
        }
    }
}

/// Connection state of one camera feed, as shown to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    #[default]
    Connecting,
    Live,
    Lost,
    /// No camera configured for this feed.
    Disabled,
}

#[derive(Default)]
struct Slot {
    frame: Option<Arc<BgrImage>>,
    status: FeedStatus,
    frames: u64,
    updated: Option<Instant>,
}

#[derive(Default)]
pub struct FrameBuffer {
    visual: Mutex<Slot>,
    thermal: Mutex<Slot>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, feed: Feed) -> MutexGuard<'_, Slot> {
        let slot = match feed {
            Feed::Visual => &self.visual,
            Feed::Thermal => &self.thermal,
        };
        slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace the feed's frame with `frame` and mark the feed live.
    pub fn publish(&self, feed: Feed, frame: BgrImage) {
        let frame = Arc::new(frame);
        let mut slot = self.slot(feed);
        slot.frame = Some(frame);
        slot.status = FeedStatus::Live;
        slot.frames += 1;
        slot.updated = Some(Instant::now());
    }

    /// Update the feed status. Leaving `Live` drops the held frame so
    /// readers fall back to "feed not available" instead of a stale image.
    pub fn set_status(&self, feed: Feed, status: FeedStatus) {
        let mut slot = self.slot(feed);
        if status != FeedStatus::Live {
            slot.frame = None;
        }
        slot.status = status;
    }

    /// Latest frame of `feed`, or `None` while it holds no real image.
    pub fn current(&self, feed: Feed) -> Option<Arc<BgrImage>> {
        let frame = self.slot(feed).frame.clone();
        frame.filter(|frame| !frame.is_empty() && !frame.is_blank())
    }

    pub fn current_visual_frame(&self) -> Option<Arc<BgrImage>> {
        self.current(Feed::Visual)
    }

    pub fn current_thermal_frame(&self) -> Option<Arc<BgrImage>> {
        self.current(Feed::Thermal)
    }

    pub fn status(&self, feed: Feed) -> FeedStatus {
        self.slot(feed).status
    }

    /// Frames published on `feed` since startup.
    pub fn frames_published(&self, feed: Feed) -> u64 {
        self.slot(feed).frames
    }

    /// Time since the last frame on `feed`.
    pub fn age(&self, feed: Feed) -> Option<std::time::Duration> {
        self.slot(feed).updated.map(|t| t.elapsed())
    }
}
