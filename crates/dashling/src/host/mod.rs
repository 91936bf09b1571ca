//! Ports to the platform that owns decoding and rendering.
//!
//! The engine only pushes byte chunks into [`SourceBuffer`]s and reads back
//! buffered [`TimeRanges`]. Everything else is the host's business.

pub mod simulated;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::DashlingResult;

/// Ranges closer than this are merged into one.
const ADJACENT_TOLERANCE: f64 = 1e-3;

/// Ordered, non-overlapping `[start, end)` ranges in seconds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimeRanges {
    ranges: Vec<(f64, f64)>,
}

impl TimeRanges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ranges(ranges: impl IntoIterator<Item = (f64, f64)>) -> Self {
        let mut result = Self::new();
        for (start, end) in ranges {
            result.add(start, end);
        }
        result
    }

    pub fn add(&mut self, start: f64, end: f64) {
        if end <= start {
            return;
        }

        let (mut start, mut end) = (start, end);
        let mut merged = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e + ADJACENT_TOLERANCE < start || end + ADJACENT_TOLERANCE < s {
                merged.push((s, e));
            } else {
                start = start.min(s);
                end = end.max(e);
            }
        }
        merged.push((start, end));
        merged.sort_by(|a, b| a.0.total_cmp(&b.0));
        self.ranges = merged;
    }

    pub fn remove(&mut self, start: f64, end: f64) {
        let mut result = Vec::with_capacity(self.ranges.len() + 1);
        for &(s, e) in &self.ranges {
            if e <= start || s >= end {
                result.push((s, e));
                continue;
            }
            if s < start {
                result.push((s, start));
            }
            if e > end {
                result.push((end, e));
            }
        }
        self.ranges = result;
    }

    pub fn intersect(&self, other: &TimeRanges) -> TimeRanges {
        let mut result = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a_start, a_end) = self.ranges[i];
            let (b_start, b_end) = other.ranges[j];
            let start = a_start.max(b_start);
            let end = a_end.min(b_end);
            if start < end {
                result.push((start, end));
            }
            if a_end < b_end {
                i += 1;
            } else {
                j += 1;
            }
        }
        TimeRanges { ranges: result }
    }

    /// The range containing `time`, end inclusive.
    pub fn range_containing(&self, time: f64) -> Option<(f64, f64)> {
        self.ranges
            .iter()
            .copied()
            .find(|&(start, end)| start <= time && time <= end)
    }

    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn end(&self) -> Option<f64> {
        self.ranges.last().map(|&(_, end)| end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkKind {
    Init {
        quality: usize,
    },
    /// Carries the fragment timing so hosts that do not demux can still report buffered ranges.
    Media {
        index: usize,
        start_seconds: f64,
        length_seconds: f64,
    },
}

#[derive(Debug, Clone)]
pub struct SinkChunk {
    pub data: Bytes,
    pub kind: ChunkKind,
}

/// A per-codec append target, the equivalent of an MSE `SourceBuffer`.
///
/// `append` and `remove` complete when the host reports the update as done.
#[async_trait]
pub trait SourceBuffer: Send + Sync {
    async fn append(&self, chunk: SinkChunk) -> DashlingResult<()>;

    async fn remove(&self, start: f64, end: f64) -> DashlingResult<()>;

    fn abort(&self);

    fn buffered(&self) -> TimeRanges;
}

pub trait MediaSource: Send + Sync {
    /// Creates a sink for a `mime; codecs="..."` string. Fails when the host cannot play it.
    fn add_source_buffer(&self, mime_codecs: &str) -> DashlingResult<Arc<dyn SourceBuffer>>;

    fn is_open(&self) -> bool;

    fn end_of_stream(&self);

    fn set_duration(&self, duration: f64);
}

pub trait MediaElement: Send + Sync {
    fn current_time(&self) -> f64;

    fn set_current_time(&self, time: f64);

    fn duration(&self) -> f64;

    fn buffered(&self) -> TimeRanges;

    fn playback_rate(&self) -> f64;

    fn set_playback_rate(&self, rate: f64);

    fn is_paused(&self) -> bool;

    fn error_code(&self) -> Option<u16>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Seeking,
    Error(Option<u16>),
    Play,
    Pause,
    Ended,
    RateChange,
}

/// Everything a session needs from the platform.
pub struct Host {
    pub element: Arc<dyn MediaElement>,
    pub media_source: Arc<dyn MediaSource>,
    pub events: mpsc::UnboundedReceiver<HostEvent>,
}

/// Human readable message for an HTML media error code.
pub fn media_error_message(code: Option<u16>) -> String {
    match code {
        Some(1) => "Playback was aborted".to_string(),
        Some(2) => "A network error interrupted playback".to_string(),
        Some(3) => "The media could not be decoded".to_string(),
        Some(4) => "The media format is not supported".to_string(),
        Some(code) => format!("Unknown media error {code}"),
        None => "Unknown media error".to_string(),
    }
}
