use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::manifest::StreamType;

/// A value configured separately for the audio and the video stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerStream<T> {
    pub audio: T,
    pub video: T,
}

impl<T: Copy> PerStream<T> {
    pub const fn new(audio: T, video: T) -> Self {
        Self { audio, video }
    }

    pub fn get(&self, stream_type: StreamType) -> T {
        match stream_type {
            StreamType::Audio => self.audio,
            StreamType::Video => self.video,
        }
    }

    pub fn set(&mut self, stream_type: StreamType, value: T) {
        match stream_type {
            StreamType::Audio => self.audio = value,
            StreamType::Video => self.video = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Pick qualities from measured bandwidth instead of `target_quality`.
    pub is_abr_enabled: bool,
    /// Random bitrate mode, picks a random quality for every fragment.
    pub is_rbr_enabled: bool,
    pub target_quality: PerStream<usize>,

    /// Seconds of media that must be buffered ahead of the playhead before playback may continue.
    pub safe_buffer_seconds: f64,
    pub max_buffer_seconds: f64,

    pub max_concurrent_requests: PerStream<usize>,
    /// How far past the first undownloaded fragment a stream may schedule downloads.
    pub max_segment_lead_count: PerStream<usize>,

    /// Bytes per second assumed before anything has been measured or persisted.
    pub default_bandwidth: Option<f64>,

    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub delays_between_retries_ms: Vec<u64>,
    /// Transfers completing faster than this are treated as cache hits.
    pub request_cache_threshold_ms: u64,

    /// Position applied once when playback starts.
    pub start_time: Option<f64>,
    pub base_url_override: Option<String>,

    pub health_check_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            is_abr_enabled: true,
            is_rbr_enabled: false,
            target_quality: PerStream::new(2, 2),
            safe_buffer_seconds: 12.0,
            max_buffer_seconds: 119.5,
            max_concurrent_requests: PerStream::new(4, 6),
            max_segment_lead_count: PerStream::new(1, 5),
            default_bandwidth: None,
            request_timeout_ms: 30000,
            max_retries: 3,
            delays_between_retries_ms: vec![200, 1500, 3000],
            request_cache_threshold_ms: 80,
            start_time: None,
            base_url_override: None,
            health_check_interval_ms: 200,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms.max(1))
    }

    pub fn request_cache_threshold(&self) -> Duration {
        Duration::from_millis(self.request_cache_threshold_ms)
    }
}
