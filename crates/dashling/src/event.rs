use std::fmt;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::manifest::StreamType;

/// Playback state published by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Initializing,
    Buffering,
    Playing,
    Paused,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initializing => "initializing",
            Self::Buffering => "buffering",
            Self::Playing => "playing",
            Self::Paused => "paused",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorType {
    ManifestDownload,
    ManifestParse,
    MediaSourceInit,
    MediaSourceAppend,
    AppendMissing,
    InitSegmentDownload,
    MediaSegmentDownload,
    VideoElement,
    Storage,
}

/// Telemetry for one completed, non cached transfer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadRecord {
    pub request_id: u64,
    pub url: String,
    pub stream_type: Option<StreamType>,
    pub fragment_index: Option<usize>,
    pub quality: Option<usize>,
    pub bytes: usize,
    pub retries: u32,
    pub wait_ms: f64,
    pub receive_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChange {
        state: SessionState,
        error_type: Option<ErrorType>,
        error_message: Option<String>,
    },
    Download(DownloadRecord),
}

/// Event capability embedded by the components that publish [`SessionEvent`]s.
///
/// Clones share one channel. Emitting without subscribers is not an error.
#[derive(Debug, Clone)]
pub struct EventEmitter<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventEmitter<E> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventEmitter<E> {
    fn default() -> Self {
        Self::new(256)
    }
}
