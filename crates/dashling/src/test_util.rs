use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::Instant;
use url::Url;

use crate::{
    error::{DashlingError, DashlingResult},
    event::{EventEmitter, SessionEvent},
    manifest::{Manifest, Quality, StreamInfo, StreamType, TimelineEntry},
    request::{Fetched, Transport},
    storage::MemoryStore,
    SessionContext,
};

/// In-process transport with scripted latency and failures.
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    latency: Duration,
    hang: bool,
    failures: Mutex<Vec<(String, reqwest::StatusCode)>>,
    slow: Option<(Vec<String>, Duration)>,
    calls: Mutex<Vec<Url>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Uses `latency` instead for URLs containing every one of `patterns`.
    pub fn slow_matching(mut self, patterns: &[&str], latency: Duration) -> Self {
        let patterns = patterns.iter().map(|p| p.to_string()).collect();
        self.slow = Some((patterns, latency));
        self
    }

    /// Requests never complete unless aborted.
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn fail_matching(self, pattern: &str, status: reqwest::StatusCode) -> Self {
        self.failures
            .lock()
            .unwrap()
            .push((pattern.to_string(), status));
        self
    }

    pub fn calls(&self) -> Vec<Url> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn get(&self, url: &Url) -> DashlingResult<Fetched> {
        self.calls.lock().unwrap().push(url.clone());
        let requested_at = Instant::now();

        if self.hang {
            std::future::pending::<()>().await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| url.as_str().contains(pattern.as_str()))
            .map(|(_, status)| *status);
        if let Some(status) = failure {
            return Err(DashlingError::HttpError(status));
        }

        let latency = match &self.slow {
            Some((patterns, latency))
                if patterns.iter().all(|p| url.as_str().contains(p.as_str())) =>
            {
                *latency
            }
            _ => self.latency,
        };
        tokio::time::sleep(latency / 2).await;
        let time_at_first_byte = Instant::now();
        tokio::time::sleep(latency / 2).await;

        Ok(Fetched {
            data: Bytes::from(vec![0u8; 1000]),
            requested_at,
            time_at_first_byte,
            time_at_last_byte: Instant::now(),
            retries: 0,
        })
    }
}

/// Three qualities per stream and `count` fragments of `length` seconds each.
pub(crate) fn test_manifest(types: &[StreamType], count: usize, length: f64) -> Manifest {
    let base_url = Url::parse("https://example.com/content/").unwrap();
    let streams = types
        .iter()
        .map(|&stream_type| {
            let qualities = [100_000, 500_000, 2_000_000]
                .into_iter()
                .enumerate()
                .map(|(i, bandwidth)| Quality {
                    id: format!("{stream_type}{i}"),
                    bandwidth,
                    width: None,
                    height: None,
                })
                .collect();
            let timeline = (0..count)
                .map(|i| TimelineEntry {
                    start: (i as f64 * length * 1000.0) as u64,
                    start_seconds: i as f64 * length,
                    length: (length * 1000.0) as u64,
                    length_seconds: length,
                    server_segment_index: Some(i as u64 + 1),
                })
                .collect();
            let info = StreamInfo {
                stream_type,
                mime_type: format!("{stream_type}/mp4"),
                codecs: match stream_type {
                    StreamType::Audio => "mp4a.40.2".to_string(),
                    StreamType::Video => "avc1.4d401f".to_string(),
                },
                base_url: base_url.clone(),
                init_url_format: "$RepresentationID$/init.mp4".to_string(),
                frag_url_format: "$RepresentationID$/$Number$.m4s".to_string(),
                qualities,
                timeline,
            };
            (stream_type, info)
        })
        .collect::<BTreeMap<_, _>>();

    Manifest {
        base_url,
        media_duration: count as f64 * length,
        streams,
    }
}

pub(crate) fn test_context(transport: Arc<ScriptedTransport>) -> SessionContext {
    SessionContext {
        transport,
        store: Arc::new(MemoryStore::new()),
        events: EventEmitter::<SessionEvent>::default(),
    }
}
