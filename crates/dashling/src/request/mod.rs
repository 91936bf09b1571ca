mod manager;

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use self::manager::{Completion, RequestManager};
use crate::{
    error::{DashlingError, DashlingResult},
    fragment::LoadState,
    manifest::StreamType,
    settings::Settings,
};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Payload and timing of one successful transfer.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub data: Bytes,
    pub requested_at: Instant,
    pub time_at_first_byte: Instant,
    pub time_at_last_byte: Instant,
    pub retries: u32,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Performs a single GET. Non-2xx responses are errors.
    async fn get(&self, url: &Url) -> DashlingResult<Fetched>;
}

/// [`Transport`] over a shared `reqwest` client.
#[derive(Clone, Default)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> DashlingResult<Fetched> {
        let requested_at = Instant::now();
        let mut response = self.client.get(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(DashlingError::HttpError(response.status()));
        }

        let mut time_at_first_byte = None;
        let mut data = BytesMut::new();
        while let Some(chunk) = response.chunk().await? {
            time_at_first_byte.get_or_insert_with(Instant::now);
            data.extend_from_slice(&chunk);
        }
        let time_at_last_byte = Instant::now();

        Ok(Fetched {
            data: data.freeze(),
            requested_at,
            time_at_first_byte: time_at_first_byte.unwrap_or(time_at_last_byte),
            time_at_last_byte,
            retries: 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delays: Vec<Duration>,
    /// Bound on every single attempt.
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            delays: settings
                .delays_between_retries_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            timeout: settings.request_timeout(),
        }
    }

    /// Backoff before retry number `attempt`. The last delay repeats.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delays
            .get(attempt as usize)
            .or(self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

/// Fetches `url`, retrying transient failures until the policy is exhausted.
///
/// Cancelling `cancel` resolves to [`DashlingError::Aborted`] at once, even
/// while waiting out a backoff.
pub async fn fetch_with_retry(
    transport: &dyn Transport,
    url: &Url,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> DashlingResult<Fetched> {
    let mut attempt = 0;
    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(DashlingError::Aborted),
            result = tokio::time::timeout(policy.timeout, transport.get(url)) => {
                result.unwrap_or(Err(DashlingError::Timeout(policy.timeout)))
            }
        };

        match result {
            Ok(mut fetched) => {
                fetched.retries = attempt;
                return Ok(fetched);
            }
            Err(e) if e.is_retriable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                attempt += 1;
                log::warn!(
                    "Request to {url} failed: {e}. Retrying in {delay:?} ({attempt}/{})",
                    policy.max_retries
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DashlingError::Aborted),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Manifest,
    Init,
    Media,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RequestTiming {
    pub requested_at: Option<Instant>,
    pub time_at_first_byte: Option<Instant>,
    pub time_at_last_byte: Option<Instant>,
}

impl RequestTiming {
    pub fn wait(&self) -> Option<Duration> {
        Some(self.time_at_first_byte?.duration_since(self.requested_at?))
    }

    pub fn receive(&self) -> Option<Duration> {
        Some(self.time_at_last_byte?.duration_since(self.time_at_first_byte?))
    }

    pub fn total(&self) -> Option<Duration> {
        Some(self.time_at_last_byte?.duration_since(self.requested_at?))
    }
}

/// One logical fetch, including every retry it takes.
#[derive(Debug)]
pub struct Request {
    pub id: u64,
    pub url: Url,
    pub kind: RequestKind,
    pub stream_type: Option<StreamType>,
    pub quality: Option<usize>,
    pub fragment_index: Option<usize>,
    pub state: LoadState,
    pub data: Option<Bytes>,
    pub timing: RequestTiming,
    pub retries: u32,
    pub status_code: Option<u16>,
    cancel: Option<CancellationToken>,
}

impl Request {
    pub fn new(url: Url, kind: RequestKind) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            url,
            kind,
            stream_type: None,
            quality: None,
            fragment_index: None,
            state: LoadState::Idle,
            data: None,
            timing: RequestTiming::default(),
            retries: 0,
            status_code: None,
            cancel: None,
        }
    }

    pub fn init(url: Url, stream_type: StreamType, quality: usize) -> Self {
        let mut request = Self::new(url, RequestKind::Init);
        request.stream_type = Some(stream_type);
        request.quality = Some(quality);
        request
    }

    pub fn media(url: Url, stream_type: StreamType, quality: usize, index: usize) -> Self {
        let mut request = Self::new(url, RequestKind::Media);
        request.stream_type = Some(stream_type);
        request.quality = Some(quality);
        request.fragment_index = Some(index);
        request
    }

    pub fn bytes_loaded(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.len())
    }

    /// Fetches in place, for requests that are not pooled by a [`RequestManager`].
    pub async fn fetch(
        &mut self,
        transport: &dyn Transport,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> DashlingResult<()> {
        let token = cancel.child_token();
        self.begin(token.clone());

        let result = fetch_with_retry(transport, &self.url, policy, &token).await;
        self.finish(result)
    }

    pub(crate) fn begin(&mut self, cancel: CancellationToken) {
        self.cancel = Some(cancel);
        self.state = LoadState::Downloading;
        self.timing.requested_at = Some(Instant::now());
    }

    /// Records the outcome of a transfer started by [`Request::begin`].
    pub(crate) fn finish(&mut self, result: DashlingResult<Fetched>) -> DashlingResult<()> {
        self.cancel = None;
        match result {
            Ok(fetched) => {
                self.timing = RequestTiming {
                    requested_at: Some(fetched.requested_at),
                    time_at_first_byte: Some(fetched.time_at_first_byte),
                    time_at_last_byte: Some(fetched.time_at_last_byte),
                };
                self.retries = fetched.retries;
                self.status_code = Some(200);
                self.data = Some(fetched.data);
                self.state = LoadState::Downloaded;
                Ok(())
            }
            Err(e) => {
                if let DashlingError::HttpError(status) = &e {
                    self.status_code = Some(status.as_u16());
                }
                self.state = if e.is_aborted() {
                    LoadState::Aborted
                } else {
                    LoadState::Error
                };
                Err(e)
            }
        }
    }

    /// Aborts an in-flight transfer. The completion will report [`DashlingError::Aborted`].
    pub fn abort(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if self.state == LoadState::Downloading {
            self.state = LoadState::Aborted;
        }
    }

    pub fn dispose(&mut self) {
        self.abort();
        self.data = None;
    }
}
