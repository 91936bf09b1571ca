use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::{fetch_with_retry, Fetched, Request, RetryPolicy, Transport};
use crate::{
    error::{DashlingError, DashlingResult},
    event::{DownloadRecord, EventEmitter, SessionEvent},
    metric::MetricSet,
};

const METRIC_WINDOW: usize = 10;

/// How a finished transfer should be treated by its owner.
#[derive(Debug)]
pub enum Completion {
    /// The request was aborted or disposed before its completion arrived.
    Stale,
    Done,
    /// Aborted by us, the owner should quietly reset.
    Aborted,
    Failed(DashlingError),
}

/// Pool of in-flight requests for one channel of one stream.
///
/// Transfers run on spawned tasks and report back through the callback
/// given to [`RequestManager::start`]. The owner hands the result to
/// [`RequestManager::complete`], which drops results of requests that were
/// aborted in the meantime.
pub struct RequestManager {
    transport: Arc<dyn Transport>,
    policy: Arc<RetryPolicy>,
    cache_threshold: Duration,
    events: EventEmitter<SessionEvent>,

    active: HashMap<u64, CancellationToken>,
    generation: u64,

    wait_times: MetricSet,
    receive_times: MetricSet,
    bytes_per_second: MetricSet,

    cancel: CancellationToken,
    is_disposed: bool,
}

impl RequestManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        policy: Arc<RetryPolicy>,
        cache_threshold: Duration,
        events: EventEmitter<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            policy,
            cache_threshold,
            events,
            active: HashMap::new(),
            generation: 0,
            wait_times: MetricSet::new(METRIC_WINDOW),
            receive_times: MetricSet::new(METRIC_WINDOW),
            bytes_per_second: MetricSet::new(METRIC_WINDOW),
            cancel,
            is_disposed: false,
        }
    }

    /// Starts `request` on a background task. `on_complete` runs on that task.
    pub fn start<F>(&mut self, request: &mut Request, on_complete: F)
    where
        F: FnOnce(DashlingResult<Fetched>) + Send + 'static,
    {
        if self.is_disposed {
            on_complete(Err(DashlingError::Aborted));
            return;
        }

        let token = self.cancel.child_token();
        self.active.insert(request.id, token.clone());
        request.begin(token.clone());

        let transport = self.transport.clone();
        let policy = self.policy.clone();
        let url = request.url.clone();
        tracing::debug!(id = request.id, "Requesting {url}");
        tokio::spawn(async move {
            let result = fetch_with_retry(transport.as_ref(), &url, &policy, &token).await;
            on_complete(result);
        });
    }

    pub fn complete(&mut self, request: &mut Request, result: DashlingResult<Fetched>) -> Completion {
        if self.active.remove(&request.id).is_none() {
            return Completion::Stale;
        }

        match request.finish(result) {
            Ok(()) => {
                self.record(request);
                Completion::Done
            }
            Err(e) if e.is_aborted() => Completion::Aborted,
            Err(e) => Completion::Failed(e),
        }
    }

    fn record(&mut self, request: &Request) {
        let timing = request.timing;
        let (Some(wait), Some(receive), Some(total)) =
            (timing.wait(), timing.receive(), timing.total())
        else {
            return;
        };

        if total < self.cache_threshold {
            tracing::trace!(id = request.id, "Cache hit for {}", request.url);
            return;
        }

        let bytes = request.bytes_loaded();
        self.wait_times.add(wait.as_secs_f64() * 1000.0);
        self.receive_times.add(receive.as_secs_f64() * 1000.0);
        if !receive.is_zero() {
            self.bytes_per_second.add(bytes as f64 / receive.as_secs_f64());
        }

        self.events.emit(SessionEvent::Download(DownloadRecord {
            request_id: request.id,
            url: request.url.to_string(),
            stream_type: request.stream_type,
            fragment_index: request.fragment_index,
            quality: request.quality,
            bytes,
            retries: request.retries,
            wait_ms: wait.as_secs_f64() * 1000.0,
            receive_ms: receive.as_secs_f64() * 1000.0,
        }));
    }

    /// Cancels every active transfer. Their completions become [`Completion::Stale`].
    pub fn abort_all(&mut self) {
        for (_, token) in self.active.drain() {
            token.cancel();
        }
        self.generation += 1;
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Number of times [`RequestManager::abort_all`] ran.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bytes_per_second(&self) -> Option<f64> {
        self.bytes_per_second.average().filter(|bps| *bps > 0.0)
    }

    pub fn average_wait_ms(&self) -> Option<f64> {
        self.wait_times.average()
    }

    pub fn average_receive_ms(&self) -> Option<f64> {
        self.receive_times.average()
    }

    pub fn dispose(&mut self) {
        if self.is_disposed {
            return;
        }
        self.is_disposed = true;
        for (_, token) in self.active.drain() {
            token.cancel();
        }
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use url::Url;

    use super::*;
    use crate::{fragment::LoadState, manifest::StreamType, test_util::ScriptedTransport};

    fn manager(transport: Arc<ScriptedTransport>, events: EventEmitter<SessionEvent>) -> RequestManager {
        RequestManager::new(
            transport,
            Arc::new(RetryPolicy {
                max_retries: 0,
                delays: vec![],
                timeout: Duration::from_secs(5),
            }),
            Duration::from_millis(80),
            events,
            CancellationToken::new(),
        )
    }

    async fn run(
        manager: &mut RequestManager,
        request: &mut Request,
    ) -> Completion {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        manager.start(request, move |result| {
            let _ = sender.send(result);
        });
        let result = receiver.recv().await.unwrap();
        manager.complete(request, result)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transfer_is_measured() {
        let transport = Arc::new(ScriptedTransport::new().with_latency(Duration::from_millis(500)));
        let events = EventEmitter::default();
        let mut downloads = events.subscribe();
        let mut manager = manager(transport, events);

        let url = Url::parse("https://example.com/v/1.m4s").unwrap();
        let mut request = Request::media(url, StreamType::Video, 1, 0);
        assert!(matches!(run(&mut manager, &mut request).await, Completion::Done));

        assert_eq!(request.state, LoadState::Downloaded);
        assert_eq!(manager.active_count(), 0);
        assert!(manager.bytes_per_second().is_some());

        let SessionEvent::Download(record) = downloads.recv().await.unwrap() else {
            panic!("expected a download record");
        };
        assert_eq!(record.fragment_index, Some(0));
        assert_eq!(record.quality, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_is_not_measured() {
        let transport = Arc::new(ScriptedTransport::new());
        let events = EventEmitter::default();
        let mut downloads = events.subscribe();
        let mut manager = manager(transport, events);

        let url = Url::parse("https://example.com/v/1.m4s").unwrap();
        let mut request = Request::media(url, StreamType::Video, 0, 0);
        assert!(matches!(run(&mut manager, &mut request).await, Completion::Done));

        assert_eq!(manager.bytes_per_second(), None);
        assert!(downloads.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_all_makes_completion_stale() {
        let transport = Arc::new(ScriptedTransport::new().hanging());
        let mut manager = manager(transport, EventEmitter::default());

        let (sender, mut receiver) = mpsc::unbounded_channel();
        let url = Url::parse("https://example.com/v/1.m4s").unwrap();
        let mut request = Request::media(url, StreamType::Video, 0, 0);
        manager.start(&mut request, move |result| {
            let _ = sender.send(result);
        });
        assert_eq!(manager.active_count(), 1);

        manager.abort_all();
        let result = receiver.recv().await.unwrap();
        assert!(matches!(result, Err(DashlingError::Aborted)));
        assert!(matches!(manager.complete(&mut request, result), Completion::Stale));
        assert_eq!(manager.generation(), 1);

        manager.dispose();
        manager.dispose();
        assert_eq!(manager.active_count(), 0);
    }
}
