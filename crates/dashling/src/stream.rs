use std::{collections::BTreeMap, ops::RangeInclusive, sync::Arc, time::Duration};

use rand::Rng;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    controller::SessionContext,
    error::{DashlingError, DashlingResult},
    fragment::{Fragment, LoadState},
    host::{ChunkKind, MediaSource, SinkChunk, SourceBuffer},
    manifest::{Quality, StreamInfo, StreamType},
    metric::MetricSet,
    request::{Completion, Fetched, Request, RequestManager, RetryPolicy},
    settings::Settings,
    storage::{BandwidthStore, BANDWIDTH_KEY},
    throttle::Throttle,
};

/// Larger tolerance for the first and last fragment absorbs rounding at the content edges.
const EDGE_TOLERANCE: f64 = 0.8;
const INTERIOR_TOLERANCE: f64 = 0.15;
const EPSILON: f64 = 1e-6;

/// Share of a fragment's duration kept free as a download safety margin.
const QUALITY_SAFETY_MARGIN: f64 = 0.4;
/// Headroom applied to the estimated download time when staggering requests.
const STAGGER_RATIO: f64 = 1.4;

/// Completions reported back to the controller's event loop.
#[derive(Debug)]
pub(crate) enum StreamMessage {
    FragmentLoaded {
        stream_type: StreamType,
        index: usize,
        request_id: u64,
        result: DashlingResult<Fetched>,
    },
    InitLoaded {
        stream_type: StreamType,
        quality: usize,
        request_id: u64,
        result: DashlingResult<Fetched>,
    },
    Appended {
        stream_type: StreamType,
        append_id: u64,
        index: usize,
        result: DashlingResult<()>,
    },
}

enum SinkJob {
    Append {
        id: u64,
        index: usize,
        chunks: Vec<SinkChunk>,
        cancel: CancellationToken,
    },
    Remove {
        start: f64,
        end: f64,
    },
}

/// Feeds one source buffer, strictly in submission order.
async fn run_sink(
    stream_type: StreamType,
    buffer: Arc<dyn SourceBuffer>,
    mut jobs: mpsc::UnboundedReceiver<SinkJob>,
    messages: mpsc::UnboundedSender<StreamMessage>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        match job {
            SinkJob::Append {
                id,
                index,
                chunks,
                cancel: append_cancel,
            } => {
                let mut result = Ok(());
                for chunk in chunks {
                    if append_cancel.is_cancelled() {
                        result = Err(DashlingError::Aborted);
                        break;
                    }
                    if let Err(e) = buffer.append(chunk).await {
                        result = Err(e);
                        break;
                    }
                }
                // One tick for the buffered ranges to reflect the write.
                tokio::task::yield_now().await;
                let _ = messages.send(StreamMessage::Appended {
                    stream_type,
                    append_id: id,
                    index,
                    result,
                });
            }
            SinkJob::Remove { start, end } => {
                if let Err(e) = buffer.remove(start, end).await {
                    tracing::warn!(stream = %stream_type, "Failed to clear buffer: {e}");
                }
            }
        }
    }
}

/// Highest quality that downloads comfortably faster than it plays.
///
/// `bytes_per_second` is the observed throughput. Falls back to the lowest quality.
pub fn select_quality(qualities: &[Quality], fragment_seconds: f64, bytes_per_second: f64) -> usize {
    let mut selected = 0;
    for (index, quality) in qualities.iter().enumerate() {
        let download_seconds = quality.bandwidth as f64 / 8.0 * fragment_seconds / bytes_per_second;
        if download_seconds + QUALITY_SAFETY_MARGIN * fragment_seconds < fragment_seconds {
            selected = index;
        }
    }
    selected
}

/// One media type's fragments, quality decisions and source buffer.
pub struct Stream {
    stream_type: StreamType,
    info: StreamInfo,
    settings: Arc<Settings>,
    fragment_seconds: f64,

    quality_index: usize,
    fragments: Vec<Fragment>,
    init_segments: BTreeMap<usize, Request>,
    needs_max_init: bool,

    media_source: Arc<dyn MediaSource>,
    buffer: Option<Arc<dyn SourceBuffer>>,
    sink: Option<mpsc::UnboundedSender<SinkJob>>,
    messages: mpsc::UnboundedSender<StreamMessage>,

    fragment_requests: RequestManager,
    init_requests: RequestManager,
    store: Arc<dyn BandwidthStore>,
    last_request_at: Option<Instant>,

    next_append_id: u64,
    pending_append: Option<(u64, usize)>,
    append_cancel: Option<CancellationToken>,
    append_started_at: Option<Instant>,
    buffer_rate: MetricSet,

    quality_log: Throttle,
    cancel: CancellationToken,
    is_disposed: bool,
}

impl Stream {
    pub(crate) fn new(
        info: StreamInfo,
        settings: Arc<Settings>,
        media_source: Arc<dyn MediaSource>,
        context: &SessionContext,
        messages: mpsc::UnboundedSender<StreamMessage>,
        cancel: CancellationToken,
    ) -> Self {
        let policy = Arc::new(RetryPolicy::from_settings(&settings));
        let manager = || {
            RequestManager::new(
                context.transport.clone(),
                policy.clone(),
                settings.request_cache_threshold(),
                context.events.clone(),
                cancel.child_token(),
            )
        };
        let fragment_requests = manager();
        let init_requests = manager();

        let fragments: Vec<Fragment> = info
            .timeline
            .iter()
            .enumerate()
            .map(|(i, entry)| Fragment::new(i, entry))
            .collect();
        let fragment_seconds = if fragments.is_empty() {
            0.0
        } else {
            fragments.iter().map(|f| f.time.length_seconds).sum::<f64>() / fragments.len() as f64
        };

        let stream_type = info.stream_type;
        let quality_index = settings
            .target_quality
            .get(stream_type)
            .min(info.qualities.len().saturating_sub(1));

        Self {
            stream_type,
            info,
            settings,
            fragment_seconds,
            quality_index,
            fragments,
            init_segments: BTreeMap::new(),
            needs_max_init: true,
            media_source,
            buffer: None,
            sink: None,
            messages,
            fragment_requests,
            init_requests,
            store: context.store.clone(),
            last_request_at: None,
            next_append_id: 0,
            pending_append: None,
            append_cancel: None,
            append_started_at: None,
            buffer_rate: MetricSet::new(5),
            quality_log: Throttle::new(Duration::from_secs(1)),
            cancel,
            is_disposed: false,
        }
    }

    /// Creates the source buffer and prefetches the highest quality init segment.
    pub fn initialize(&mut self) -> DashlingResult<()> {
        let mime_codecs = self.info.mime_codecs();
        let buffer = self
            .media_source
            .add_source_buffer(&mime_codecs)
            .map_err(|e| match e {
                e @ DashlingError::MediaSourceInit(_) => e,
                e => DashlingError::MediaSourceInit(format!("{mime_codecs}: {e}")),
            })?;

        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(run_sink(
            self.stream_type,
            buffer.clone(),
            receiver,
            self.messages.clone(),
            self.cancel.clone(),
        ));
        self.buffer = Some(buffer);
        self.sink = Some(sender);

        tracing::info!(
            stream = %self.stream_type,
            qualities = self.info.qualities.len(),
            fragments = self.fragments.len(),
            "Created source buffer for {mime_codecs}"
        );

        self.ensure_init_segment(self.max_quality())
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn quality_index(&self) -> usize {
        self.quality_index
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn fragment_state(&self, index: usize) -> Option<LoadState> {
        self.fragments.get(index).map(|f| f.state)
    }

    pub fn is_appending(&self) -> bool {
        self.pending_append.is_some()
    }

    pub fn active_request_count(&self) -> usize {
        self.fragment_requests.active_count()
    }

    /// Number of times in-flight fragment requests were aborted.
    pub fn abort_generation(&self) -> u64 {
        self.fragment_requests.generation()
    }

    pub fn buffer_rate(&self) -> Option<f64> {
        self.buffer_rate.average()
    }

    fn max_quality(&self) -> usize {
        self.info.qualities.len().saturating_sub(1)
    }

    /// Fetches the init segment for `quality` unless it is already loaded or loading.
    pub fn ensure_init_segment(&mut self, quality: usize) -> DashlingResult<()> {
        if self.init_segments.contains_key(&quality) {
            return Ok(());
        }

        let url = self.info.init_url(quality)?;
        let mut request = Request::init(url, self.stream_type, quality);
        let messages = self.messages.clone();
        let stream_type = self.stream_type;
        let request_id = request.id;
        self.init_requests.start(&mut request, move |result| {
            let _ = messages.send(StreamMessage::InitLoaded {
                stream_type,
                quality,
                request_id,
                result,
            });
        });
        self.init_segments.insert(quality, request);
        Ok(())
    }

    fn is_init_loaded(&self, quality: usize) -> bool {
        self.init_segments
            .get(&quality)
            .is_some_and(|r| r.state == LoadState::Downloaded)
    }

    /// Downloaded, with both its own and the highest quality init segment at hand.
    pub fn can_append(&self, index: usize) -> bool {
        let Some(fragment) = self.fragments.get(index) else {
            return false;
        };
        let Some(quality) = fragment.quality_index else {
            return false;
        };
        fragment.state == LoadState::Downloaded
            && self.is_init_loaded(quality)
            && self.is_init_loaded(self.max_quality())
    }

    fn init_chunk(&self, quality: usize) -> Option<SinkChunk> {
        let data = self.init_segments.get(&quality)?.data.clone()?;
        Some(SinkChunk {
            data,
            kind: ChunkKind::Init { quality },
        })
    }

    /// Queues fragment `index` on the source buffer. At most one append is in flight.
    ///
    /// Returns whether an append was started.
    pub fn append(&mut self, index: usize) -> bool {
        if self.is_disposed || self.pending_append.is_some() || !self.can_append(index) {
            return false;
        }
        let Some(sink) = self.sink.clone() else {
            return false;
        };

        let fragment = &self.fragments[index];
        let Some(quality) = fragment.quality_index else {
            return false;
        };
        let Some(data) = fragment.request.as_ref().and_then(|r| r.data.clone()) else {
            return false;
        };
        let media = SinkChunk {
            data,
            kind: ChunkKind::Media {
                index,
                start_seconds: fragment.time.start_seconds,
                length_seconds: fragment.time.length_seconds,
            },
        };

        let max_quality = self.max_quality();
        let mut chunks = Vec::with_capacity(3);
        if self.needs_max_init {
            chunks.extend(self.init_chunk(max_quality));
        }
        if !(self.needs_max_init && quality == max_quality) {
            chunks.extend(self.init_chunk(quality));
        }
        chunks.push(media);

        let id = self.next_append_id;
        let cancel = self.cancel.child_token();
        let job = SinkJob::Append {
            id,
            index,
            chunks,
            cancel: cancel.clone(),
        };
        if sink.send(job).is_err() {
            return false;
        }

        self.next_append_id += 1;
        self.pending_append = Some((id, index));
        self.append_cancel = Some(cancel);
        self.append_started_at = Some(Instant::now());
        self.fragments[index].transition(LoadState::Appending);
        tracing::debug!(stream = %self.stream_type, index, quality, "Appending fragment");
        true
    }

    /// Handles the sink's report for an append. Returns whether `index` is now appended.
    pub(crate) fn on_appended(
        &mut self,
        append_id: u64,
        index: usize,
        result: DashlingResult<()>,
        current_time: f64,
    ) -> DashlingResult<bool> {
        match self.pending_append {
            Some((id, pending)) if id == append_id && pending == index => {}
            _ => return Ok(false),
        }
        self.pending_append = None;
        self.append_cancel = None;

        if let Err(e) = result {
            if e.is_aborted() {
                self.fragments[index].transition(LoadState::Idle);
                return Ok(false);
            }
            self.fragments[index].transition(LoadState::Error);
            return Err(DashlingError::MediaSourceAppend {
                stream: self.stream_type,
                index,
                message: e.to_string(),
            });
        }

        if !self.is_buffered(index, current_time) {
            self.fragments[index].transition(LoadState::Error);
            return Err(DashlingError::AppendMissing {
                stream: self.stream_type,
                index,
            });
        }

        let fragment = &mut self.fragments[index];
        fragment.transition(LoadState::Appended);
        if let Some(request) = fragment.request.as_mut() {
            request.data = None;
            request.state = LoadState::Appended;
        }
        self.needs_max_init = false;

        if let Some(started_at) = self.append_started_at.take() {
            let elapsed = started_at.elapsed().as_secs_f64();
            if elapsed > 0.0 {
                self.buffer_rate.add(fragment.time.length_seconds / elapsed);
            }
        }
        tracing::debug!(stream = %self.stream_type, index, "Appended fragment");
        Ok(true)
    }

    /// Starts downloading fragment `index` at the current quality.
    pub fn load(&mut self, index: usize) -> DashlingResult<()> {
        if self.is_disposed {
            return Ok(());
        }
        if self.fragment_state(index) != Some(LoadState::Idle) {
            return Ok(());
        }

        let quality = self.quality_index;
        self.ensure_init_segment(quality)?;

        let url = self.info.fragment_url(quality, index)?;
        let mut request = Request::media(url, self.stream_type, quality, index);
        let messages = self.messages.clone();
        let stream_type = self.stream_type;
        let request_id = request.id;
        self.fragment_requests.start(&mut request, move |result| {
            let _ = messages.send(StreamMessage::FragmentLoaded {
                stream_type,
                index,
                request_id,
                result,
            });
        });

        let fragment = &mut self.fragments[index];
        fragment.quality_index = Some(quality);
        fragment.request = Some(request);
        fragment.transition(LoadState::Downloading);
        self.last_request_at = Some(Instant::now());
        tracing::debug!(stream = %stream_type, index, quality, "Loading fragment");
        Ok(())
    }

    /// Handles a fragment transfer result. Returns whether the fragment is now downloaded.
    pub(crate) fn on_fragment_loaded(
        &mut self,
        index: usize,
        request_id: u64,
        result: DashlingResult<Fetched>,
    ) -> DashlingResult<bool> {
        let Some(fragment) = self.fragments.get_mut(index) else {
            return Ok(false);
        };
        let Some(request) = fragment.request.as_mut().filter(|r| r.id == request_id) else {
            return Ok(false);
        };

        match self.fragment_requests.complete(request, result) {
            Completion::Stale => Ok(false),
            Completion::Done => {
                fragment.transition(LoadState::Downloaded);
                self.persist_bandwidth();
                Ok(true)
            }
            Completion::Aborted => {
                fragment.reset();
                Ok(false)
            }
            Completion::Failed(e) => {
                fragment.transition(LoadState::Error);
                Err(DashlingError::MediaSegmentDownload {
                    stream: self.stream_type,
                    index,
                    source: Box::new(e),
                })
            }
        }
    }

    /// Handles an init segment transfer result. Returns whether it is now downloaded.
    pub(crate) fn on_init_loaded(
        &mut self,
        quality: usize,
        request_id: u64,
        result: DashlingResult<Fetched>,
    ) -> DashlingResult<bool> {
        let Some(request) = self
            .init_segments
            .get_mut(&quality)
            .filter(|r| r.id == request_id)
        else {
            return Ok(false);
        };

        match self.init_requests.complete(request, result) {
            Completion::Stale => Ok(false),
            Completion::Done => Ok(true),
            Completion::Aborted => {
                self.init_segments.remove(&quality);
                Ok(false)
            }
            Completion::Failed(e) => Err(DashlingError::InitSegmentDownload {
                stream: self.stream_type,
                quality,
                source: Box::new(e),
            }),
        }
    }

    /// Measured throughput, else the persisted one, else the configured default.
    pub fn bytes_per_second(&self) -> Option<f64> {
        self.fragment_requests
            .bytes_per_second()
            .or_else(|| self.store.get(BANDWIDTH_KEY).filter(|bps| *bps > 0.0))
            .or(self.settings.default_bandwidth)
    }

    fn persist_bandwidth(&self) {
        if self.stream_type != StreamType::Video {
            return;
        }
        if let Some(bps) = self.fragment_requests.bytes_per_second() {
            self.store.set(BANDWIDTH_KEY, bps);
        }
    }

    /// Re-evaluates the quality used for new downloads.
    pub fn assess_quality(&mut self) {
        let max_quality = self.max_quality();
        let target = self.settings.target_quality.get(self.stream_type).min(max_quality);
        let bytes_per_second = self.bytes_per_second();

        let quality = match bytes_per_second {
            _ if !self.settings.is_abr_enabled => target,
            None => target,
            Some(_) if self.settings.is_rbr_enabled => rand::thread_rng().gen_range(0..=max_quality),
            Some(bps) => select_quality(&self.info.qualities, self.fragment_seconds, bps),
        };

        if quality != self.quality_index {
            if self.quality_log.ready() {
                tracing::info!(
                    stream = %self.stream_type,
                    from = self.quality_index,
                    to = quality,
                    bytes_per_second,
                    "Quality changed"
                );
            }
            self.quality_index = quality;
        }
    }

    /// Time to hold off before the next request so bursts do not skew bandwidth samples.
    pub fn stagger_delay(&self, now: Instant) -> Option<Duration> {
        if self.fragment_requests.active_count() == 0 {
            return None;
        }
        let last_request_at = self.last_request_at?;
        let bytes_per_second = self.bytes_per_second()?;
        let quality = self.info.qualities.get(self.quality_index)?;

        let estimate = quality.bandwidth as f64 / 8.0 * self.fragment_seconds / bytes_per_second;
        let stagger = Duration::try_from_secs_f64(estimate * STAGGER_RATIO).ok()?;
        (last_request_at + stagger)
            .checked_duration_since(now)
            .filter(|delay| !delay.is_zero())
    }

    /// Whether a single buffered range covers the fragment.
    ///
    /// When the playhead is inside the fragment only the part ahead of it has to be buffered.
    pub fn is_buffered(&self, index: usize, current_time: f64) -> bool {
        let (Some(fragment), Some(buffer)) = (self.fragments.get(index), self.buffer.as_ref()) else {
            return false;
        };

        let last = self.fragments.len().saturating_sub(1);
        let start_tolerance = if index == 0 {
            EDGE_TOLERANCE
        } else {
            INTERIOR_TOLERANCE
        };
        let end_tolerance = if index == last {
            EDGE_TOLERANCE
        } else {
            INTERIOR_TOLERANCE
        };

        let mut start = fragment.time.start_seconds;
        let end = fragment.time.end_seconds();
        if start <= current_time && current_time <= end {
            start = current_time;
        }

        buffer.buffered().iter().any(|(buffer_start, buffer_end)| {
            buffer_start <= start + start_tolerance + EPSILON
                && buffer_end + EPSILON >= end - end_tolerance
        })
    }

    /// Appended, but gone from the host's buffer.
    pub fn is_missing(&self, index: usize, current_time: f64) -> bool {
        self.fragment_state(index) == Some(LoadState::Appended)
            && !self.is_buffered(index, current_time)
    }

    /// Resets an evicted fragment so it is downloaded again.
    pub fn reset_if_missing(&mut self, index: usize, current_time: f64) -> bool {
        if !self.is_missing(index, current_time) {
            return false;
        }
        tracing::info!(stream = %self.stream_type, index, "Fragment was evicted by the host");
        self.fragments[index].reset()
    }

    pub fn first_idle_in(&self, range: RangeInclusive<usize>) -> Option<usize> {
        range
            .take_while(|i| *i < self.fragments.len())
            .find(|&i| self.fragments[i].state.is_at_most(LoadState::Idle))
    }

    /// Idle fragments from `range.start()` this stream may request now.
    ///
    /// Bounded by the remaining request budget and by the lead count past the start.
    pub fn downloadable_indexes(&self, range: RangeInclusive<usize>) -> Vec<usize> {
        let budget = self
            .settings
            .max_concurrent_requests
            .get(self.stream_type)
            .saturating_sub(self.fragment_requests.active_count());
        if budget == 0 || self.fragments.is_empty() {
            return Vec::new();
        }

        let start = *range.start();
        let lead = self.settings.max_segment_lead_count.get(self.stream_type);
        let end = (*range.end())
            .min(start.saturating_add(lead))
            .min(self.fragments.len() - 1);

        (start..=end)
            .filter(|&i| self.fragments[i].state.is_at_most(LoadState::Idle))
            .take(budget)
            .collect()
    }

    /// Index of the fragment playing at `time`, clamped to the timeline.
    pub fn index_at(&self, time: f64) -> usize {
        let next = self
            .fragments
            .partition_point(|f| f.time.start_seconds <= time + EPSILON);
        next.saturating_sub(1)
    }

    /// Aborts in-flight fragment downloads and returns those fragments to `Idle`.
    pub fn abort_all(&mut self) {
        self.fragment_requests.abort_all();
        for fragment in &mut self.fragments {
            if fragment.state == LoadState::Downloading {
                fragment.reset();
            }
        }
    }

    /// Drops everything appended, keeping fragments that are downloaded but not appended.
    pub fn clear_buffer(&mut self) {
        self.abort_all();

        if let Some(cancel) = self.append_cancel.take() {
            cancel.cancel();
        }
        self.pending_append = None;
        self.append_started_at = None;

        if let Some(buffer) = &self.buffer {
            buffer.abort();
        }
        if let Some(sink) = &self.sink {
            let _ = sink.send(SinkJob::Remove {
                start: 0.0,
                end: f64::INFINITY,
            });
        }

        for fragment in &mut self.fragments {
            if matches!(fragment.state, LoadState::Appending | LoadState::Appended) {
                fragment.reset();
            }
        }
        tracing::info!(stream = %self.stream_type, "Cleared buffer");
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed
    }

    pub fn dispose(&mut self) {
        if self.is_disposed {
            return;
        }
        self.is_disposed = true;

        self.fragment_requests.dispose();
        self.init_requests.dispose();
        if let Some(cancel) = self.append_cancel.take() {
            cancel.cancel();
        }
        self.cancel.cancel();
        self.pending_append = None;
        self.sink = None;

        for fragment in &mut self.fragments {
            if let Some(request) = fragment.request.as_mut() {
                request.dispose();
            }
        }
        for request in self.init_segments.values_mut() {
            request.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::simulated::simulated_host,
        test_util::{test_context, test_manifest, ScriptedTransport},
    };

    fn qualities(bandwidths: &[u64]) -> Vec<Quality> {
        bandwidths
            .iter()
            .enumerate()
            .map(|(i, &bandwidth)| Quality {
                id: i.to_string(),
                bandwidth,
                width: None,
                height: None,
            })
            .collect()
    }

    #[test]
    fn test_select_quality() {
        let qualities = qualities(&[400_000, 1_600_000, 8_000_000]);

        // 1 MB/s can carry 8 Mbps in 2s of a 2s fragment, not with the margin.
        assert_eq!(select_quality(&qualities, 2.0, 1_000_000.0), 1);
        assert_eq!(select_quality(&qualities, 2.0, 10_000_000.0), 2);
        assert_eq!(select_quality(&qualities, 2.0, 1_000.0), 0);
    }

    #[test]
    fn test_select_quality_is_monotonic() {
        let qualities = qualities(&[100_000, 300_000, 900_000, 2_700_000, 8_100_000]);
        let mut previous = 0;
        for step in 1..200 {
            let bytes_per_second = step as f64 * 10_000.0;
            let selected = select_quality(&qualities, 4.0, bytes_per_second);
            assert!(selected >= previous);
            previous = selected;

            let download = qualities[selected].bandwidth as f64 / 8.0 * 4.0 / bytes_per_second;
            if selected > 0 {
                assert!(download < 4.0);
            }
        }
    }

    fn video_stream(
        count: usize,
        length: f64,
        settings: Settings,
    ) -> (Stream, mpsc::UnboundedReceiver<StreamMessage>) {
        let context = test_context(Arc::new(ScriptedTransport::new().hanging()));
        stream_with(&context, count, length, settings)
    }

    fn stream_with(
        context: &SessionContext,
        count: usize,
        length: f64,
        settings: Settings,
    ) -> (Stream, mpsc::UnboundedReceiver<StreamMessage>) {
        let manifest = test_manifest(&[StreamType::Video], count, length);
        let (_host, _element, media_source) = simulated_host();
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut stream = Stream::new(
            manifest.streams[&StreamType::Video].clone(),
            Arc::new(settings),
            media_source,
            context,
            sender,
            CancellationToken::new(),
        );
        stream.initialize().unwrap();
        (stream, receiver)
    }

    #[tokio::test]
    async fn test_buffered_gap_tolerance() {
        let (stream, _messages) = video_stream(4, 5.0, Settings::default());
        let buffer = stream.buffer.clone().unwrap();

        buffer.remove(0.0, f64::INFINITY).await.unwrap();
        let _ = buffer
            .append(SinkChunk {
                data: bytes::Bytes::new(),
                kind: ChunkKind::Media {
                    index: 1,
                    start_seconds: 5.15,
                    length_seconds: 4.7,
                },
            })
            .await;
        assert!(stream.is_buffered(1, 0.0));

        buffer.remove(0.0, f64::INFINITY).await.unwrap();
        let _ = buffer
            .append(SinkChunk {
                data: bytes::Bytes::new(),
                kind: ChunkKind::Media {
                    index: 1,
                    start_seconds: 5.2,
                    length_seconds: 4.65,
                },
            })
            .await;
        assert!(!stream.is_buffered(1, 0.0));

        // The playhead is inside the fragment, only the rest has to be there.
        assert!(stream.is_buffered(1, 5.1));
    }

    #[tokio::test]
    async fn test_downloadable_bounds() {
        let mut settings = Settings::default();
        settings.max_concurrent_requests.video = 3;
        settings.max_segment_lead_count.video = 5;
        let (mut stream, _messages) = video_stream(20, 2.0, settings);

        assert_eq!(stream.downloadable_indexes(2..=19), vec![2, 3, 4]);

        stream.load(2).unwrap();
        stream.load(3).unwrap();
        assert_eq!(stream.active_request_count(), 2);
        assert_eq!(stream.downloadable_indexes(2..=19), vec![4]);
        assert_eq!(stream.downloadable_indexes(10..=11), vec![10]);

        stream.abort_all();
        assert_eq!(stream.active_request_count(), 0);
        assert_eq!(stream.fragment_state(2), Some(LoadState::Idle));
        assert_eq!(stream.downloadable_indexes(2..=19), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_lead_count_bounds_candidates() {
        let mut settings = Settings::default();
        settings.max_concurrent_requests.video = 10;
        settings.max_segment_lead_count.video = 2;
        let (stream, _messages) = video_stream(20, 2.0, settings);

        for start in 0..20 {
            let indexes = stream.downloadable_indexes(start..=19);
            assert!(indexes.len() <= 10);
            assert!(indexes.iter().all(|i| *i <= start + 2));
        }
    }

    #[tokio::test]
    async fn test_index_at() {
        let (stream, _messages) = video_stream(4, 5.0, Settings::default());
        assert_eq!(stream.index_at(-3.0), 0);
        assert_eq!(stream.index_at(0.0), 0);
        assert_eq!(stream.index_at(4.99), 0);
        assert_eq!(stream.index_at(5.0), 1);
        assert_eq!(stream.index_at(100.0), 3);
    }

    #[tokio::test]
    async fn test_quality_falls_back_to_target() {
        let mut settings = Settings::default();
        settings.target_quality.video = 7;
        let (mut stream, _messages) = video_stream(4, 5.0, settings.clone());
        stream.assess_quality();
        assert_eq!(stream.quality_index(), 2);

        settings.target_quality.video = 1;
        settings.default_bandwidth = Some(10_000_000.0);
        settings.is_abr_enabled = false;
        let (mut stream, _messages) = video_stream(4, 5.0, settings.clone());
        stream.assess_quality();
        assert_eq!(stream.quality_index(), 1);

        settings.is_abr_enabled = true;
        let (mut stream, _messages) = video_stream(4, 5.0, settings);
        stream.assess_quality();
        assert_eq!(stream.quality_index(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_random_bitrate_stays_in_range() {
        let mut settings = Settings::default();
        settings.is_rbr_enabled = true;
        settings.default_bandwidth = Some(1.0);
        let (mut stream, _messages) = video_stream(4, 5.0, settings);

        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..200 {
            stream.assess_quality();
            seen.insert(stream.quality_index());
        }
        assert!(seen.iter().all(|quality| *quality <= 2));
        assert!(seen.len() > 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stagger_delay() {
        let mut settings = Settings::default();
        settings.default_bandwidth = Some(250_000.0);
        let (mut stream, _messages) = video_stream(20, 2.0, settings);
        assert_eq!(stream.quality_index(), 2);

        let now = Instant::now();
        assert_eq!(stream.stagger_delay(now), None);

        // 2 Mbps for 2s at 250 kB/s takes 2s, held off 1.4 times as long.
        stream.load(0).unwrap();
        let delay = stream.stagger_delay(now).unwrap();
        assert!((delay.as_secs_f64() - 2.8).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(2)).await;
        let delay = stream.stagger_delay(Instant::now()).unwrap();
        assert!((delay.as_secs_f64() - 0.8).abs() < 1e-6);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(stream.stagger_delay(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_video_bandwidth_is_persisted() {
        let transport = ScriptedTransport::new().with_latency(Duration::from_millis(500));
        let context = test_context(Arc::new(transport));
        let (mut stream, mut messages) = stream_with(&context, 4, 2.0, Settings::default());
        assert_eq!(stream.bytes_per_second(), None);

        stream.load(0).unwrap();
        while let Some(message) = messages.recv().await {
            if let StreamMessage::FragmentLoaded {
                index,
                request_id,
                result,
                ..
            } = message
            {
                assert!(stream.on_fragment_loaded(index, request_id, result).unwrap());
                break;
            }
        }

        let measured = stream.fragment_requests.bytes_per_second();
        assert!(measured.is_some());
        assert_eq!(context.store.get(BANDWIDTH_KEY), measured);

        // A fresh stream without samples starts from the persisted value.
        let (stream, _messages) = stream_with(&context, 4, 2.0, Settings::default());
        assert_eq!(stream.fragment_requests.bytes_per_second(), None);
        assert_eq!(stream.bytes_per_second(), measured);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let (mut stream, _messages) = video_stream(4, 5.0, Settings::default());
        stream.load(0).unwrap();
        stream.dispose();
        stream.dispose();
        assert!(stream.is_disposed());
        assert!(!stream.append(0));
    }
}
