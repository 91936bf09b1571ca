use std::{ops::RangeInclusive, sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::DashlingError,
    event::{EventEmitter, SessionEvent, SessionState},
    fragment::LoadState,
    host::{media_error_message, HostEvent, MediaElement, MediaSource},
    manifest::{Manifest, StreamType},
    metric::MetricSet,
    request::Transport,
    settings::Settings,
    storage::BandwidthStore,
    stream::{Stream, StreamMessage},
    throttle::{sleep_until, Debounce},
};

/// Slack behind the playhead when computing the fragments worth keeping.
const SEEK_TOLERANCE: f64 = 0.5;
/// Buffer left ahead of the playhead below which a stall check is armed.
const UNDERRUN_THRESHOLD: f64 = 0.1;
/// Steps the playhead may be nudged forward to get past a tiny gap while buffering.
const WIGGLE_STEP: f64 = 0.1;
const MAX_WIGGLE: f64 = 0.5;
/// Buffered content ending this close to the duration counts as reaching the end.
const END_TOLERANCE: f64 = 0.8;

const STALL_CONFIRMATION: Duration = Duration::from_millis(200);
const SEEK_DEBOUNCE: Duration = Duration::from_millis(300);
const FULL_BUFFER_POLL: Duration = Duration::from_millis(300);

/// Collaborators shared by every stream of a session.
#[derive(Clone)]
pub struct SessionContext {
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn BandwidthStore>,
    pub events: EventEmitter<SessionEvent>,
}

/// Result of one scheduling pass.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DownloadCandidates {
    /// Fragment indexes to request, one list per stream in stream order.
    pub indexes: Vec<Vec<usize>>,
    /// Nothing to do because the buffer window is already covered.
    pub is_at_max: bool,
}

impl DownloadCandidates {
    pub fn is_empty(&self) -> bool {
        self.indexes.iter().all(Vec::is_empty)
    }
}

/// Drives all streams of a session.
///
/// ```text
///  host events ──┐          ┌──────────────────────┐   load    ┌────────┐
///  health tick ──┼─────────►│   StreamController   ├──────────►│ Stream ├──► RequestManager
///  timers ───────┘          │                      │  append   │        ├──► sink worker
///                           │  append_index        ├──────────►│        │
///                           │  can_play / stalls   │◄──────────┤        │
///                           └──────────────────────┘  messages └────────┘
/// ```
///
/// Everything runs on one task. Transfers and appends complete on their
/// own tasks and report back as [`StreamMessage`]s.
pub struct StreamController {
    manifest: Arc<Manifest>,
    settings: Arc<Settings>,
    element: Arc<dyn MediaElement>,
    media_source: Arc<dyn MediaSource>,
    streams: Vec<Stream>,
    messages: mpsc::UnboundedReceiver<StreamMessage>,
    events: EventEmitter<SessionEvent>,

    append_index: usize,
    can_play: bool,
    stalls: u64,
    buffer_rate: MetricSet,
    last_append_at: Instant,
    state: SessionState,
    failure: Option<DashlingError>,
    has_signaled_end: bool,

    /// Playhead position that was set by us and must not count as a user seek.
    internal_seek: Option<f64>,
    stall_check: Option<(Instant, f64)>,
    seek: Debounce,
    load_retry: Option<Instant>,

    cancel: CancellationToken,
    is_disposed: bool,
}

impl StreamController {
    pub fn new(
        manifest: Manifest,
        settings: Settings,
        element: Arc<dyn MediaElement>,
        media_source: Arc<dyn MediaSource>,
        context: SessionContext,
        cancel: CancellationToken,
    ) -> Self {
        let manifest = Arc::new(manifest);
        let settings = Arc::new(settings);
        let (sender, messages) = mpsc::unbounded_channel();

        let streams = StreamType::ALL
            .iter()
            .filter_map(|stream_type| manifest.stream(*stream_type))
            .map(|info| {
                Stream::new(
                    info.clone(),
                    settings.clone(),
                    media_source.clone(),
                    &context,
                    sender.clone(),
                    cancel.child_token(),
                )
            })
            .collect();

        Self {
            manifest,
            settings,
            element,
            media_source,
            streams,
            messages,
            events: context.events,
            append_index: 0,
            can_play: false,
            stalls: 0,
            buffer_rate: MetricSet::new(5),
            last_append_at: Instant::now(),
            state: SessionState::Initializing,
            failure: None,
            has_signaled_end: false,
            internal_seek: None,
            stall_check: None,
            seek: Debounce::new(SEEK_DEBOUNCE),
            load_retry: None,
            cancel,
            is_disposed: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stalls(&self) -> u64 {
        self.stalls
    }

    pub fn can_play(&self) -> bool {
        self.can_play
    }

    pub fn append_index(&self) -> usize {
        self.append_index
    }

    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Seconds of media appended per wall clock second.
    pub fn buffer_rate(&self) -> Option<f64> {
        self.buffer_rate.average()
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed
    }

    /// The error that ended the session, if any.
    pub fn take_failure(&mut self) -> Option<DashlingError> {
        self.failure.take()
    }

    /// Creates the source buffers and kicks off the first load cycle.
    pub fn start(&mut self) {
        if self.is_disposed {
            return;
        }

        for stream in &mut self.streams {
            if let Err(e) = stream.initialize() {
                self.fail(e);
                return;
            }
        }

        self.can_play = false;
        if let Some(start_time) = Arc::make_mut(&mut self.settings).start_time.take() {
            let start_time = start_time.clamp(0.0, self.manifest.media_duration.max(0.0));
            tracing::info!("Starting playback at {start_time:.3}s");
            self.internal_seek = Some(start_time);
            self.element.set_current_time(start_time);
            self.append_index = self.index_at(start_time);
        }

        self.update_state();
        self.load_next();
    }

    /// Runs until disposed, failed, or the host goes away.
    pub async fn run(&mut self, mut host_events: mpsc::UnboundedReceiver<HostEvent>) {
        self.start();

        let mut health = tokio::time::interval(self.settings.health_check_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.is_disposed {
            let cancel = self.cancel.clone();
            let seek_deadline = self.seek.deadline();
            let stall_deadline = self.stall_check.map(|(deadline, _)| deadline);
            let load_deadline = self.load_retry;

            tokio::select! {
                _ = cancel.cancelled() => self.dispose(),
                event = host_events.recv() => match event {
                    Some(event) => self.on_host_event(event),
                    None => {
                        tracing::debug!("Host event channel closed");
                        self.dispose();
                    }
                },
                Some(message) = self.messages.recv() => self.on_stream_message(message),
                _ = health.tick() => self.check_playback(),
                _ = sleep_until(seek_deadline) => self.on_throttled_seek(),
                _ = sleep_until(stall_deadline) => self.on_stall_timer(),
                _ = sleep_until(load_deadline) => {
                    self.load_retry = None;
                    self.load_next();
                }
            }
        }
    }

    pub fn on_host_event(&mut self, event: HostEvent) {
        if self.is_disposed {
            return;
        }
        match event {
            HostEvent::Seeking => self.on_seeking(),
            HostEvent::Error(code) => {
                let code = code.or_else(|| self.element.error_code());
                self.fail(DashlingError::VideoElement(media_error_message(code)));
            }
            HostEvent::Play | HostEvent::Pause => self.update_state(),
            HostEvent::RateChange => self.update_state(),
            HostEvent::Ended => {
                tracing::info!(stalls = self.stalls, "Playback ended");
                self.update_state();
            }
        }
    }

    pub(crate) fn on_stream_message(&mut self, message: StreamMessage) {
        if self.is_disposed {
            return;
        }
        match message {
            StreamMessage::FragmentLoaded {
                stream_type,
                index,
                request_id,
                result,
            } => {
                let Some(stream) = self.stream_mut(stream_type) else {
                    return;
                };
                match stream.on_fragment_loaded(index, request_id, result) {
                    Ok(true) => {
                        self.try_append();
                        self.load_next();
                    }
                    Ok(false) => self.load_next(),
                    Err(e) => self.fail(e),
                }
            }
            StreamMessage::InitLoaded {
                stream_type,
                quality,
                request_id,
                result,
            } => {
                let Some(stream) = self.stream_mut(stream_type) else {
                    return;
                };
                match stream.on_init_loaded(quality, request_id, result) {
                    Ok(true) => self.try_append(),
                    Ok(false) => {}
                    Err(e) => self.fail(e),
                }
            }
            StreamMessage::Appended {
                stream_type,
                append_id,
                index,
                result,
            } => {
                let current_time = self.element.current_time();
                let Some(stream) = self.stream_mut(stream_type) else {
                    return;
                };
                match stream.on_appended(append_id, index, result, current_time) {
                    Ok(_) => {
                        self.try_append();
                        self.check_playback();
                        self.load_next();
                    }
                    Err(e) => self.fail(e),
                }
            }
        }
    }

    fn stream_mut(&mut self, stream_type: StreamType) -> Option<&mut Stream> {
        self.streams
            .iter_mut()
            .find(|s| s.stream_type() == stream_type)
    }

    fn fragment_count(&self) -> usize {
        self.streams
            .iter()
            .map(Stream::fragment_count)
            .min()
            .unwrap_or(0)
    }

    fn index_at(&self, time: f64) -> usize {
        self.streams
            .first()
            .map(|s| s.index_at(time))
            .unwrap_or(0)
            .min(self.fragment_count().saturating_sub(1))
    }

    /// Appends as far as every stream allows, one fragment index at a time.
    ///
    /// A fragment is only appended once it is appendable in every stream that
    /// still lacks it. `append_index` moves once all streams hold that index in
    /// their buffer.
    pub fn try_append(&mut self) {
        if self.is_disposed {
            return;
        }

        let count = self.fragment_count();
        loop {
            if self.append_index >= count {
                self.signal_end_of_stream();
                break;
            }

            let index = self.append_index;
            let current_time = self.element.current_time();
            let is_appended = |stream: &Stream| {
                stream.fragment_state(index) == Some(LoadState::Appended)
                    && !stream.is_missing(index, current_time)
            };
            if !self.streams.iter().all(is_appended) {
                let is_ready = self
                    .streams
                    .iter()
                    .filter(|s| s.fragment_state(index) != Some(LoadState::Appended))
                    .all(|s| s.can_append(index));
                if is_ready {
                    for stream in &mut self.streams {
                        if stream.fragment_state(index) != Some(LoadState::Appended) {
                            stream.append(index);
                        }
                    }
                }
                break;
            }

            let now = Instant::now();
            let elapsed = now.duration_since(self.last_append_at).as_secs_f64();
            if elapsed > 0.0 {
                let seconds = self.streams[0].fragments()[index].time.length_seconds;
                self.buffer_rate.add(seconds / elapsed);
            }
            self.last_append_at = now;
            self.append_index += 1;
        }
    }

    fn signal_end_of_stream(&mut self) {
        if self.has_signaled_end || !self.media_source.is_open() {
            return;
        }
        self.has_signaled_end = true;
        tracing::info!("All fragments appended, signaling end of stream");
        self.media_source.end_of_stream();
    }

    fn is_at_end_of_content(&self) -> bool {
        self.append_index >= self.fragment_count()
    }

    /// Decides what each stream may download right now.
    pub fn get_download_candidates(&mut self) -> DownloadCandidates {
        let mut candidates = DownloadCandidates {
            indexes: vec![Vec::new(); self.streams.len()],
            is_at_max: false,
        };
        if self.streams.is_empty() || self.is_at_end_of_content() {
            return candidates;
        }

        let current_time = self.element.current_time();
        let range = self.valid_range(current_time);

        for stream in &mut self.streams {
            stream.assess_quality();
            for index in range.clone() {
                if stream.reset_if_missing(index, current_time) {
                    self.append_index = self.append_index.min(index);
                }
            }
        }

        let first = self
            .streams
            .iter()
            .filter_map(|s| s.first_idle_in(range.clone()))
            .min();
        let Some(first) = first else {
            candidates.is_at_max = true;
            return candidates;
        };

        let range = first..=*range.end();
        for (stream, indexes) in self.streams.iter().zip(candidates.indexes.iter_mut()) {
            *indexes = stream.downloadable_indexes(range.clone());
        }
        candidates
    }

    fn valid_range(&self, current_time: f64) -> RangeInclusive<usize> {
        let start = self.index_at(current_time - SEEK_TOLERANCE);
        let end = self.index_at(current_time + self.settings.max_buffer_seconds);
        start..=end.max(start)
    }

    /// Issues loads for the current candidates, staggering requests within a stream.
    pub fn load_next(&mut self) {
        if self.is_disposed {
            return;
        }

        let candidates = self.get_download_candidates();
        let now = Instant::now();
        let mut retry_at: Option<Instant> = None;
        let mut failure = None;

        'streams: for (stream, indexes) in self.streams.iter_mut().zip(candidates.indexes) {
            for index in indexes {
                if let Some(delay) = stream.stagger_delay(now) {
                    let at = now + delay;
                    retry_at = Some(retry_at.map_or(at, |r| r.min(at)));
                    break;
                }
                if let Err(e) = stream.load(index) {
                    failure = Some(e);
                    break 'streams;
                }
            }
        }
        if let Some(e) = failure {
            self.fail(e);
            return;
        }

        if candidates.is_at_max && retry_at.is_none() {
            retry_at = Some(now + FULL_BUFFER_POLL);
        }
        if let Some(at) = retry_at {
            self.load_retry = Some(self.load_retry.map_or(at, |r| r.min(at)));
        }
    }

    /// Seconds of contiguous media buffered ahead of `time`.
    ///
    /// Infinite once the buffer reaches the end of the content.
    pub fn time_until_underrun(&self, time: f64) -> f64 {
        let duration = self.manifest.media_duration;
        let Some((_, end)) = self.element.buffered().range_containing(time) else {
            return 0.0;
        };
        if end >= duration - END_TOLERANCE {
            return f64::INFINITY;
        }
        (end - time).max(0.0)
    }

    /// Re-evaluates whether playback may continue, arming a stall check when it may not.
    pub fn check_playback(&mut self) {
        if self.is_disposed {
            return;
        }

        let current_time = self.element.current_time();
        let safe = self.settings.safe_buffer_seconds;
        let until = self.time_until_underrun(current_time);

        if self.can_play {
            if until < UNDERRUN_THRESHOLD
                && self.stall_check.is_none()
                && !self.element.is_paused()
            {
                self.stall_check = Some((Instant::now() + STALL_CONFIRMATION, current_time));
            }
        } else if until > safe {
            self.can_play = true;
        } else {
            let mut wiggle = WIGGLE_STEP;
            while wiggle <= MAX_WIGGLE + 1e-9 {
                if self.time_until_underrun(current_time + wiggle) > safe {
                    tracing::debug!("Skipping a {wiggle:.1}s gap at {current_time:.3}s");
                    self.internal_seek = Some(current_time + wiggle);
                    self.element.set_current_time(current_time + wiggle);
                    self.can_play = true;
                    break;
                }
                wiggle += WIGGLE_STEP;
            }
        }

        self.update_state();
    }

    /// Declares a stall if the playhead has not moved since the check was armed.
    pub fn on_stall_timer(&mut self) {
        let Some((_, armed_at)) = self.stall_check.take() else {
            return;
        };
        if self.is_disposed {
            return;
        }

        let current_time = self.element.current_time();
        if self.can_play && (current_time - armed_at).abs() < f64::EPSILON {
            self.stalls += 1;
            self.can_play = false;
            tracing::warn!(stalls = self.stalls, "Playback stalled at {current_time:.3}s");
            self.update_state();
        }
        self.check_playback();
    }

    fn update_state(&mut self) {
        if self.is_disposed || self.failure.is_some() {
            return;
        }

        let rate = if self.can_play { 1.0 } else { 0.0 };
        if self.element.playback_rate() != rate {
            self.element.set_playback_rate(rate);
        }

        let state = if !self.can_play {
            SessionState::Buffering
        } else if self.element.is_paused() {
            SessionState::Paused
        } else {
            SessionState::Playing
        };
        self.set_state(state, None);
    }

    fn set_state(&mut self, state: SessionState, error: Option<&DashlingError>) {
        if state == self.state {
            return;
        }
        tracing::info!("Session state {} -> {}", self.state, state);
        self.state = state;
        self.events.emit(SessionEvent::StateChange {
            state,
            error_type: error.map(DashlingError::error_type),
            error_message: error.map(ToString::to_string),
        });
    }

    pub fn on_seeking(&mut self) {
        if self.is_disposed {
            return;
        }
        if let Some(position) = self.internal_seek.take() {
            if (self.element.current_time() - position).abs() < 1e-6 {
                return;
            }
        }

        self.can_play = false;
        self.stall_check = None;
        self.update_state();
        self.seek.trigger();
    }

    /// Acts on a seek once scrubbing has settled.
    pub fn on_throttled_seek(&mut self) {
        if !self.seek.take() || self.is_disposed {
            return;
        }

        let current_time = self.element.current_time();
        let target = self.index_at(current_time);
        let is_covered = self
            .element
            .buffered()
            .range_containing(current_time)
            .is_some_and(|(_, end)| end - current_time >= SEEK_TOLERANCE);

        tracing::info!(
            from = self.append_index,
            to = target,
            "Seeked to {current_time:.3}s"
        );
        if self.manifest.media_duration > self.settings.max_buffer_seconds && !is_covered {
            for stream in &mut self.streams {
                stream.clear_buffer();
            }
            self.has_signaled_end = false;
        } else if target > self.append_index {
            for stream in &mut self.streams {
                stream.abort_all();
            }
        }
        self.append_index = target;

        self.try_append();
        self.check_playback();
        self.load_next();
    }

    /// Moves the session to the error state and tears everything down.
    pub fn fail(&mut self, error: DashlingError) {
        if self.failure.is_some() || self.is_disposed {
            return;
        }
        tracing::error!("Playback failed: {error}");
        self.set_state(SessionState::Error, Some(&error));
        self.failure = Some(error);
        self.dispose();
    }

    pub fn dispose(&mut self) {
        if self.is_disposed {
            return;
        }
        self.is_disposed = true;
        self.cancel.cancel();
        for stream in &mut self.streams {
            stream.dispose();
        }
        self.seek.cancel();
        self.stall_check = None;
        self.load_retry = None;
    }
}
