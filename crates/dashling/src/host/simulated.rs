//! In-memory host used by tests and the headless CLI.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    ChunkKind, Host, HostEvent, MediaElement, MediaSource, SinkChunk, SourceBuffer, TimeRanges,
};
use crate::error::{DashlingError, DashlingResult};

#[derive(Debug, Default)]
struct BufferState {
    ranges: TimeRanges,
    init_appends: Vec<usize>,
    media_appends: Vec<usize>,
    appended_bytes: usize,
    fail_appends: bool,
    drop_media: bool,
    aborts: usize,
}

/// Records appended media ranges, merging adjacent fragments.
#[derive(Debug)]
pub struct SimulatedSourceBuffer {
    mime_codecs: String,
    state: Mutex<BufferState>,
}

impl SimulatedSourceBuffer {
    fn new(mime_codecs: &str) -> Self {
        Self {
            mime_codecs: mime_codecs.to_string(),
            state: Mutex::new(BufferState::default()),
        }
    }

    pub fn mime_codecs(&self) -> &str {
        &self.mime_codecs
    }

    /// Makes every following append fail like a rejected `appendBuffer`.
    pub fn fail_appends(&self, fail: bool) {
        self.state.lock().unwrap().fail_appends = fail;
    }

    /// Accepts media appends without reporting them as buffered.
    pub fn drop_media(&self, drop: bool) {
        self.state.lock().unwrap().drop_media = drop;
    }

    pub fn mark_buffered(&self, start: f64, end: f64) {
        self.state.lock().unwrap().ranges.add(start, end);
    }

    /// Drops a range the way a host does under memory pressure.
    pub fn evict(&self, start: f64, end: f64) {
        self.state.lock().unwrap().ranges.remove(start, end);
    }

    /// Quality of every init segment appended so far, in order.
    pub fn init_appends(&self) -> Vec<usize> {
        self.state.lock().unwrap().init_appends.clone()
    }

    /// Fragment index of every media segment appended so far, in order.
    pub fn media_appends(&self) -> Vec<usize> {
        self.state.lock().unwrap().media_appends.clone()
    }

    pub fn appended_bytes(&self) -> usize {
        self.state.lock().unwrap().appended_bytes
    }

    pub fn abort_count(&self) -> usize {
        self.state.lock().unwrap().aborts
    }
}

#[async_trait]
impl SourceBuffer for SimulatedSourceBuffer {
    async fn append(&self, chunk: SinkChunk) -> DashlingResult<()> {
        tokio::task::yield_now().await;

        let mut state = self.state.lock().unwrap();
        if state.fail_appends {
            return Err(DashlingError::SourceBuffer(format!(
                "{} rejected {} bytes",
                self.mime_codecs,
                chunk.data.len()
            )));
        }

        state.appended_bytes += chunk.data.len();
        match chunk.kind {
            ChunkKind::Init { quality } => state.init_appends.push(quality),
            ChunkKind::Media {
                index,
                start_seconds,
                length_seconds,
            } => {
                state.media_appends.push(index);
                if !state.drop_media {
                    state.ranges.add(start_seconds, start_seconds + length_seconds);
                }
            }
        }
        Ok(())
    }

    async fn remove(&self, start: f64, end: f64) -> DashlingResult<()> {
        tokio::task::yield_now().await;
        self.state.lock().unwrap().ranges.remove(start, end);
        Ok(())
    }

    fn abort(&self) {
        self.state.lock().unwrap().aborts += 1;
    }

    fn buffered(&self) -> TimeRanges {
        self.state.lock().unwrap().ranges.clone()
    }
}

#[derive(Debug)]
struct SourceState {
    buffers: Vec<Arc<SimulatedSourceBuffer>>,
    rejected: Vec<String>,
    is_open: bool,
    duration: f64,
    end_of_stream_calls: usize,
}

#[derive(Debug)]
pub struct SimulatedMediaSource {
    state: Mutex<SourceState>,
}

impl Default for SimulatedMediaSource {
    fn default() -> Self {
        Self {
            state: Mutex::new(SourceState {
                buffers: Vec::new(),
                rejected: Vec::new(),
                is_open: true,
                duration: f64::NAN,
                end_of_stream_calls: 0,
            }),
        }
    }
}

impl SimulatedMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects any `add_source_buffer` call whose type contains `pattern`.
    pub fn reject_codec(&self, pattern: &str) {
        self.state.lock().unwrap().rejected.push(pattern.to_string());
    }

    pub fn source_buffers(&self) -> Vec<Arc<SimulatedSourceBuffer>> {
        self.state.lock().unwrap().buffers.clone()
    }

    /// First source buffer whose type contains `pattern`.
    pub fn source_buffer(&self, pattern: &str) -> Option<Arc<SimulatedSourceBuffer>> {
        self.state
            .lock()
            .unwrap()
            .buffers
            .iter()
            .find(|b| b.mime_codecs.contains(pattern))
            .cloned()
    }

    pub fn end_of_stream_calls(&self) -> usize {
        self.state.lock().unwrap().end_of_stream_calls
    }

    pub fn duration(&self) -> f64 {
        self.state.lock().unwrap().duration
    }

    /// Intersection of every source buffer's ranges.
    pub fn buffered(&self) -> TimeRanges {
        let state = self.state.lock().unwrap();
        let mut buffers = state.buffers.iter();
        let Some(first) = buffers.next() else {
            return TimeRanges::new();
        };
        buffers.fold(first.buffered(), |acc, b| acc.intersect(&b.buffered()))
    }
}

impl MediaSource for SimulatedMediaSource {
    fn add_source_buffer(&self, mime_codecs: &str) -> DashlingResult<Arc<dyn SourceBuffer>> {
        let mut state = self.state.lock().unwrap();
        if state.rejected.iter().any(|r| mime_codecs.contains(r.as_str())) {
            return Err(DashlingError::MediaSourceInit(mime_codecs.to_string()));
        }
        let buffer = Arc::new(SimulatedSourceBuffer::new(mime_codecs));
        state.buffers.push(buffer.clone());
        Ok(buffer)
    }

    fn is_open(&self) -> bool {
        self.state.lock().unwrap().is_open
    }

    fn end_of_stream(&self) {
        let mut state = self.state.lock().unwrap();
        state.is_open = false;
        state.end_of_stream_calls += 1;
    }

    fn set_duration(&self, duration: f64) {
        self.state.lock().unwrap().duration = duration;
    }
}

#[derive(Debug)]
struct ElementState {
    current_time: f64,
    playback_rate: f64,
    paused: bool,
    error: Option<u16>,
    ended: bool,
}

/// A video element whose clock only moves when [`SimulatedElement::advance`] is called.
#[derive(Debug)]
pub struct SimulatedElement {
    media_source: Arc<SimulatedMediaSource>,
    state: Mutex<ElementState>,
    events: mpsc::UnboundedSender<HostEvent>,
}

impl SimulatedElement {
    fn emit(&self, event: HostEvent) {
        let _ = self.events.send(event);
    }

    /// User initiated seek.
    pub fn seek(&self, time: f64) {
        self.set_current_time(time);
    }

    pub fn play(&self) {
        self.state.lock().unwrap().paused = false;
        self.emit(HostEvent::Play);
    }

    pub fn pause(&self) {
        self.state.lock().unwrap().paused = true;
        self.emit(HostEvent::Pause);
    }

    pub fn fail(&self, code: u16) {
        self.state.lock().unwrap().error = Some(code);
        self.emit(HostEvent::Error(Some(code)));
    }

    /// Moves the playhead forward by `seconds` of wall clock time.
    ///
    /// Playback stops at the end of the buffered range containing the
    /// playhead. Reaching the end of the content emits `Ended` once.
    pub fn advance(&self, seconds: f64) -> f64 {
        let buffered = self.media_source.buffered();
        let duration = self.media_source.duration();

        let mut state = self.state.lock().unwrap();
        if state.paused || state.error.is_some() || state.playback_rate <= 0.0 {
            return state.current_time;
        }

        let limit = buffered
            .range_containing(state.current_time)
            .map(|(_, end)| end)
            .unwrap_or(state.current_time);
        let limit = if duration.is_finite() {
            limit.min(duration)
        } else {
            limit
        };

        let next = (state.current_time + seconds * state.playback_rate).min(limit);
        state.current_time = next.max(state.current_time);

        let reached_end = duration.is_finite() && state.current_time >= duration - 1e-3;
        let newly_ended = reached_end && !state.ended;
        state.ended = reached_end;
        let current_time = state.current_time;
        drop(state);

        if newly_ended {
            self.emit(HostEvent::Ended);
        }
        current_time
    }

    pub fn has_ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }
}

impl MediaElement for SimulatedElement {
    fn current_time(&self) -> f64 {
        self.state.lock().unwrap().current_time
    }

    fn set_current_time(&self, time: f64) {
        {
            let mut state = self.state.lock().unwrap();
            state.current_time = time.max(0.0);
            state.ended = false;
        }
        self.emit(HostEvent::Seeking);
    }

    fn duration(&self) -> f64 {
        self.media_source.duration()
    }

    fn buffered(&self) -> TimeRanges {
        self.media_source.buffered()
    }

    fn playback_rate(&self) -> f64 {
        self.state.lock().unwrap().playback_rate
    }

    fn set_playback_rate(&self, rate: f64) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = state.playback_rate != rate;
            state.playback_rate = rate;
            changed
        };
        if changed {
            self.emit(HostEvent::RateChange);
        }
    }

    fn is_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    fn error_code(&self) -> Option<u16> {
        self.state.lock().unwrap().error
    }
}

/// Builds a connected element and media source.
///
/// The element starts unpaused at rate 1, as an autoplaying video would.
pub fn simulated_host() -> (Host, Arc<SimulatedElement>, Arc<SimulatedMediaSource>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let media_source = Arc::new(SimulatedMediaSource::new());
    let element = Arc::new(SimulatedElement {
        media_source: media_source.clone(),
        state: Mutex::new(ElementState {
            current_time: 0.0,
            playback_rate: 1.0,
            paused: false,
            error: None,
            ended: false,
        }),
        events: sender,
    });

    let host = Host {
        element: element.clone(),
        media_source: media_source.clone(),
        events: receiver,
    };
    (host, element, media_source)
}
