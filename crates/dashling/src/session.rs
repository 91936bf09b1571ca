use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{
    controller::{SessionContext, StreamController},
    error::{DashlingError, DashlingResult},
    event::{EventEmitter, SessionEvent, SessionState},
    host::Host,
    manifest::Manifest,
    request::{HttpTransport, Request, RequestKind, RetryPolicy, Transport},
    settings::Settings,
    storage::{BandwidthStore, MemoryStore},
};

/// What a finished session looked like.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSummary {
    pub stalls: u64,
    /// Fragments appended by every stream.
    pub appended: usize,
    /// Seconds of media appended per wall clock second.
    pub buffer_rate: Option<f64>,
}

/// Entry point of a playback session.
///
/// Clones share the same cancellation, so any clone can [`Dashling::dispose`]
/// a session another clone is running.
#[derive(Clone)]
pub struct Dashling {
    settings: Arc<Settings>,
    transport: Arc<dyn Transport>,
    store: Arc<dyn BandwidthStore>,
    events: EventEmitter<SessionEvent>,
    cancel: CancellationToken,
}

impl Dashling {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            transport: Arc::new(HttpTransport::default()),
            store: Arc::new(MemoryStore::new()),
            events: EventEmitter::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Arc::new(transport);
        self
    }

    pub fn with_store(mut self, store: impl BandwidthStore + 'static) -> Self {
        self.store = Arc::new(store);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Plays `url` on `host` until the session is disposed, fails, or the host goes away.
    pub async fn load(&self, host: Host, url: &str) -> DashlingResult<SessionSummary> {
        if self.cancel.is_cancelled() {
            return Err(DashlingError::Aborted);
        }
        self.emit_state(SessionState::Initializing, None);

        let manifest = match self.load_manifest(url).await {
            Ok(manifest) => manifest,
            Err(e) => {
                if !e.is_aborted() {
                    tracing::error!("{e}");
                    self.emit_state(SessionState::Error, Some(&e));
                }
                return Err(e);
            }
        };
        host.media_source.set_duration(manifest.media_duration);

        let mut controller = StreamController::new(
            manifest,
            self.settings.as_ref().clone(),
            host.element,
            host.media_source,
            SessionContext {
                transport: self.transport.clone(),
                store: self.store.clone(),
                events: self.events.clone(),
            },
            self.cancel.child_token(),
        );
        controller.run(host.events).await;

        match controller.take_failure() {
            Some(e) => Err(e),
            None => Ok(SessionSummary {
                stalls: controller.stalls(),
                appended: controller.append_index(),
                buffer_rate: controller.buffer_rate(),
            }),
        }
    }

    async fn load_manifest(&self, url: &str) -> DashlingResult<Manifest> {
        let url = Url::parse(url)?;
        log::info!("Fetching manifest {url}");

        let policy = RetryPolicy::from_settings(&self.settings);
        let mut request = Request::new(url.clone(), RequestKind::Manifest);
        request
            .fetch(self.transport.as_ref(), &policy, &self.cancel)
            .await
            .map_err(|e| match e {
                DashlingError::Aborted => e,
                e => DashlingError::ManifestDownload(Box::new(e)),
            })?;

        let data = request.data.take().unwrap_or_default();
        let xml = String::from_utf8_lossy(&data);
        let mut manifest = Manifest::parse(&xml, &url)?;
        if let Some(base_url) = &self.settings.base_url_override {
            manifest.override_base_url(base_url)?;
        }

        log::info!(
            "Loaded manifest: {:.3}s, streams: {:?}",
            manifest.media_duration,
            manifest.stream_types().collect::<Vec<_>>()
        );
        Ok(manifest)
    }

    fn emit_state(&self, state: SessionState, error: Option<&DashlingError>) {
        self.events.emit(SessionEvent::StateChange {
            state,
            error_type: error.map(DashlingError::error_type),
            error_message: error.map(ToString::to_string),
        });
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn dispose(&self) {
        self.cancel.cancel();
    }
}
