use std::{sync::Arc, time::Duration};

use dashling::{
    error::DashlingError,
    host::simulated::{simulated_host, SimulatedElement},
    Dashling, ErrorType, SessionEvent, SessionState, Settings, StreamType,
};
use tokio::{sync::broadcast, task::JoinHandle};
use wiremock::{
    matchers::{method, path, path_regex},
    Mock, MockServer, ResponseTemplate,
};

use crate::{init_test_tracing, TWO_STREAMS_MPD};

async fn serve_manifest(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/content/two_streams.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TWO_STREAMS_MPD))
        .mount(server)
        .await;
}

async fn serve_segments(server: &MockServer, prefix: &str) {
    Mock::given(method("GET"))
        .and(path_regex(format!(
            r"^/{prefix}/[a-z0-9_]+/(init\.mp4|\d{{5}}\.m4s)$"
        )))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 2048]))
        .mount(server)
        .await;
}

/// Plays back in fast forward and disposes the session once the end is reached.
fn spawn_player(session: Dashling, element: Arc<SimulatedElement>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while !session.is_disposed() {
            tokio::time::sleep(Duration::from_millis(20)).await;
            element.advance(0.5);
            if element.has_ended() {
                session.dispose();
            }
        }
    })
}

fn drain_states(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<(SessionState, Option<ErrorType>)> {
    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::StateChange {
            state, error_type, ..
        } = event
        {
            states.push((state, error_type));
        }
    }
    states
}

#[tokio::test]
async fn test_plays_to_the_end() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    serve_manifest(&server).await;
    serve_segments(&server, "content").await;

    let session = Dashling::new(Settings::default());
    let mut events = session.subscribe();
    let (host, element, media_source) = simulated_host();
    let player = spawn_player(session.clone(), element.clone());

    let url = format!("{}/content/two_streams.mpd", server.uri());
    let summary = tokio::time::timeout(Duration::from_secs(10), session.load(host, &url)).await??;
    player.await?;

    assert_eq!(summary.appended, 2);
    assert_eq!(summary.stalls, 0);
    assert!(element.has_ended());
    assert_eq!(media_source.end_of_stream_calls(), 1);
    assert!((media_source.duration() - 9.009).abs() < 1e-9);

    for stream_type in StreamType::ALL {
        let buffer = media_source.source_buffer(stream_type.as_str()).unwrap();
        assert_eq!(buffer.media_appends(), vec![0, 1]);
    }

    let states = drain_states(&mut events);
    assert_eq!(states.first(), Some(&(SessionState::Initializing, None)));
    assert!(states.contains(&(SessionState::Playing, None)));
    assert!(states.iter().all(|(state, _)| *state != SessionState::Error));
    Ok(())
}

#[tokio::test]
async fn test_base_url_override() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    serve_manifest(&server).await;
    serve_segments(&server, "mirror").await;

    let settings = Settings {
        base_url_override: Some(format!("{}/mirror/", server.uri())),
        ..Default::default()
    };
    let session = Dashling::new(settings);
    let (host, element, _media_source) = simulated_host();
    let player = spawn_player(session.clone(), element);

    let url = format!("{}/content/two_streams.mpd", server.uri());
    let summary = tokio::time::timeout(Duration::from_secs(10), session.load(host, &url)).await??;
    player.await?;
    assert_eq!(summary.appended, 2);

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests
        .iter()
        .filter(|r| !r.url.path().ends_with(".mpd"))
        .all(|r| r.url.path().starts_with("/mirror/")));
    Ok(())
}

#[tokio::test]
async fn test_missing_manifest() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;

    let session = Dashling::new(Settings::default());
    let mut events = session.subscribe();
    let (host, _element, media_source) = simulated_host();

    let url = format!("{}/content/missing.mpd", server.uri());
    let result = session.load(host, &url).await;
    assert!(matches!(result, Err(DashlingError::ManifestDownload(_))));
    assert!(media_source.source_buffers().is_empty());

    let states = drain_states(&mut events);
    assert_eq!(
        states,
        vec![
            (SessionState::Initializing, None),
            (SessionState::Error, Some(ErrorType::ManifestDownload)),
        ]
    );
    Ok(())
}

#[tokio::test]
async fn test_missing_fragment_is_fatal() -> anyhow::Result<()> {
    init_test_tracing();
    let server = MockServer::start().await;
    serve_manifest(&server).await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/content/video_[a-z0-9]+/00002\.m4s$"))
        .respond_with(ResponseTemplate::new(404))
        .with_priority(1)
        .mount(&server)
        .await;
    serve_segments(&server, "content").await;

    let session = Dashling::new(Settings::default());
    let mut events = session.subscribe();
    let (host, _element, _media_source) = simulated_host();

    let url = format!("{}/content/two_streams.mpd", server.uri());
    let result = tokio::time::timeout(Duration::from_secs(10), session.load(host, &url)).await?;
    assert!(matches!(
        result,
        Err(DashlingError::MediaSegmentDownload {
            stream: StreamType::Video,
            index: 1,
            ..
        })
    ));

    let states = drain_states(&mut events);
    assert_eq!(
        states.last(),
        Some(&(SessionState::Error, Some(ErrorType::MediaSegmentDownload)))
    );
    Ok(())
}

#[tokio::test]
async fn test_disposed_session_refuses_to_load() {
    let session = Dashling::new(Settings::default());
    session.dispose();
    session.dispose();

    let (host, _element, _media_source) = simulated_host();
    let result = session.load(host, "https://example.com/manifest.mpd").await;
    assert!(matches!(result, Err(DashlingError::Aborted)));
}
