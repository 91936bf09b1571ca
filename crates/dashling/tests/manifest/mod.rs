use dashling::{error::DashlingError, ErrorType, Manifest, StreamType};
use url::Url;

use crate::TWO_STREAMS_MPD;

fn manifest() -> Manifest {
    let url = Url::parse("https://cdn.example.com/content/two_streams.mpd?token=abc").unwrap();
    Manifest::parse(TWO_STREAMS_MPD, &url).unwrap()
}

#[test]
fn test_two_streams() {
    let manifest = manifest();
    assert_eq!(
        manifest.stream_types().collect::<Vec<_>>(),
        vec![StreamType::Audio, StreamType::Video]
    );
    assert!((manifest.media_duration - 9.009).abs() < 1e-9);

    let audio = manifest.stream(StreamType::Audio).unwrap();
    let ids: Vec<_> = audio.qualities.iter().map(|q| q.id.as_str()).collect();
    assert_eq!(ids, vec!["audio_32k", "audio_64k", "audio_128k"]);

    let video = manifest.stream(StreamType::Video).unwrap();
    assert_eq!(video.mime_codecs(), r#"video/mp4; codecs="avc1.4d401f""#);
    assert_eq!(video.qualities[1].height, Some(720));
    assert_eq!(video.timeline.len(), 2);
    assert_eq!(video.timeline[1].start, 5000);
    assert_eq!(video.timeline[1].start_seconds, 5.0);
    assert!((video.timeline[1].length_seconds - 4.009).abs() < 1e-9);
}

#[test]
fn test_urls_keep_manifest_query() {
    let manifest = manifest();

    let audio = manifest.stream(StreamType::Audio).unwrap();
    assert_eq!(
        audio.init_url(0).unwrap().as_str(),
        "https://cdn.example.com/content/audio_32k/init.mp4?token=abc"
    );

    let video = manifest.stream(StreamType::Video).unwrap();
    assert_eq!(
        video.fragment_url(1, 1).unwrap().as_str(),
        "https://cdn.example.com/content/video_720p/00002.m4s?token=abc"
    );
    assert!(video.fragment_url(1, 2).is_err());
}

#[test]
fn test_base_url_override() {
    let mut manifest = manifest();
    manifest
        .override_base_url("https://mirror.example.com/vod/")
        .unwrap();

    let video = manifest.stream(StreamType::Video).unwrap();
    assert_eq!(
        video.fragment_url(0, 0).unwrap().as_str(),
        "https://mirror.example.com/vod/video_360p/00001.m4s"
    );
}

#[test]
fn test_missing_timeline_is_a_parse_error() {
    let timeline = r#"        <SegmentTimeline>
          <S t="0" d="5000" />
          <S d="4009" />
        </SegmentTimeline>
"#;
    assert!(TWO_STREAMS_MPD.contains(timeline));
    let xml = TWO_STREAMS_MPD.replace(timeline, "");
    let url = Url::parse("https://cdn.example.com/content/two_streams.mpd").unwrap();

    let error = Manifest::parse(&xml, &url).unwrap_err();
    assert!(matches!(error, DashlingError::InvalidManifest(_)));
    assert_eq!(error.error_type(), ErrorType::ManifestParse);
}
