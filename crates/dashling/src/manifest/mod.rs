//! Static MPEG-DASH manifests reduced to what the scheduler needs.

mod template;
mod url;

use std::{collections::BTreeMap, fmt};

use dash_mpd::{AdaptationSet, SegmentTemplate};
use serde::{Deserialize, Serialize};

pub use self::template::UrlTemplate;
pub(crate) use self::url::merge_baseurls;
use crate::error::{DashlingError, DashlingResult};

/// Upper bound on expanded `<S>` entries per stream.
const MAX_TIMELINE_ENTRIES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Audio,
    Video,
}

impl StreamType {
    /// Audio first, matching the order streams are driven in.
    pub const ALL: [StreamType; 2] = [StreamType::Audio, StreamType::Video];

    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Audio => "audio",
            StreamType::Video => "video",
        }
    }

    /// Accepts either a `contentType` ("video") or a `mimeType` ("video/mp4").
    pub fn from_content_type(value: &str) -> Option<Self> {
        let kind = value.split('/').next().unwrap_or_default();
        match kind.trim().to_ascii_lowercase().as_str() {
            "audio" => Some(StreamType::Audio),
            "video" => Some(StreamType::Video),
            _ => None,
        }
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rendition. Index 0 of [`StreamInfo::qualities`] is the lowest bandwidth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quality {
    pub id: String,
    /// Bits per second.
    pub bandwidth: u64,
    pub width: Option<u64>,
    pub height: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimelineEntry {
    /// Start in timescale units, substituted for `$Time$`.
    pub start: u64,
    pub start_seconds: f64,
    pub length: u64,
    pub length_seconds: f64,
    /// Substituted for `$Number$`.
    pub server_segment_index: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub stream_type: StreamType,
    pub mime_type: String,
    pub codecs: String,
    pub base_url: ::url::Url,
    pub init_url_format: String,
    pub frag_url_format: String,
    pub qualities: Vec<Quality>,
    pub timeline: Vec<TimelineEntry>,
}

impl StreamInfo {
    /// The type string handed to `MediaSource::add_source_buffer`.
    pub fn mime_codecs(&self) -> String {
        format!("{}; codecs=\"{}\"", self.mime_type, self.codecs)
    }

    fn template(&self, quality_index: usize) -> UrlTemplate<'static> {
        let mut template = UrlTemplate::new();
        if let Some(quality) = self.qualities.get(quality_index) {
            template = template
                .with(UrlTemplate::REPRESENTATION_ID, &quality.id)
                .with(UrlTemplate::BANDWIDTH, quality.bandwidth);
        }
        template
    }

    pub fn init_url(&self, quality_index: usize) -> DashlingResult<::url::Url> {
        let path = self.template(quality_index).resolve(&self.init_url_format);
        merge_baseurls(&self.base_url, &path)
    }

    pub fn fragment_url(
        &self,
        quality_index: usize,
        fragment_index: usize,
    ) -> DashlingResult<::url::Url> {
        let entry = self.timeline.get(fragment_index).ok_or_else(|| {
            DashlingError::InvalidManifest(format!(
                "{} fragment {fragment_index} is outside the timeline",
                self.stream_type
            ))
        })?;
        let number = entry
            .server_segment_index
            .unwrap_or(fragment_index as u64 + 1);
        let path = self
            .template(quality_index)
            .with(UrlTemplate::TIME, entry.start)
            .with(UrlTemplate::NUMBER, number)
            .resolve(&self.frag_url_format);
        merge_baseurls(&self.base_url, &path)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Manifest {
    pub base_url: ::url::Url,
    /// Seconds.
    pub media_duration: f64,
    pub streams: BTreeMap<StreamType, StreamInfo>,
}

impl Manifest {
    /// Parses a static MPD fetched from `manifest_url`. Only the first Period is used.
    pub fn parse(xml: &str, manifest_url: &::url::Url) -> DashlingResult<Self> {
        let mpd = dash_mpd::parse(xml)?;

        let mut base_url = manifest_url.clone();
        if let Some(mpd_base_url) = mpd.base_url.first() {
            base_url = merge_baseurls(&base_url, &mpd_base_url.base)?;
        }

        let period = mpd
            .periods
            .first()
            .ok_or_else(|| DashlingError::InvalidManifest("MPD has no Period".to_string()))?;
        if let Some(period_base_url) = period.BaseURL.first() {
            base_url = merge_baseurls(&base_url, &period_base_url.base)?;
        }

        let mut streams = BTreeMap::new();
        for adaptation in &period.adaptations {
            let Some(stream_type) = adaptation_stream_type(adaptation) else {
                log::debug!("Skipping adaptation set {:?}", adaptation.id);
                continue;
            };
            if streams.contains_key(&stream_type) {
                log::debug!("Skipping additional {stream_type} adaptation set");
                continue;
            }

            let stream = parse_adaptation(stream_type, adaptation, &base_url)?;
            streams.insert(stream_type, stream);
        }

        if streams.is_empty() {
            return Err(DashlingError::InvalidManifest(
                "no audio or video adaptation set".to_string(),
            ));
        }

        let media_duration = match mpd.mediaPresentationDuration {
            Some(duration) => duration.as_secs_f64(),
            None => streams
                .values()
                .filter_map(|s| s.timeline.last())
                .map(|e| e.start_seconds + e.length_seconds)
                .fold(0.0, f64::max),
        };

        Ok(Self {
            base_url,
            media_duration,
            streams,
        })
    }

    /// Points every stream at `base_url`, dropping any BaseURL from the MPD.
    pub fn override_base_url(&mut self, base_url: &str) -> DashlingResult<()> {
        let base_url = ::url::Url::parse(base_url)?;
        for stream in self.streams.values_mut() {
            stream.base_url = base_url.clone();
        }
        self.base_url = base_url;
        Ok(())
    }

    pub fn stream(&self, stream_type: StreamType) -> Option<&StreamInfo> {
        self.streams.get(&stream_type)
    }

    pub fn stream_types(&self) -> impl Iterator<Item = StreamType> + '_ {
        self.streams.keys().copied()
    }
}

fn adaptation_stream_type(adaptation: &AdaptationSet) -> Option<StreamType> {
    adaptation
        .contentType
        .as_deref()
        .or(adaptation.mimeType.as_deref())
        .or_else(|| {
            adaptation
                .representations
                .first()
                .and_then(|r| r.mimeType.as_deref())
        })
        .and_then(StreamType::from_content_type)
}

fn parse_adaptation(
    stream_type: StreamType,
    adaptation: &AdaptationSet,
    base_url: &::url::Url,
) -> DashlingResult<StreamInfo> {
    let invalid = |message: &str| DashlingError::InvalidManifest(format!("{stream_type} {message}"));

    let base_url = match adaptation.BaseURL.first() {
        Some(adaptation_base_url) => merge_baseurls(base_url, &adaptation_base_url.base)?,
        None => base_url.clone(),
    };

    let first = adaptation
        .representations
        .first()
        .ok_or_else(|| invalid("adaptation set has no representations"))?;

    let template: &SegmentTemplate = adaptation
        .SegmentTemplate
        .as_ref()
        .or(first.SegmentTemplate.as_ref())
        .ok_or_else(|| invalid("stream has no SegmentTemplate"))?;

    let init_url_format = template
        .initialization
        .clone()
        .ok_or_else(|| invalid("SegmentTemplate has no initialization"))?;
    let frag_url_format = template
        .media
        .clone()
        .ok_or_else(|| invalid("SegmentTemplate has no media"))?;

    let segment_timeline = template
        .SegmentTimeline
        .as_ref()
        .ok_or_else(|| invalid("stream has no SegmentTimeline"))?;

    let timescale = template.timescale.unwrap_or(1).max(1) as f64;
    let start_number = template.startNumber.unwrap_or(1) as u64;

    let mut timeline = Vec::new();
    let mut current_time = 0u64;
    for s in &segment_timeline.segments {
        if let Some(t) = s.t {
            current_time = t;
        }
        let duration = s.d;
        // Open-ended repeats only make sense for dynamic content.
        let repeat = s.r.unwrap_or(0).max(0) as u64;
        let count = repeat.saturating_add(1);
        if count > (MAX_TIMELINE_ENTRIES - timeline.len()) as u64 {
            return Err(invalid("SegmentTimeline has too many segments"));
        }

        for _ in 0..count {
            timeline.push(TimelineEntry {
                start: current_time,
                start_seconds: current_time as f64 / timescale,
                length: duration,
                length_seconds: duration as f64 / timescale,
                server_segment_index: Some(start_number + timeline.len() as u64),
            });
            current_time = current_time
                .checked_add(duration)
                .ok_or_else(|| invalid("SegmentTimeline runs past the end of time"))?;
        }
    }
    if timeline.is_empty() {
        return Err(invalid("SegmentTimeline is empty"));
    }

    let mut qualities: Vec<Quality> = adaptation
        .representations
        .iter()
        .enumerate()
        .map(|(i, r)| Quality {
            id: r.id.clone().unwrap_or_else(|| i.to_string()),
            bandwidth: r.bandwidth.unwrap_or(0) as u64,
            width: r.width.map(|w| w as u64),
            height: r.height.map(|h| h as u64),
        })
        .collect();
    qualities.sort_by_key(|q| q.bandwidth);

    let mime_type = adaptation
        .mimeType
        .clone()
        .or_else(|| first.mimeType.clone())
        .unwrap_or_else(|| format!("{stream_type}/mp4"));
    let codecs = adaptation
        .codecs
        .clone()
        .or_else(|| first.codecs.clone())
        .unwrap_or_default();

    Ok(StreamInfo {
        stream_type,
        mime_type,
        codecs,
        base_url,
        init_url_format,
        frag_url_format,
        qualities,
        timeline,
    })
}
