use thiserror::Error;

use crate::{event::ErrorType, manifest::StreamType};

#[derive(Error, Debug)]
pub enum DashlingError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Request aborted")]
    Aborted,

    #[error("Failed to download manifest: {0}")]
    ManifestDownload(#[source] Box<DashlingError>),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),

    #[error(transparent)]
    MpdParseError(#[from] dash_mpd::DashMpdError),

    #[error("Failed to download {stream} init segment of quality {quality}: {source}")]
    InitSegmentDownload {
        stream: StreamType,
        quality: usize,
        #[source]
        source: Box<DashlingError>,
    },

    #[error("Failed to download {stream} fragment {index}: {source}")]
    MediaSegmentDownload {
        stream: StreamType,
        index: usize,
        #[source]
        source: Box<DashlingError>,
    },

    #[error("Media source rejected {0}")]
    MediaSourceInit(String),

    #[error("Source buffer error: {0}")]
    SourceBuffer(String),

    #[error("Failed to append {stream} fragment {index}: {message}")]
    MediaSourceAppend {
        stream: StreamType,
        index: usize,
        message: String,
    },

    #[error("{stream} fragment {index} is missing from the buffer after append")]
    AppendMissing { stream: StreamType, index: usize },

    #[error("Video element error: {0}")]
    VideoElement(String),

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
}

impl DashlingError {
    /// Whether the request layer may try the same transfer again.
    ///
    /// 404 and our own aborts are permanent, everything else on the wire is transient.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::HttpError(status) => *status != reqwest::StatusCode::NOT_FOUND,
            Self::Timeout(_) | Self::RequestError(_) | Self::IOError(_) => true,
            _ => false,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted)
    }

    /// Category published with the session error state.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::ManifestDownload(_) => ErrorType::ManifestDownload,
            Self::InvalidManifest(_) | Self::MpdParseError(_) | Self::UrlParseError(_) => {
                ErrorType::ManifestParse
            }
            Self::InitSegmentDownload { .. } => ErrorType::InitSegmentDownload,
            Self::MediaSegmentDownload { .. }
            | Self::HttpError(_)
            | Self::Timeout(_)
            | Self::Aborted
            | Self::RequestError(_) => ErrorType::MediaSegmentDownload,
            Self::MediaSourceInit(_) => ErrorType::MediaSourceInit,
            Self::MediaSourceAppend { .. } | Self::SourceBuffer(_) => ErrorType::MediaSourceAppend,
            Self::AppendMissing { .. } => ErrorType::AppendMissing,
            Self::VideoElement(_) => ErrorType::VideoElement,
            Self::IOError(_) | Self::JsonError(_) => ErrorType::Storage,
        }
    }
}

pub type DashlingResult<T> = Result<T, DashlingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_permanent() {
        assert!(!DashlingError::HttpError(reqwest::StatusCode::NOT_FOUND).is_retriable());
        assert!(DashlingError::HttpError(reqwest::StatusCode::BAD_GATEWAY).is_retriable());
        assert!(DashlingError::Timeout(std::time::Duration::from_secs(1)).is_retriable());
        assert!(!DashlingError::Aborted.is_retriable());
    }

    #[test]
    fn test_error_type() {
        let error = DashlingError::MediaSegmentDownload {
            stream: StreamType::Video,
            index: 3,
            source: Box::new(DashlingError::HttpError(reqwest::StatusCode::NOT_FOUND)),
        };
        assert_eq!(error.error_type(), ErrorType::MediaSegmentDownload);
        assert_eq!(
            error.to_string(),
            "Failed to download video fragment 3: HTTP error: 404 Not Found"
        );

        let error = DashlingError::ManifestDownload(Box::new(DashlingError::Aborted));
        assert_eq!(error.error_type(), ErrorType::ManifestDownload);
    }
}
