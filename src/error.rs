use thiserror::Error;

use crate::upstream::UpstreamError;

/// Request-level failures surfaced by [`crate::fetch::FetchService`].
#[derive(Debug, Error)]
pub enum FetchError {
    /// The caller's video string could not be resolved to an ID.
    #[error("{0}")]
    InvalidVideoReference(&'static str),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
    /// Provider failure behind the cached metadata and captions lookups.
    #[error("{}", .0.api_message())]
    UpstreamLookup(UpstreamError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl FetchError {
    /// For inputs that may be a URL or a bare ID.
    pub fn invalid_reference() -> Self {
        Self::InvalidVideoReference("Invalid YouTube video URL or ID")
    }

    /// For inputs that must be a bare ID.
    pub fn invalid_id_format() -> Self {
        Self::InvalidVideoReference("Invalid YouTube video ID format (must be 11 characters)")
    }

    pub fn transcript_not_found(video_id: &str) -> Self {
        Self::NotFound(format!("Transcript not found for video ID: {video_id}"))
    }
}
