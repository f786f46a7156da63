//! Client for the third-party captions/metadata provider.
//!
//! All calls are blocking (`ureq`), so async callers are expected to run them
//! inside `tokio::task::spawn_blocking`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{transcripts::TimestampEntry, video_id::VideoId};

pub const DEFAULT_UPSTREAM_URL: &str = "https://fetch.youtubesummaries.cc";

/// Video metadata as exposed by `/youtube/metadata`.
///
/// The provider answers with oEmbed-style `author_name`; cached entries and
/// our own responses use `author`. Either spelling (or both, `author` wins)
/// deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireMetadata")]
pub struct VideoMetadata {
    pub video_id: String,
    pub title: String,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i64>,
}

#[derive(Deserialize)]
struct WireMetadata {
    #[serde(default)]
    video_id: String,
    title: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    author_name: Option<String>,
    #[serde(default)]
    author_url: Option<String>,
    #[serde(default)]
    thumbnail_url: Option<String>,
    #[serde(default)]
    width: Option<i64>,
    #[serde(default)]
    height: Option<i64>,
}

impl TryFrom<WireMetadata> for VideoMetadata {
    type Error = &'static str;

    fn try_from(wire: WireMetadata) -> Result<Self, Self::Error> {
        let author = wire
            .author
            .or(wire.author_name)
            .ok_or("missing field `author` or `author_name`")?;
        Ok(Self {
            video_id: wire.video_id,
            title: wire.title,
            author,
            author_url: wire.author_url,
            thumbnail_url: wire.thumbnail_url,
            width: wire.width,
            height: wire.height,
        })
    }
}

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The provider answered with a non-success status.
    #[error("Failed to fetch {resource}: {status} - {body}")]
    Status {
        resource: &'static str,
        status: u16,
        body: String,
    },
    /// Connection, TLS, or decoding failure.
    #[error("Failed to fetch {resource}: {message}")]
    Transport {
        resource: &'static str,
        message: String,
    },
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport { .. } => None,
        }
    }

    /// Wording used by the single-resource lookups, which pass the provider's
    /// status and body straight through.
    pub fn api_message(&self) -> String {
        match self {
            Self::Status { status, body, .. } => format!("Upstream API error: {status} - {body}"),
            Self::Transport { .. } => self.to_string(),
        }
    }
}

/// Read operations offered by the upstream provider.
pub trait Upstream: Send + Sync {
    fn metadata(&self, id: &VideoId) -> Result<VideoMetadata, UpstreamError>;

    /// Raw caption text for the comma separated `languages`.
    fn captions(&self, id: &VideoId, languages: &str) -> Result<String, UpstreamError>;

    fn timestamps(
        &self,
        id: &VideoId,
        languages: &str,
    ) -> Result<Vec<TimestampEntry>, UpstreamError>;
}

/// `Upstream` implementation backed by a shared `ureq` agent.
pub struct HttpUpstream {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpUpstream {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        let base_url = base_url.into().trim_end_matches('/').to_owned();
        Self { agent, base_url }
    }

    fn call(
        &self,
        resource: &'static str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<ureq::Response, UpstreamError> {
        let mut request = self.agent.get(&format!("{}{}", self.base_url, path));
        for (key, value) in query {
            request = request.query(key, value);
        }

        match request.call() {
            Ok(response) => Ok(response),
            Err(ureq::Error::Status(status, response)) => Err(UpstreamError::Status {
                resource,
                status,
                body: response.into_string().unwrap_or_default(),
            }),
            Err(ureq::Error::Transport(err)) => Err(UpstreamError::Transport {
                resource,
                message: err.to_string(),
            }),
        }
    }
}

impl Upstream for HttpUpstream {
    fn metadata(&self, id: &VideoId) -> Result<VideoMetadata, UpstreamError> {
        let response = self.call("metadata", "/youtube/metadata", &[("video", id.as_str())])?;
        let mut metadata: VideoMetadata =
            response
                .into_json()
                .map_err(|err| UpstreamError::Transport {
                    resource: "metadata",
                    message: format!("invalid metadata payload: {err}"),
                })?;
        metadata.video_id = id.to_string();
        Ok(metadata)
    }

    fn captions(&self, id: &VideoId, languages: &str) -> Result<String, UpstreamError> {
        let response = self.call(
            "captions",
            "/youtube/captions",
            &[("video", id.as_str()), ("languages", languages)],
        )?;
        response
            .into_string()
            .map_err(|err| UpstreamError::Transport {
                resource: "captions",
                message: format!("reading captions body: {err}"),
            })
    }

    fn timestamps(
        &self,
        id: &VideoId,
        languages: &str,
    ) -> Result<Vec<TimestampEntry>, UpstreamError> {
        let response = self.call(
            "timestamps",
            "/youtube/timestamps",
            &[("video", id.as_str()), ("languages", languages)],
        )?;
        response
            .into_json()
            .map_err(|err| UpstreamError::Transport {
                resource: "timestamps",
                message: format!("invalid timestamps payload: {err}"),
            })
    }
}
