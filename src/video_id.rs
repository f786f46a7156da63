//! Canonical YouTube video identifiers.

use std::{fmt, sync::LazyLock};

use regex::Regex;
use serde::Serialize;

static BARE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]{11}$").expect("bare video id pattern compiles")
});

static URL_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:youtube\.com/watch\?v=|youtu\.be/|youtube\.com/embed/)([A-Za-z0-9_-]{11})")
        .expect("video url pattern compiles")
});

/// An 11 character video identifier drawn from `[A-Za-z0-9_-]`.
///
/// The only ways to obtain one are [`VideoId::extract`] and
/// [`VideoId::parse_exact`], so holding a `VideoId` means the string has
/// already been validated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    /// Accepts either a bare ID or a watch/short/embed URL and returns the
    /// canonical ID. Anything else yields `None`.
    pub fn extract(input: &str) -> Option<Self> {
        if let Some(id) = Self::parse_exact(input) {
            return Some(id);
        }

        URL_ID
            .captures(input)
            .and_then(|caps| caps.get(1))
            .map(|m| Self(m.as_str().to_owned()))
    }

    /// Accepts only a bare ID, no URLs.
    pub fn parse_exact(input: &str) -> Option<Self> {
        BARE_ID.is_match(input).then(|| Self(input.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VideoId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ids_pass_through_unchanged() {
        for id in ["dQw4w9WgXcQ", "abc_DEF-123", "___________", "-----------"] {
            assert_eq!(VideoId::extract(id).unwrap().as_str(), id);
        }
    }

    #[test]
    fn known_url_shapes_resolve() {
        let inputs = [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtube.com/watch?v=dQw4w9WgXcQ&t=42s",
            "https://youtu.be/dQw4w9WgXcQ",
            "youtu.be/dQw4w9WgXcQ?si=share",
            "https://www.youtube.com/embed/dQw4w9WgXcQ",
        ];
        for input in inputs {
            assert_eq!(
                VideoId::extract(input).map(|id| id.to_string()).as_deref(),
                Some("dQw4w9WgXcQ"),
                "{input}"
            );
        }
    }

    #[test]
    fn unrecognized_input_is_rejected() {
        for input in [
            "",
            "invalid",
            "dQw4w9WgXc",
            "dQw4w9WgXcQQ",
            "dQw4w9WgX!Q",
            "https://vimeo.com/123456789",
            "https://www.youtube.com/watch?v=short",
            "https://www.youtube.com/@channel",
        ] {
            assert!(VideoId::extract(input).is_none(), "{input}");
        }
    }

    #[test]
    fn parse_exact_refuses_urls() {
        assert!(VideoId::parse_exact("https://youtu.be/dQw4w9WgXcQ").is_none());
        assert!(VideoId::parse_exact("dQw4w9WgXcQ").is_some());
    }
}
