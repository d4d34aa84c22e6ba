#![forbid(unsafe_code)]

//! Recognizes YouTube video and short links.

use std::fmt;

use url::Url;

use crate::error::PipelineError;

const MAX_ID_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Short,
}

/// A validated request. Only the id and kind survive parsing; tracking
/// parameters and playlist context are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoUrl {
    id: String,
    kind: MediaKind,
}

impl VideoUrl {
    pub fn parse(input: &str) -> Result<Self, PipelineError> {
        let trimmed = input.trim();
        let invalid = || PipelineError::InvalidUrl(trimmed.to_string());

        let url = Url::parse(trimmed).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid());
        }
        let host = url.host_str().ok_or_else(invalid)?.to_ascii_lowercase();
        let segments: Vec<&str> = url
            .path_segments()
            .map(|segments| segments.filter(|segment| !segment.is_empty()).collect())
            .unwrap_or_default();

        let (id, kind) = if host == "youtu.be" {
            match segments.as_slice() {
                [id] => (id.to_string(), MediaKind::Video),
                _ => return Err(invalid()),
            }
        } else if is_youtube_host(&host) {
            match segments.as_slice() {
                ["watch"] => {
                    let id = url
                        .query_pairs()
                        .find(|(key, _)| key == "v")
                        .map(|(_, value)| value.into_owned())
                        .ok_or_else(invalid)?;
                    (id, MediaKind::Video)
                }
                ["shorts", id] => (id.to_string(), MediaKind::Short),
                ["live", id] | ["embed", id] => (id.to_string(), MediaKind::Video),
                _ => return Err(invalid()),
            }
        } else {
            return Err(invalid());
        };

        if !is_valid_id(&id) {
            return Err(invalid());
        }
        Ok(Self { id, kind })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Link handed to yt-dlp.
    pub fn canonical(&self) -> String {
        match self.kind {
            MediaKind::Video => format!("https://www.youtube.com/watch?v={}", self.id),
            MediaKind::Short => format!("https://www.youtube.com/shorts/{}", self.id),
        }
    }
}

impl fmt::Display for VideoUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

fn is_youtube_host(host: &str) -> bool {
    matches!(
        host,
        "youtube.com"
            | "www.youtube.com"
            | "m.youtube.com"
            | "music.youtube.com"
            | "youtube-nocookie.com"
            | "www.youtube-nocookie.com"
    )
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}
