#![forbid(unsafe_code)]

//! Error taxonomy shared by every pipeline step.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::tools::Tool;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{tool} is not available: {hint}")]
    MissingDependency { tool: Tool, hint: String },
    #[error("tor proxy unavailable: {0}")]
    ProxyUnavailable(String),
    #[error("not a recognized YouTube video or short link: {0}")]
    InvalidUrl(String),
    #[error("download failed: {0}")]
    FetchFailed(String),
    #[error("transcoding failed: {reason} (raw download kept at {})", raw.display())]
    TranscodeFailed { reason: String, raw: PathBuf },
    #[error("{action} {}: {source}", path.display())]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PipelineError {
    pub fn filesystem(action: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this failure category.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::InvalidUrl(_) => 2,
            PipelineError::MissingDependency { .. } => 3,
            PipelineError::ProxyUnavailable(_) => 4,
            PipelineError::FetchFailed(_) => 5,
            PipelineError::TranscodeFailed { .. } => 6,
            PipelineError::Filesystem { .. } => 7,
        }
    }
}

/// Pipeline step a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    ValidateUrl,
    ResolveTools,
    StartProxy,
    Fetch,
    Sanitize,
    Transcode,
    Cleanup,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Step::ValidateUrl => "URL validation",
            Step::ResolveTools => "dependency check",
            Step::StartProxy => "tor startup",
            Step::Fetch => "download",
            Step::Sanitize => "filename sanitizing",
            Step::Transcode => "transcoding",
            Step::Cleanup => "cleanup",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
#[error("{step} failed: {error}")]
pub struct RunError {
    pub step: Step,
    #[source]
    pub error: PipelineError,
}

impl RunError {
    pub fn exit_code(&self) -> u8 {
        self.error.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_category() {
        let errors = [
            PipelineError::InvalidUrl("x".into()),
            PipelineError::MissingDependency {
                tool: Tool::Ffmpeg,
                hint: "install it".into(),
            },
            PipelineError::ProxyUnavailable("timeout".into()),
            PipelineError::FetchFailed("status 1".into()),
            PipelineError::TranscodeFailed {
                reason: "status 1".into(),
                raw: PathBuf::from("/tmp/raw.mkv"),
            },
            PipelineError::filesystem(
                "creating",
                "/nope",
                io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
            ),
        ];
        let mut codes: Vec<u8> = errors.iter().map(PipelineError::exit_code).collect();
        assert!(codes.iter().all(|code| *code > 1));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn run_error_names_the_step() {
        let err = RunError {
            step: Step::Transcode,
            error: PipelineError::TranscodeFailed {
                reason: "ffmpeg exited with status 1".into(),
                raw: PathBuf::from("/work/abc.raw.mkv"),
            },
        };
        let message = err.to_string();
        assert!(message.starts_with("transcoding failed"));
        assert!(message.contains("/work/abc.raw.mkv"));
        assert_eq!(err.exit_code(), 6);
    }
}
