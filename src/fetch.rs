#![forbid(unsafe_code)]

//! yt-dlp invocations, routed through the tor SOCKS proxy.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::PipelineError;
use crate::video_url::VideoUrl;

/// Best stream up to 1080p, falling back to the best muxed format.
const FORMAT_SELECTOR: &str = "bestvideo[height<=1080]+bestaudio/best";
const MERGE_FORMAT: &str = "mkv";
const RAW_MARKER: &str = ".raw.";

/// Subset of yt-dlp's JSON dump that the pipeline needs.
#[derive(Debug, Deserialize)]
struct VideoInfo {
    title: Option<String>,
    fulltitle: Option<String>,
}

impl VideoInfo {
    fn best_title(self) -> Option<String> {
        self.fulltitle
            .or(self.title)
            .filter(|title| !title.trim().is_empty())
    }
}

/// Raw download sitting in the work directory.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub raw: PathBuf,
    pub video_id: String,
    pub title: Option<String>,
}

pub struct Fetcher {
    yt_dlp: PathBuf,
    ffmpeg: PathBuf,
    proxy_url: String,
    work_dir: PathBuf,
}

impl Fetcher {
    pub fn new(yt_dlp: PathBuf, ffmpeg: PathBuf, proxy_url: String, work_dir: PathBuf) -> Self {
        Self {
            yt_dlp,
            ffmpeg,
            proxy_url,
            work_dir,
        }
    }

    /// Reads the title, then downloads the media to `<work>/<id>.raw.<ext>`.
    /// yt-dlp output streams straight to the terminal.
    pub fn fetch(&self, url: &VideoUrl) -> Result<FetchedMedia, PipelineError> {
        fs::create_dir_all(&self.work_dir)
            .map_err(|err| PipelineError::filesystem("creating", &self.work_dir, err))?;

        let title = self.fetch_info(url)?.best_title();
        info!(id = url.id(), title = title.as_deref().unwrap_or("<untitled>"), "metadata fetched");

        self.download(url)?;

        let raw = find_raw_file(&self.work_dir, url.id()).ok_or_else(|| {
            PipelineError::FetchFailed(format!(
                "yt-dlp finished but wrote no media file for {} into {}",
                url.id(),
                self.work_dir.display()
            ))
        })?;
        info!(raw = %raw.display(), "download finished");

        Ok(FetchedMedia {
            raw,
            video_id: url.id().to_string(),
            title,
        })
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.yt_dlp);
        command
            .arg("--proxy")
            .arg(&self.proxy_url)
            .arg("--no-playlist")
            .stdin(Stdio::null());
        command
    }

    fn fetch_info(&self, url: &VideoUrl) -> Result<VideoInfo, PipelineError> {
        let mut command = self.command();
        command
            .arg("--no-warnings")
            .arg("--skip-download")
            .arg("--dump-single-json")
            .arg(url.canonical());
        debug!(?command, "reading metadata");

        let output = command
            .output()
            .map_err(|err| PipelineError::FetchFailed(format!("could not run yt-dlp: {err}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::FetchFailed(format!(
                "metadata lookup exited with {}: {}",
                output.status,
                last_line(&stderr)
            )));
        }

        serde_json::from_slice(&output.stdout).map_err(|err| {
            PipelineError::FetchFailed(format!("yt-dlp returned unreadable metadata: {err}"))
        })
    }

    fn download(&self, url: &VideoUrl) -> Result<(), PipelineError> {
        let template = self
            .work_dir
            .join(format!("{}{RAW_MARKER}%(ext)s", url.id()));
        let mut command = self.command();
        command
            .arg("--format")
            .arg(FORMAT_SELECTOR)
            .arg("--merge-output-format")
            .arg(MERGE_FORMAT)
            .arg("--ffmpeg-location")
            .arg(&self.ffmpeg)
            .arg("--retries")
            .arg("1")
            .arg("--fragment-retries")
            .arg("1")
            .arg("--no-overwrites")
            .arg("--continue")
            .arg("--output")
            .arg(&template)
            .arg(url.canonical());
        debug!(?command, "downloading");

        let status = command
            .status()
            .map_err(|err| PipelineError::FetchFailed(format!("could not run yt-dlp: {err}")))?;
        if !status.success() {
            return Err(PipelineError::FetchFailed(format!(
                "yt-dlp exited with {status}"
            )));
        }
        Ok(())
    }
}

/// Finds `<id>.raw.<ext>`, ignoring partial downloads and the per-stream
/// `<id>.raw.f137.mp4` files yt-dlp keeps around before merging.
fn find_raw_file(work_dir: &Path, video_id: &str) -> Option<PathBuf> {
    let prefix = format!("{video_id}{RAW_MARKER}");
    let mut candidates: Vec<PathBuf> = fs::read_dir(work_dir)
        .ok()?
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let Some(ext) = name.strip_prefix(&prefix) else {
                return false;
            };
            if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return false;
            }
            if matches!(ext, "part" | "ytdl" | "temp" | "json" | "txt" | "description") {
                return false;
            }
            entry
                .metadata()
                .is_ok_and(|meta| meta.is_file() && meta.len() > 0)
        })
        .map(|entry| entry.path())
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("no error output")
}
