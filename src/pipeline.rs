#![forbid(unsafe_code)]

//! One download from URL to transcoded file.
//!
//! Steps run strictly in order: validate, resolve tools, bring up the proxy,
//! fetch, sanitize, transcode, clean up. The first failure stops the run and
//! leaves every intermediate artifact where it is.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::bootstrap::Installer;
use crate::config::Settings;
use crate::error::{PipelineError, RunError, Step};
use crate::fetch::Fetcher;
use crate::sanitize::output_stem;
use crate::tools::{ToolLocator, resolve_tools};
use crate::tor::{DaemonSlot, TorLaunch};
use crate::transcode::Transcoder;
use crate::video_url::VideoUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    ToolsResolved,
    ProxyReady,
    Fetched,
    Sanitized,
    Transcoded,
    CleanedUp,
    Failed(Step),
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub url: VideoUrl,
    pub title: Option<String>,
    pub output: PathBuf,
    pub raw_removed: bool,
    pub started_tor: bool,
}

pub struct Pipeline {
    settings: Settings,
    locator: ToolLocator,
    daemon: DaemonSlot,
    stage: Stage,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        let locator = ToolLocator::new(settings.tools.clone(), settings.tools_dir.clone());
        Self {
            settings,
            locator,
            daemon: DaemonSlot::default(),
            stage: Stage::Idle,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Handle to the tor daemon a run starts, for stopping it from a signal
    /// handler.
    pub fn daemon_slot(&self) -> DaemonSlot {
        self.daemon.clone()
    }

    pub fn run(&mut self, input: &str) -> Result<Outcome, RunError> {
        self.stage = Stage::Idle;

        let url = self.guard(Step::ValidateUrl, VideoUrl::parse(input))?;
        info!(%url, kind = ?url.kind(), "validated link");

        let installer = self
            .settings
            .install_missing
            .then(|| Installer::new(self.settings.tools_dir.clone()));
        let tools = self.guard(
            Step::ResolveTools,
            resolve_tools(&self.locator, installer.as_ref()),
        )?;
        self.advance(Stage::ToolsResolved);

        let launch = TorLaunch::new(
            tools.tor.clone(),
            self.settings.proxy.clone(),
            &self.settings.tools_dir,
            self.settings.verbose,
        );
        // Held until the end of the run; dropping it stops a tor we started.
        let session = self.guard(Step::StartProxy, launch.ensure_ready_in(&self.daemon))?;
        self.advance(Stage::ProxyReady);

        if self.settings.check_exit {
            match session.check_exit() {
                Ok(check) if check.is_tor => {
                    info!(ip = check.ip.as_deref().unwrap_or("?"), "traffic exits through tor");
                }
                Ok(check) => warn!(
                    ip = check.ip.as_deref().unwrap_or("?"),
                    "exit check says this connection is not using tor"
                ),
                Err(err) => warn!("could not verify the tor exit: {err:#}"),
            }
        }

        let fetcher = Fetcher::new(
            tools.yt_dlp.clone(),
            tools.ffmpeg.clone(),
            session.proxy_url(),
            self.settings.work_dir.clone(),
        );
        let media = self.guard(Step::Fetch, fetcher.fetch(&url))?;
        self.advance(Stage::Fetched);

        let stem = output_stem(media.title.as_deref(), &url, self.settings.max_name_len);
        info!(name = %stem, "sanitized output name");
        self.advance(Stage::Sanitized);

        let transcoder = Transcoder::new(
            tools.ffmpeg.clone(),
            self.settings.format,
            self.settings.overwrite,
            self.settings.verbose,
        );
        let output = self.guard(
            Step::Transcode,
            transcoder.transcode(&media.raw, &self.settings.output_dir, &stem),
        )?;
        self.advance(Stage::Transcoded);

        let raw_removed = self.guard(
            Step::Cleanup,
            cleanup(&media.raw, &output, &self.settings.work_dir),
        )?;
        self.advance(Stage::CleanedUp);

        Ok(Outcome {
            url,
            title: media.title,
            output,
            raw_removed,
            started_tor: session.started_by_us(),
        })
    }

    fn advance(&mut self, stage: Stage) {
        self.stage = stage;
        tracing::debug!(?stage, "stage reached");
    }

    fn guard<T>(&mut self, step: Step, result: Result<T, PipelineError>) -> Result<T, RunError> {
        result.map_err(|error| {
            self.stage = Stage::Failed(step);
            warn!(%step, "{error}");
            RunError { step, error }
        })
    }
}

/// Deletes the raw download once `output` exists and is non-empty.
///
/// Returns whether a file was removed. A raw file that is already gone is
/// not an error. The work directory is removed too if that left it empty.
pub fn cleanup(raw: &Path, output: &Path, work_dir: &Path) -> Result<bool, PipelineError> {
    let output_ready = fs::metadata(output).is_ok_and(|meta| meta.is_file() && meta.len() > 0);
    if !output_ready {
        warn!(output = %output.display(), raw = %raw.display(), "output missing or empty, keeping raw download");
        return Ok(false);
    }

    let removed = match fs::remove_file(raw) {
        Ok(()) => true,
        Err(err) if err.kind() == ErrorKind::NotFound => false,
        Err(err) => return Err(PipelineError::filesystem("removing", raw, err)),
    };
    if removed {
        info!(raw = %raw.display(), "removed raw download");
    }

    // Fails harmlessly when other files remain.
    let _ = fs::remove_dir(work_dir);
    Ok(removed)
}
