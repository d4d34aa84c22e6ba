#![forbid(unsafe_code)]

//! Finds the external programs the pipeline shells out to.
//!
//! Every lookup goes through [`ToolLocator::locate`], so platform-specific
//! search rules stay out of the orchestration code.

use std::env;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::bootstrap::Installer;
use crate::config::ToolOverrides;
use crate::error::PipelineError;

/// Archives unpack a few directories deep (`ffmpeg-*/bin/ffmpeg.exe`).
const MAX_SEARCH_DEPTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tool {
    YtDlp,
    Ffmpeg,
    Tor,
    SevenZip,
}

impl Tool {
    pub fn label(self) -> &'static str {
        match self {
            Tool::YtDlp => "yt-dlp",
            Tool::Ffmpeg => "ffmpeg",
            Tool::Tor => "tor",
            Tool::SevenZip => "7-Zip",
        }
    }

    pub fn executable_names(self) -> &'static [&'static str] {
        if cfg!(windows) {
            match self {
                Tool::YtDlp => &["yt-dlp.exe"],
                Tool::Ffmpeg => &["ffmpeg.exe"],
                Tool::Tor => &["tor.exe"],
                Tool::SevenZip => &["7z.exe", "7za.exe", "7zr.exe"],
            }
        } else {
            match self {
                Tool::YtDlp => &["yt-dlp"],
                Tool::Ffmpeg => &["ffmpeg"],
                Tool::Tor => &["tor"],
                Tool::SevenZip => &["7z", "7za", "7zr"],
            }
        }
    }

    /// Arguments that make the tool print its version and exit 0.
    fn version_args(self) -> Option<&'static [&'static str]> {
        match self {
            Tool::YtDlp | Tool::Tor => Some(&["--version"]),
            Tool::Ffmpeg => Some(&["-version"]),
            Tool::SevenZip => None,
        }
    }

    pub fn install_hint(self) -> &'static str {
        match self {
            Tool::YtDlp => {
                "install yt-dlp (https://github.com/yt-dlp/yt-dlp) or pass --yt-dlp <path>"
            }
            Tool::Ffmpeg => "install ffmpeg from your package manager or pass --ffmpeg <path>",
            Tool::Tor => {
                "install tor or the Tor Expert Bundle from https://www.torproject.org, or pass --tor <path>"
            }
            Tool::SevenZip => "install 7-Zip (7z) or pass --sevenzip <path>",
        }
    }
}

impl fmt::Display for Tool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Resolved paths for the tools every run needs.
#[derive(Debug, Clone)]
pub struct ToolSet {
    pub yt_dlp: PathBuf,
    pub ffmpeg: PathBuf,
    pub tor: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ToolLocator {
    overrides: ToolOverrides,
    tools_dir: PathBuf,
    search_path: Option<OsString>,
}

impl ToolLocator {
    pub fn new(overrides: ToolOverrides, tools_dir: PathBuf) -> Self {
        Self {
            overrides,
            tools_dir,
            search_path: env::var_os("PATH"),
        }
    }

    /// Replaces the `PATH` value used for the last search stage.
    pub fn with_search_path(mut self, search_path: Option<OsString>) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn tools_dir(&self) -> &Path {
        &self.tools_dir
    }

    fn override_for(&self, tool: Tool) -> Option<&PathBuf> {
        match tool {
            Tool::YtDlp => self.overrides.yt_dlp.as_ref(),
            Tool::Ffmpeg => self.overrides.ffmpeg.as_ref(),
            Tool::Tor => self.overrides.tor.as_ref(),
            Tool::SevenZip => self.overrides.sevenzip.as_ref(),
        }
    }

    /// Looks for `tool` in the configured override, then the tools
    /// directory, then `PATH`.
    pub fn locate(&self, tool: Tool) -> Result<PathBuf, PipelineError> {
        if let Some(path) = self.override_for(tool) {
            if is_executable(path) {
                return Ok(path.clone());
            }
            return Err(PipelineError::MissingDependency {
                tool,
                hint: format!("configured path {} is not an executable file", path.display()),
            });
        }

        if let Some(found) = find_in_tree(&self.tools_dir, tool.executable_names()) {
            return Ok(found);
        }

        if let Some(search_path) = &self.search_path {
            for dir in env::split_paths(search_path) {
                for name in tool.executable_names() {
                    let candidate = dir.join(name);
                    if is_executable(&candidate) {
                        return Ok(candidate);
                    }
                }
            }
        }

        Err(PipelineError::MissingDependency {
            tool,
            hint: tool.install_hint().to_string(),
        })
    }
}

/// Resolves yt-dlp, ffmpeg and tor, installing missing ones when an
/// installer is supplied. Each resolved tool is probed once.
pub fn resolve_tools(
    locator: &ToolLocator,
    installer: Option<&Installer>,
) -> Result<ToolSet, PipelineError> {
    Ok(ToolSet {
        yt_dlp: resolve_one(locator, installer, Tool::YtDlp)?,
        ffmpeg: resolve_one(locator, installer, Tool::Ffmpeg)?,
        tor: resolve_one(locator, installer, Tool::Tor)?,
    })
}

fn resolve_one(
    locator: &ToolLocator,
    installer: Option<&Installer>,
    tool: Tool,
) -> Result<PathBuf, PipelineError> {
    let path = match (locator.locate(tool), installer) {
        (Ok(path), _) => path,
        (Err(err), None) => return Err(err),
        (Err(err), Some(_)) if locator.override_for(tool).is_some() => return Err(err),
        (Err(_), Some(installer)) => {
            info!(%tool, dir = %locator.tools_dir().display(), "tool missing, installing");
            installer
                .install(tool, locator)
                .map_err(|err| PipelineError::MissingDependency {
                    tool,
                    hint: format!("automatic install failed ({err:#}); {}", tool.install_hint()),
                })?;
            locator.locate(tool)?
        }
    };

    probe(tool, &path)?;
    debug!(%tool, path = %path.display(), "resolved tool");
    Ok(path)
}

/// Runs the tool's version command to fail loudly on broken installs.
fn probe(tool: Tool, path: &Path) -> Result<(), PipelineError> {
    let Some(args) = tool.version_args() else {
        return Ok(());
    };
    let status = Command::new(path)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(PipelineError::MissingDependency {
            tool,
            hint: format!(
                "{} is installed but `{}` returned {status}",
                path.display(),
                args.join(" ")
            ),
        }),
        Err(err) => Err(PipelineError::MissingDependency {
            tool,
            hint: format!("{} could not be executed: {err}", path.display()),
        }),
    }
}

fn find_in_tree(root: &Path, names: &[&str]) -> Option<PathBuf> {
    if !root.is_dir() {
        return None;
    }
    WalkDir::new(root)
        .max_depth(MAX_SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .find(|entry| {
            let file_name = entry.file_name().to_string_lossy();
            names.iter().any(|name| {
                if cfg!(windows) {
                    file_name.eq_ignore_ascii_case(name)
                } else {
                    file_name == *name
                }
            }) && is_executable(entry.path())
        })
        .map(|entry| entry.into_path())
}

pub(crate) fn is_executable(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{write_noop, write_script};
    use tempfile::tempdir;

    fn locator(tools_dir: &Path, search: Option<&Path>) -> ToolLocator {
        ToolLocator::new(ToolOverrides::default(), tools_dir.to_path_buf())
            .with_search_path(search.map(|dir| dir.as_os_str().to_owned()))
    }

    #[test]
    fn finds_tools_nested_in_tools_dir() {
        let temp = tempdir().unwrap();
        let tools = temp.path().join("tools");
        let nested = tools.join("ffmpeg-7.0-amd64-static");
        let ffmpeg = write_noop(&nested, "ffmpeg");

        let found = locator(&tools, None).locate(Tool::Ffmpeg).unwrap();
        assert_eq!(found, ffmpeg);
    }

    #[test]
    fn falls_back_to_search_path() {
        let temp = tempdir().unwrap();
        let bin = temp.path().join("bin");
        let yt_dlp = write_noop(&bin, "yt-dlp");

        let found = locator(&temp.path().join("tools"), Some(&bin))
            .locate(Tool::YtDlp)
            .unwrap();
        assert_eq!(found, yt_dlp);
    }

    #[test]
    fn tools_dir_wins_over_search_path() {
        let temp = tempdir().unwrap();
        let tools = temp.path().join("tools");
        let bin = temp.path().join("bin");
        let local = write_noop(&tools.join("tor"), "tor");
        write_noop(&bin, "tor");

        let found = locator(&tools, Some(&bin)).locate(Tool::Tor).unwrap();
        assert_eq!(found, local);
    }

    #[test]
    fn ignores_non_executable_files() {
        let temp = tempdir().unwrap();
        let tools = temp.path().join("tools");
        fs::create_dir_all(&tools).unwrap();
        fs::write(tools.join("tor"), "not a program").unwrap();

        let err = locator(&tools, None).locate(Tool::Tor).unwrap_err();
        assert!(matches!(err, PipelineError::MissingDependency { tool: Tool::Tor, .. }));
    }

    #[test]
    fn missing_tool_reports_install_hint() {
        let temp = tempdir().unwrap();
        let err = locator(temp.path(), Some(temp.path()))
            .locate(Tool::YtDlp)
            .unwrap_err();
        match err {
            PipelineError::MissingDependency { tool, hint } => {
                assert_eq!(tool, Tool::YtDlp);
                assert_eq!(hint, Tool::YtDlp.install_hint());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn override_must_point_at_an_executable() {
        let temp = tempdir().unwrap();
        let stub = write_noop(temp.path(), "custom-ffmpeg");
        let good = ToolLocator::new(
            ToolOverrides {
                ffmpeg: Some(stub.clone()),
                ..ToolOverrides::default()
            },
            temp.path().join("tools"),
        );
        assert_eq!(good.locate(Tool::Ffmpeg).unwrap(), stub);

        let missing = temp.path().join("nope");
        let bad = ToolLocator::new(
            ToolOverrides {
                ffmpeg: Some(missing.clone()),
                ..ToolOverrides::default()
            },
            temp.path().join("tools"),
        );
        let err = bad.locate(Tool::Ffmpeg).unwrap_err();
        assert!(err.to_string().contains(&missing.display().to_string()));
    }

    #[test]
    fn resolve_tools_probes_each_tool() {
        let temp = tempdir().unwrap();
        let bin = temp.path().join("bin");
        write_noop(&bin, "yt-dlp");
        write_noop(&bin, "ffmpeg");
        write_noop(&bin, "tor");

        let set = resolve_tools(&locator(&temp.path().join("tools"), Some(&bin)), None).unwrap();
        assert_eq!(set.yt_dlp, bin.join("yt-dlp"));
        assert_eq!(set.ffmpeg, bin.join("ffmpeg"));
        assert_eq!(set.tor, bin.join("tor"));
    }

    #[test]
    fn resolve_tools_rejects_broken_installs() {
        let temp = tempdir().unwrap();
        let bin = temp.path().join("bin");
        write_noop(&bin, "yt-dlp");
        write_script(&bin, "ffmpeg", "exit 3");
        write_noop(&bin, "tor");

        let err = resolve_tools(&locator(&temp.path().join("tools"), Some(&bin)), None).unwrap_err();
        match err {
            PipelineError::MissingDependency { tool, hint } => {
                assert_eq!(tool, Tool::Ffmpeg);
                assert!(hint.contains("-version"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
