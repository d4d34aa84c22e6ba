#![forbid(unsafe_code)]

//! Fetches missing tools into the tools directory.
//!
//! Layout after a full bootstrap:
//!
//! ```text
//! <tools>/yt-dlp[.exe]
//! <tools>/ffmpeg/<release>/[bin/]ffmpeg[.exe]
//! <tools>/tor/tor[.exe]        (plus the bundle's shared libraries)
//! <tools>/data/geoip, geoip6
//! <tools>/7zr.exe              (Windows only, to unpack ffmpeg)
//! ```
//!
//! Downloads go out directly: the proxy is not running yet at this point.

use anyhow::{Context, Result, anyhow, bail};
use flate2::read::GzDecoder;
use std::env;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};
use tar::Archive;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::tools::{Tool, ToolLocator};

const YT_DLP_RELEASES: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download/";
const FFMPEG_WINDOWS_URL: &str = "https://www.gyan.dev/ffmpeg/builds/ffmpeg-git-essentials.7z";
const FFMPEG_LINUX_RELEASES: &str = "https://johnvansickle.com/ffmpeg/releases/";
const SEVENZIP_PORTABLE_URL: &str = "https://www.7-zip.org/a/7zr.exe";
const TOR_DIST_INDEX: &str = "https://dist.torproject.org/torbrowser/";

/// A download aborts when no data arrives for this long.
const STALL_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 64 * 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    TarXz,
    SevenZip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FfmpegSource {
    url: String,
    kind: ArchiveKind,
}

pub struct Installer {
    agent: ureq::Agent,
    tools_dir: PathBuf,
}

impl Installer {
    pub fn new(tools_dir: PathBuf) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .timeout_read(STALL_TIMEOUT)
            .user_agent(concat!("regionfree/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent, tools_dir }
    }

    /// Downloads and unpacks `tool` so that a later `locate` finds it.
    pub fn install(&self, tool: Tool, locator: &ToolLocator) -> Result<()> {
        fs::create_dir_all(&self.tools_dir)
            .with_context(|| format!("creating {}", self.tools_dir.display()))?;
        match tool {
            Tool::YtDlp => self.install_yt_dlp(),
            Tool::Ffmpeg => self.install_ffmpeg(locator),
            Tool::Tor => self.install_tor(),
            Tool::SevenZip => self.install_sevenzip().map(|_| ()),
        }
    }

    fn install_yt_dlp(&self) -> Result<()> {
        let asset = yt_dlp_asset(env::consts::OS, env::consts::ARCH)
            .ok_or_else(|| anyhow!("no yt-dlp build for {}", env::consts::OS))?;
        let name = Tool::YtDlp.executable_names()[0];
        let dest = self.tools_dir.join(name);
        self.download(&format!("{YT_DLP_RELEASES}{asset}"), &dest, "yt-dlp")?;
        mark_executable(&dest)?;
        Ok(())
    }

    fn install_ffmpeg(&self, locator: &ToolLocator) -> Result<()> {
        let source = ffmpeg_source(env::consts::OS, env::consts::ARCH).ok_or_else(|| {
            anyhow!(
                "no prebuilt ffmpeg for {}/{}",
                env::consts::OS,
                env::consts::ARCH
            )
        })?;
        let target = self.tools_dir.join("ffmpeg");
        let file_name = source
            .url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("ffmpeg-archive");
        let archive = self.tools_dir.join(file_name);
        self.download(&source.url, &archive, "ffmpeg")?;

        println!("Extracting ffmpeg...");
        match source.kind {
            ArchiveKind::TarXz => extract_tar_xz(&archive, &target)?,
            ArchiveKind::SevenZip => {
                let sevenzip = match locator.locate(Tool::SevenZip) {
                    Ok(path) => path,
                    Err(_) => self.install_sevenzip()?,
                };
                extract_7z(&sevenzip, &archive, &target)?;
            }
        }
        fs::remove_file(&archive).with_context(|| format!("removing {}", archive.display()))?;
        Ok(())
    }

    /// Portable 7-Zip, only published for Windows.
    fn install_sevenzip(&self) -> Result<PathBuf> {
        if !cfg!(windows) {
            bail!("{}", Tool::SevenZip.install_hint());
        }
        let dest = self.tools_dir.join("7zr.exe");
        if !dest.exists() {
            println!("Downloading portable 7-Zip...");
            self.download(SEVENZIP_PORTABLE_URL, &dest, "7-Zip")?;
        }
        Ok(dest)
    }

    fn install_tor(&self) -> Result<()> {
        let (os, arch) = tor_platform(env::consts::OS, env::consts::ARCH)
            .ok_or_else(|| anyhow!("unsupported OS for the Tor Expert Bundle: {}", env::consts::OS))?;

        println!("Required Tor files missing. Downloading Tor Expert Bundle...");
        let index = self.fetch_text(TOR_DIST_INDEX)?;
        let version = latest_stable_version(&index)
            .ok_or_else(|| anyhow!("no stable Tor release listed at {TOR_DIST_INDEX}"))?;
        let version_url = format!("{TOR_DIST_INDEX}{version}/");
        let listing = self.fetch_text(&version_url)?;
        let bundle = find_expert_bundle(&listing, os, arch)
            .ok_or_else(|| anyhow!("could not locate a Tor Expert Bundle for {os}-{arch}"))?;

        let archive = self.tools_dir.join(&bundle);
        println!("Downloading {bundle}...");
        self.download(&format!("{version_url}{bundle}"), &archive, &format!("Tor {version}"))?;

        println!("Extracting Tor...");
        let staging = tempfile::tempdir_in(&self.tools_dir)
            .with_context(|| format!("creating staging dir in {}", self.tools_dir.display()))?;
        extract_tar_gz(&archive, staging.path())?;
        fs::remove_file(&archive).with_context(|| format!("removing {}", archive.display()))?;
        place_tor_files(staging.path(), &self.tools_dir)
    }

    fn fetch_text(&self, url: &str) -> Result<String> {
        debug!(url, "fetching index");
        self.agent
            .get(url)
            .call()
            .with_context(|| format!("requesting {url}"))?
            .into_string()
            .with_context(|| format!("reading {url}"))
    }

    /// Streams `url` to `dest` with progress output. The read timeout acts
    /// as a stall watchdog.
    fn download(&self, url: &str, dest: &Path, label: &str) -> Result<()> {
        info!(url, dest = %dest.display(), "downloading");
        let response = self
            .agent
            .get(url)
            .call()
            .with_context(|| format!("requesting {url}"))?;
        let total = response
            .header("content-length")
            .and_then(|value| value.parse::<u64>().ok());
        let mut reader = response.into_reader();

        let mut partial = dest.as_os_str().to_owned();
        partial.push(".part");
        let partial = PathBuf::from(partial);
        let mut file = BufWriter::new(
            File::create(&partial).with_context(|| format!("creating {}", partial.display()))?,
        );

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut downloaded: u64 = 0;
        let start = Instant::now();
        let mut last_report: Option<Instant> = None;
        loop {
            let read = reader.read(&mut buf).with_context(|| {
                format!("{label} stalled or failed after {downloaded} bytes (timeout {STALL_TIMEOUT:?})")
            })?;
            if read == 0 {
                break;
            }
            file.write_all(&buf[..read])
                .with_context(|| format!("writing {}", partial.display()))?;
            downloaded += read as u64;

            if last_report.is_none_or(|at| at.elapsed() >= PROGRESS_INTERVAL) {
                eprint!("\r{}", progress_line(label, downloaded, total, start.elapsed()));
                last_report = Some(Instant::now());
            }
        }
        eprintln!("\r{}", progress_line(label, downloaded, total, start.elapsed()));

        file.flush()
            .with_context(|| format!("flushing {}", partial.display()))?;
        drop(file);
        fs::rename(&partial, dest)
            .with_context(|| format!("moving {} into place", dest.display()))?;
        Ok(())
    }
}

fn progress_line(label: &str, downloaded: u64, total: Option<u64>, elapsed: Duration) -> String {
    let seconds = elapsed.as_secs_f64().max(0.1);
    let speed = downloaded as f64 / seconds / 1024.0;
    match total.filter(|total| *total > 0) {
        Some(total) => format!(
            "{label}: {:6.2}% ({} KB / {} KB) {speed:6.1} KB/s",
            downloaded as f64 / total as f64 * 100.0,
            downloaded / 1024,
            total / 1024,
        ),
        None => format!("{label}: {} KB {speed:6.1} KB/s", downloaded / 1024),
    }
}

fn yt_dlp_asset(os: &str, arch: &str) -> Option<&'static str> {
    match (os, arch) {
        ("windows", "x86") => Some("yt-dlp_x86.exe"),
        ("windows", _) => Some("yt-dlp.exe"),
        ("macos", _) => Some("yt-dlp_macos"),
        ("linux", "aarch64") => Some("yt-dlp_linux_aarch64"),
        ("linux", "arm") => Some("yt-dlp_linux_armv7l"),
        ("linux", "x86_64") => Some("yt-dlp_linux"),
        _ => None,
    }
}

fn ffmpeg_source(os: &str, arch: &str) -> Option<FfmpegSource> {
    let linux = |flavour: &str| FfmpegSource {
        url: format!("{FFMPEG_LINUX_RELEASES}ffmpeg-release-{flavour}-static.tar.xz"),
        kind: ArchiveKind::TarXz,
    };
    match (os, arch) {
        ("windows", "x86_64") => Some(FfmpegSource {
            url: FFMPEG_WINDOWS_URL.to_string(),
            kind: ArchiveKind::SevenZip,
        }),
        ("linux", "x86_64") => Some(linux("amd64")),
        ("linux", "x86") => Some(linux("i686")),
        ("linux", "aarch64") => Some(linux("arm64")),
        ("linux", "arm") => Some(linux("armhf")),
        _ => None,
    }
}

/// Maps Rust's OS/arch names onto the Tor Expert Bundle naming scheme.
fn tor_platform(os: &str, arch: &str) -> Option<(&'static str, &'static str)> {
    match os {
        "windows" => Some((
            "windows",
            if arch.contains("64") { "x86_64" } else { "i686" },
        )),
        "macos" => Some((
            "macos",
            if arch == "aarch64" { "aarch64" } else { "x86_64" },
        )),
        "linux" => Some((
            "linux",
            match arch {
                "aarch64" => "aarch64",
                "arm" => "armv7",
                "x86" => "i686",
                _ => "x86_64",
            },
        )),
        _ => None,
    }
}

fn hrefs(html: &str) -> impl Iterator<Item = &str> {
    html.split("href=\"")
        .skip(1)
        .filter_map(|chunk| chunk.split_once('"').map(|(value, _)| value))
}

/// Highest purely numeric `x.y.z/` directory. Alpha releases (`14.5a3`)
/// never qualify.
fn latest_stable_version(html: &str) -> Option<String> {
    hrefs(html)
        .filter_map(|href| href.strip_suffix('/'))
        .filter(|version| {
            !version.is_empty()
                && version.contains('.')
                && version.chars().all(|c| c.is_ascii_digit() || c == '.')
        })
        .filter_map(|version| {
            let parts = version
                .split('.')
                .map(|part| part.parse::<u64>().ok())
                .collect::<Option<Vec<_>>>()?;
            Some((parts, version))
        })
        .max_by(|(left, _), (right, _)| left.cmp(right))
        .map(|(_, version)| version.to_string())
}

fn find_expert_bundle(html: &str, os: &str, arch: &str) -> Option<String> {
    let prefix = format!("tor-expert-bundle-{os}-{arch}-");
    hrefs(html)
        .map(|href| href.rsplit('/').next().unwrap_or(href))
        .find(|name| {
            name.starts_with(&prefix)
                && name.ends_with(".tar.gz")
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        })
        .map(str::to_string)
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
    let file = File::open(archive).with_context(|| format!("opening {}", archive.display()))?;
    Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .with_context(|| format!("unpacking {}", archive.display()))
}

fn extract_tar_xz(archive: &Path, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
    let mut input = BufReader::new(
        File::open(archive).with_context(|| format!("opening {}", archive.display()))?,
    );
    let mut decoded = BufWriter::new(tempfile::tempfile().context("creating scratch file")?);
    lzma_rs::xz_decompress(&mut input, &mut decoded)
        .map_err(|err| anyhow!("decompressing {}: {err}", archive.display()))?;
    let mut decoded = decoded.into_inner()?;
    decoded.seek(SeekFrom::Start(0))?;
    Archive::new(decoded)
        .unpack(dest)
        .with_context(|| format!("unpacking {}", archive.display()))
}

fn extract_7z(sevenzip: &Path, archive: &Path, dest: &Path) -> Result<()> {
    debug!(sevenzip = %sevenzip.display(), archive = %archive.display(), "running archiver");
    let status = Command::new(sevenzip)
        .arg("x")
        .arg(archive)
        .arg(format!("-o{}", dest.display()))
        .arg("-y")
        .status()
        .with_context(|| format!("running {}", sevenzip.display()))?;
    if !status.success() {
        bail!("{} exited with {status} while unpacking {}", sevenzip.display(), archive.display());
    }
    Ok(())
}

/// Moves the directory holding the tor binary to `<tools>/tor` and the
/// geoip databases to `<tools>/data`.
fn place_tor_files(staging: &Path, tools_dir: &Path) -> Result<()> {
    let tor_names = Tool::Tor.executable_names();
    let tor_binary = WalkDir::new(staging)
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| {
            entry.file_type().is_file()
                && tor_names
                    .iter()
                    .any(|name| entry.file_name().to_string_lossy() == *name)
        })
        .map(|entry| entry.into_path())
        .ok_or_else(|| anyhow!("tor binary not found in the extracted bundle"))?;
    let tor_source = tor_binary
        .parent()
        .ok_or_else(|| anyhow!("tor binary has no parent directory"))?
        .to_path_buf();

    let data_dir = tools_dir.join("data");
    fs::create_dir_all(&data_dir).with_context(|| format!("creating {}", data_dir.display()))?;
    let geoip_files: Vec<PathBuf> = WalkDir::new(staging)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.file_type().is_file()
                && matches!(entry.file_name().to_str(), Some("geoip" | "geoip6"))
        })
        .map(|entry| entry.into_path())
        .collect();
    for file in geoip_files {
        let Some(name) = file.file_name() else {
            continue;
        };
        let target = data_dir.join(name);
        fs::rename(&file, &target).with_context(|| format!("moving {}", target.display()))?;
    }

    let tor_target = tools_dir.join("tor");
    if tor_target.exists() {
        fs::remove_dir_all(&tor_target)
            .with_context(|| format!("removing stale {}", tor_target.display()))?;
    }
    fs::rename(&tor_source, &tor_target)
        .with_context(|| format!("moving tor into {}", tor_target.display()))?;
    mark_executable(&tor_target.join(tor_binary.file_name().unwrap_or_default()))?;
    Ok(())
}

fn mark_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)
            .with_context(|| format!("reading {}", path.display()))?
            .permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)
            .with_context(|| format!("marking {} executable", path.display()))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
