#![forbid(unsafe_code)]

//! Local tor daemon management.
//!
//! A run either attaches to a SOCKS listener that is already up (and never
//! stops it), or starts its own tor from a temporary torrc and stops it when
//! the [`ProxySession`] is dropped.

use std::io::{BufRead, BufReader, Write};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Deserialize;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::ProxySettings;
use crate::error::PipelineError;

const PROXY_HOST: Ipv4Addr = Ipv4Addr::LOCALHOST;
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const CHECK_URL: &str = "https://check.torproject.org/api/ip";
const CHECK_TIMEOUT: Duration = Duration::from_secs(20);

/// Everything needed to launch a private tor instance.
#[derive(Debug, Clone)]
pub struct TorLaunch {
    pub tor: PathBuf,
    pub settings: ProxySettings,
    pub data_dir: PathBuf,
    pub geoip: Option<PathBuf>,
    pub geoip6: Option<PathBuf>,
    pub verbose: bool,
}

impl TorLaunch {
    /// Uses the tools-directory layout written by the bootstrapper for state
    /// and geoip files.
    pub fn new(tor: PathBuf, settings: ProxySettings, tools_dir: &Path, verbose: bool) -> Self {
        let existing = |path: PathBuf| path.is_file().then_some(path);
        Self {
            tor,
            settings,
            data_dir: tools_dir.join("tor-state"),
            geoip: existing(tools_dir.join("data").join("geoip")),
            geoip6: existing(tools_dir.join("data").join("geoip6")),
            verbose,
        }
    }

    fn socks_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(PROXY_HOST, self.settings.socks_port))
    }

    fn control_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(PROXY_HOST, self.settings.control_port))
    }

    pub fn render_torrc(&self) -> String {
        let mut torrc = String::new();
        if let Some(geoip) = &self.geoip {
            torrc.push_str(&format!("GeoIPFile {}\n", geoip.display()));
        }
        if let Some(geoip6) = &self.geoip6 {
            torrc.push_str(&format!("GeoIPv6File {}\n", geoip6.display()));
        }
        torrc.push_str(&format!("DataDirectory {}\n", self.data_dir.display()));
        torrc.push_str(&format!(
            "SocksPort {}:{}\n",
            PROXY_HOST, self.settings.socks_port
        ));
        torrc.push_str(&format!(
            "ControlPort {}:{}\n",
            PROXY_HOST, self.settings.control_port
        ));
        if let Some(country) = &self.settings.exit_country {
            torrc.push_str(&format!("ExitNodes {{{country}}}\n"));
        }
        torrc
    }

    /// Makes sure a SOCKS endpoint is reachable. Blocks until tor is ready
    /// or the configured timeout elapses. There is exactly one attempt.
    pub fn ensure_ready(&self) -> Result<ProxySession, PipelineError> {
        self.ensure_ready_in(&DaemonSlot::default())
    }

    /// Like [`TorLaunch::ensure_ready`], but parks a spawned daemon in
    /// `slot` so that a signal handler holding a clone can stop it.
    pub fn ensure_ready_in(&self, slot: &DaemonSlot) -> Result<ProxySession, PipelineError> {
        let socks = self.socks_addr();
        if is_port_live(socks) {
            info!(%socks, "attaching to running tor proxy");
            return Ok(ProxySession {
                socks,
                daemon: None,
            });
        }

        let torrc = self.write_torrc()?;
        info!(tor = %self.tor.display(), %socks, exit = ?self.settings.exit_country, "starting tor");
        let (stdout, stderr) = if self.verbose {
            (Stdio::inherit(), Stdio::inherit())
        } else {
            (Stdio::null(), Stdio::null())
        };
        let child = Command::new(&self.tor)
            .arg("-f")
            .arg(torrc.path())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|err| {
                PipelineError::ProxyUnavailable(format!(
                    "could not start {}: {err}",
                    self.tor.display()
                ))
            })?;

        // Owning the slot from here on means every early return stops tor.
        slot.park(Daemon {
            child,
            _torrc: torrc,
        });
        let session = ProxySession {
            socks,
            daemon: Some(slot.clone()),
        };
        self.wait_until_ready(slot)?;
        info!(%socks, "tor is ready");
        Ok(session)
    }

    fn write_torrc(&self) -> Result<NamedTempFile, PipelineError> {
        let mut torrc = tempfile::Builder::new()
            .prefix("regionfree-")
            .suffix(".torrc")
            .tempfile()
            .map_err(|err| PipelineError::filesystem("creating torrc in", std::env::temp_dir(), err))?;
        torrc
            .write_all(self.render_torrc().as_bytes())
            .and_then(|_| torrc.flush())
            .map_err(|err| PipelineError::filesystem("writing", torrc.path(), err))?;
        Ok(torrc)
    }

    fn wait_until_ready(&self, slot: &DaemonSlot) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.settings.ready_timeout;
        loop {
            if let Some(status) = slot.exited() {
                return Err(PipelineError::ProxyUnavailable(format!(
                    "tor exited with {status} before it became ready"
                )));
            }

            if is_port_live(self.socks_addr()) && control_port_responds(self.control_addr()) {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(PipelineError::ProxyUnavailable(format!(
                    "tor did not become ready within {}s",
                    self.settings.ready_timeout.as_secs_f32()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

#[derive(Debug)]
struct Daemon {
    child: Child,
    _torrc: NamedTempFile,
}

/// Shared home of a tor process this run started.
///
/// Cloning is cheap; every clone refers to the same daemon. [`DaemonSlot::stop`]
/// is idempotent, so the session drop and a signal handler can both call it.
#[derive(Debug, Clone, Default)]
pub struct DaemonSlot {
    inner: Arc<Mutex<Option<Daemon>>>,
}

impl DaemonSlot {
    fn park(&self, daemon: Daemon) {
        let previous = self.inner.lock().replace(daemon);
        if let Some(previous) = previous {
            terminate(previous);
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Clears the slot when the daemon has already exited on its own.
    fn exited(&self) -> Option<ExitStatus> {
        let mut guard = self.inner.lock();
        let status = guard.as_mut()?.child.try_wait().ok().flatten()?;
        *guard = None;
        Some(status)
    }

    /// Stops the daemon, if any, and removes its torrc.
    pub fn stop(&self) {
        let daemon = self.inner.lock().take();
        if let Some(daemon) = daemon {
            terminate(daemon);
        }
    }
}

/// A reachable SOCKS endpoint. Stops tor on drop when this run started it.
#[derive(Debug)]
pub struct ProxySession {
    socks: SocketAddr,
    daemon: Option<DaemonSlot>,
}

impl ProxySession {
    pub fn started_by_us(&self) -> bool {
        self.daemon.is_some()
    }

    pub fn socks_addr(&self) -> SocketAddr {
        self.socks
    }

    /// Proxy URL handed to yt-dlp. `socks5h` makes tor resolve hostnames so
    /// no lookup reaches the local resolver.
    pub fn proxy_url(&self) -> String {
        format!("socks5h://{}", self.socks)
    }

    /// Asks check.torproject.org which exit we are using. ureq hands the
    /// hostname to the proxy, so resolution happens inside tor here as well.
    pub fn check_exit(&self) -> anyhow::Result<TorCheck> {
        let proxy = ureq::Proxy::new(format!("socks5://{}", self.socks))?;
        let agent = ureq::AgentBuilder::new()
            .proxy(proxy)
            .timeout(CHECK_TIMEOUT)
            .build();
        let check: TorCheck = agent.get(CHECK_URL).call()?.into_json()?;
        Ok(check)
    }
}

impl Drop for ProxySession {
    fn drop(&mut self) {
        if let Some(slot) = self.daemon.take() {
            slot.stop();
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TorCheck {
    #[serde(rename = "IP")]
    pub ip: Option<String>,
    #[serde(rename = "IsTor", default)]
    pub is_tor: bool,
}

/// Asks the daemon to exit, then kills it after a grace period. The torrc
/// goes away when `daemon` drops.
fn terminate(daemon: Daemon) {
    let Daemon { mut child, _torrc } = daemon;
    debug!(pid = child.id(), "stopping tor");
    request_shutdown(&child);

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return,
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(100)),
            Ok(None) | Err(_) => break,
        }
    }
    if let Err(err) = child.kill() {
        warn!("could not kill tor: {err}");
    }
    let _ = child.wait();
}

#[cfg(unix)]
fn request_shutdown(child: &Child) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(child.id()) else {
        return;
    };
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!("SIGTERM to tor failed: {err}");
    }
}

#[cfg(not(unix))]
fn request_shutdown(_child: &Child) {}

pub fn is_port_live(addr: SocketAddr) -> bool {
    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT).is_ok()
}

/// True when the control port answers `PROTOCOLINFO` with a 250 reply. The
/// command is allowed before authentication.
pub fn control_port_responds(addr: SocketAddr) -> bool {
    let Ok(mut stream) = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT) else {
        return false;
    };
    if stream.set_read_timeout(Some(CONNECT_TIMEOUT)).is_err()
        || stream.write_all(b"PROTOCOLINFO 1\r\n").is_err()
    {
        return false;
    }
    let mut line = String::new();
    match BufReader::new(&stream).read_line(&mut line) {
        Ok(read) if read > 0 => line.starts_with("250"),
        _ => false,
    }
}
