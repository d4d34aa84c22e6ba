#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::sanitize::DEFAULT_MAX_NAME_LEN;
use crate::transcode::TargetFormat;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_SOCKS_PORT: u16 = 12212;
pub const DEFAULT_CONTROL_PORT: u16 = 12213;
pub const DEFAULT_EXIT_COUNTRY: &str = "se";
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 40;
const WORK_SUBDIR: &str = ".regionfree";
const APP_DIR: &str = "regionfree";

/// Explicit executable locations. `None` means "search for it".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOverrides {
    pub yt_dlp: Option<PathBuf>,
    pub ffmpeg: Option<PathBuf>,
    pub tor: Option<PathBuf>,
    pub sevenzip: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxySettings {
    pub socks_port: u16,
    pub control_port: u16,
    pub exit_country: Option<String>,
    pub ready_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub tools_dir: PathBuf,
    pub tools: ToolOverrides,
    pub proxy: ProxySettings,
    pub format: TargetFormat,
    pub max_name_len: usize,
    pub install_missing: bool,
    pub check_exit: bool,
    pub overwrite: bool,
    pub verbose: bool,
}

/// Values coming from the command line. They beat the environment, which
/// beats the `.env` file, which beats the built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub output_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
    pub tools_dir: Option<PathBuf>,
    pub tools: ToolOverrides,
    pub socks_port: Option<u16>,
    pub control_port: Option<u16>,
    pub exit_country: Option<String>,
    pub ready_timeout_secs: Option<u64>,
    pub format: Option<String>,
    pub max_name_len: Option<usize>,
    pub install_missing: Option<bool>,
    pub check_exit: Option<bool>,
    pub overwrite: bool,
    pub verbose: bool,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    let cwd = env::current_dir().context("reading current directory")?;
    build_settings_with_overrides(&file_vars, env_var_string, &cwd, overrides)
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    cwd: &Path,
    overrides: SettingsOverrides,
) -> Result<Settings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let lookup_path = |key: &str| lookup(key).map(PathBuf::from);

    let output_dir = overrides
        .output_dir
        .or_else(|| lookup_path("REGIONFREE_OUTPUT_DIR"))
        .unwrap_or_else(|| default_output_dir(&env_lookup, cwd));
    let work_dir = overrides
        .work_dir
        .or_else(|| lookup_path("REGIONFREE_WORK_DIR"))
        .unwrap_or_else(|| output_dir.join(WORK_SUBDIR));
    let tools_dir = overrides
        .tools_dir
        .or_else(|| lookup_path("REGIONFREE_TOOLS_DIR"))
        .unwrap_or_else(|| default_tools_dir(&env_lookup, cwd));

    let tools = ToolOverrides {
        yt_dlp: overrides
            .tools
            .yt_dlp
            .or_else(|| lookup_path("REGIONFREE_YT_DLP")),
        ffmpeg: overrides
            .tools
            .ffmpeg
            .or_else(|| lookup_path("REGIONFREE_FFMPEG")),
        tor: overrides.tools.tor.or_else(|| lookup_path("REGIONFREE_TOR")),
        sevenzip: overrides
            .tools
            .sevenzip
            .or_else(|| lookup_path("REGIONFREE_7Z")),
    };

    let socks_port = overrides
        .socks_port
        .or_else(|| lookup("REGIONFREE_SOCKS_PORT").and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_SOCKS_PORT);
    let control_port = overrides
        .control_port
        .or_else(|| lookup("REGIONFREE_CONTROL_PORT").and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_CONTROL_PORT);
    if socks_port == control_port {
        bail!("SOCKS and control ports must differ (both are {socks_port})");
    }
    let exit_country = parse_exit_country(
        overrides
            .exit_country
            .or_else(|| lookup("REGIONFREE_EXIT_COUNTRY"))
            .as_deref()
            .unwrap_or(DEFAULT_EXIT_COUNTRY),
    )?;
    let ready_timeout_secs = overrides
        .ready_timeout_secs
        .or_else(|| {
            lookup("REGIONFREE_READY_TIMEOUT_SECS").and_then(|value| value.parse().ok())
        })
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_READY_TIMEOUT_SECS);

    let format = match overrides.format.or_else(|| lookup("REGIONFREE_FORMAT")) {
        Some(value) => value.parse::<TargetFormat>()?,
        None => TargetFormat::default(),
    };
    let max_name_len = overrides
        .max_name_len
        .or_else(|| lookup("REGIONFREE_MAX_NAME_LEN").and_then(|value| value.parse().ok()))
        .filter(|len| *len > 0)
        .unwrap_or(DEFAULT_MAX_NAME_LEN);
    let install_missing = overrides
        .install_missing
        .or_else(|| lookup("REGIONFREE_AUTO_INSTALL").and_then(|value| parse_bool(&value)))
        .unwrap_or(true);

    Ok(Settings {
        output_dir,
        work_dir,
        tools_dir,
        tools,
        proxy: ProxySettings {
            socks_port,
            control_port,
            exit_country,
            ready_timeout: Duration::from_secs(ready_timeout_secs),
        },
        format,
        max_name_len,
        install_missing,
        check_exit: overrides.check_exit.unwrap_or(true),
        overwrite: overrides.overwrite,
        verbose: overrides.verbose,
    })
}

/// `~/Downloads` when it exists, otherwise the current directory.
fn default_output_dir(env_lookup: &impl Fn(&str) -> Option<String>, cwd: &Path) -> PathBuf {
    home_dir(env_lookup)
        .map(|home| home.join("Downloads"))
        .filter(|downloads| downloads.is_dir())
        .unwrap_or_else(|| cwd.to_path_buf())
}

fn default_tools_dir(env_lookup: &impl Fn(&str) -> Option<String>, cwd: &Path) -> PathBuf {
    let data_home = if cfg!(windows) {
        env_lookup("LOCALAPPDATA").map(PathBuf::from)
    } else {
        env_lookup("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| home_dir(env_lookup).map(|home| home.join(".local").join("share")))
    };
    match data_home {
        Some(base) => base.join(APP_DIR).join("tools"),
        None => cwd.join(".regionfree-tools"),
    }
}

fn home_dir(env_lookup: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let key = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    env_lookup(key).map(PathBuf::from)
}

/// Accepts a two-letter country code. `none`/`any` disables exit pinning.
fn parse_exit_country(value: &str) -> Result<Option<String>> {
    let trimmed = value
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .to_ascii_lowercase();
    if trimmed.is_empty() || trimmed == "none" || trimmed == "any" {
        return Ok(None);
    }
    if trimmed.len() != 2 || !trimmed.chars().all(|c| c.is_ascii_lowercase()) {
        bail!("invalid exit country {value:?}; expected a two-letter code such as \"se\"");
    }
    Ok(Some(trimmed))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
