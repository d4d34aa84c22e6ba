#![forbid(unsafe_code)]

//! Command-line entry point: download one YouTube video or short through
//! tor and transcode it into the output directory.

use anyhow::{Context, Result, bail};
use clap::Parser;
use regionfree_tools::config::{Settings, SettingsOverrides, ToolOverrides, resolve_settings};
use regionfree_tools::logging::init_logging;
use regionfree_tools::pipeline::{Outcome, Pipeline};
use regionfree_tools::shutdown::stop_daemon_on_termination;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::ExitCode;

/// Fetch a YouTube video or short through a local tor proxy and convert it
/// into a playable file with a clean name.
#[derive(Debug, Parser)]
#[command(name = "regionfree", version)]
#[command(about = "Download region-locked YouTube videos through tor", long_about = None)]
struct Args {
    /// Video or short link. Prompted for when omitted.
    url: Option<String>,

    /// Debug logging and full tor/ffmpeg output.
    #[arg(short, long)]
    verbose: bool,

    /// Path to a .env file with REGIONFREE_* settings.
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Where the finished file is written.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Where raw downloads are staged before transcoding.
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,

    /// Where yt-dlp, ffmpeg and tor are installed when missing.
    #[arg(long, value_name = "DIR")]
    tools_dir: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    yt_dlp: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    ffmpeg: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    tor: Option<PathBuf>,

    /// 7-Zip executable, only used to unpack ffmpeg on Windows.
    #[arg(long, value_name = "PATH")]
    sevenzip: Option<PathBuf>,

    #[arg(long, value_name = "PORT")]
    socks_port: Option<u16>,

    #[arg(long, value_name = "PORT")]
    control_port: Option<u16>,

    /// Two-letter country code for tor exit relays, or "any".
    #[arg(long, value_name = "CC")]
    exit_country: Option<String>,

    /// Seconds to wait for tor to become ready.
    #[arg(long, value_name = "SECS")]
    ready_timeout: Option<u64>,

    /// Output container: mp4, mkv or webm.
    #[arg(long, value_name = "FORMAT")]
    format: Option<String>,

    /// Maximum length of the output file name, in characters.
    #[arg(long, value_name = "CHARS")]
    max_name_len: Option<usize>,

    /// Replace an existing output file.
    #[arg(long)]
    overwrite: bool,

    /// Never download missing tools.
    #[arg(long)]
    no_install: bool,

    /// Skip the check.torproject.org exit verification.
    #[arg(long)]
    skip_tor_check: bool,
}

impl Args {
    fn overrides(&self) -> SettingsOverrides {
        SettingsOverrides {
            output_dir: self.output_dir.clone(),
            work_dir: self.work_dir.clone(),
            tools_dir: self.tools_dir.clone(),
            tools: ToolOverrides {
                yt_dlp: self.yt_dlp.clone(),
                ffmpeg: self.ffmpeg.clone(),
                tor: self.tor.clone(),
                sevenzip: self.sevenzip.clone(),
            },
            socks_port: self.socks_port,
            control_port: self.control_port,
            exit_country: self.exit_country.clone(),
            ready_timeout_secs: self.ready_timeout,
            format: self.format.clone(),
            max_name_len: self.max_name_len,
            install_missing: self.no_install.then_some(false),
            check_exit: self.skip_tor_check.then_some(false),
            overwrite: self.overwrite,
            verbose: self.verbose,
            env_path: self.env_file.clone(),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(err) = init_logging(args.verbose) {
        eprintln!("regionfree: {err:#}");
    }

    let settings = match resolve_settings(args.overrides()) {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("regionfree: invalid configuration: {err:#}");
            return ExitCode::from(1);
        }
    };

    let url = match args.url.clone() {
        Some(url) => url,
        None => match prompt_for_url() {
            Ok(url) => url,
            Err(err) => {
                eprintln!("regionfree: {err:#}");
                return ExitCode::from(1);
            }
        },
    };

    print_banner(&settings);

    let mut pipeline = Pipeline::new(settings);
    if let Err(err) = stop_daemon_on_termination(pipeline.daemon_slot()) {
        eprintln!("regionfree: {err:#}");
    }
    match pipeline.run(&url) {
        Ok(outcome) => {
            print_summary(&outcome);
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!();
            eprintln!("Error: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}

fn prompt_for_url() -> Result<String> {
    print!("Enter a video URL: ");
    io::stdout().flush().context("flushing prompt")?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("reading URL from stdin")?;
    let url = line.trim();
    if url.is_empty() {
        bail!("no URL given");
    }
    Ok(url.to_string())
}

fn print_banner(settings: &Settings) {
    println!("===================================");
    println!("regionfree downloader");
    println!("===================================");
    println!("Output directory: {}", settings.output_dir.display());
    println!("Work directory: {}", settings.work_dir.display());
    println!(
        "Tor SOCKS port: {} (exit: {})",
        settings.proxy.socks_port,
        settings.proxy.exit_country.as_deref().unwrap_or("any")
    );
    println!("Format: {}", settings.format);
    println!();
}

fn print_summary(outcome: &Outcome) {
    println!();
    println!("===================================");
    println!("Download complete!");
    println!("===================================");
    if let Some(title) = &outcome.title {
        println!("Title: {title}");
    }
    println!("Source: {}", outcome.url.canonical());
    println!("Saved to: {}", outcome.output.display());
    if !outcome.raw_removed {
        println!("Raw download was kept in the work directory.");
    }
}
