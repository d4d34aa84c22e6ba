#![forbid(unsafe_code)]

use anyhow::{Result, anyhow};
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset.
pub fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "info,regionfree_tools=debug,regionfree=debug"
    } else {
        "info"
    }
}

/// Initialize structured logging on stderr so it never mixes with the
/// progress output of yt-dlp and ffmpeg on stdout.
pub fn init_logging(verbose: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(verbose)));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .try_init()
        .map_err(|err| anyhow!("failed to initialize logging: {err}"))?;

    tracing::debug!("logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_enables_debug_for_the_crate() {
        assert!(default_directives(true).contains("regionfree_tools=debug"));
        assert!(!default_directives(false).contains("debug"));
    }

    #[test]
    fn directives_parse() {
        EnvFilter::try_new(default_directives(true)).unwrap();
        EnvFilter::try_new(default_directives(false)).unwrap();
    }
}
