#![forbid(unsafe_code)]

//! Stops a tor daemon this run started when the process is told to quit.

use anyhow::{Context, Result};
use std::thread;
use tokio::signal;
use tracing::warn;

use crate::tor::DaemonSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Interrupt,
    Terminate,
}

impl Termination {
    /// Conventional shell status for death by this signal.
    pub fn exit_code(self) -> i32 {
        match self {
            Termination::Interrupt => 130,
            Termination::Terminate => 143,
        }
    }
}

/// Watches for Ctrl+C (and SIGTERM on unix) on a background thread. On the
/// first signal the daemon in `slot` is stopped and the process exits.
pub fn stop_daemon_on_termination(slot: DaemonSlot) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;
    thread::Builder::new()
        .name("signal-watch".into())
        .spawn(move || {
            let termination = runtime.block_on(wait_for_termination());
            warn!(?termination, "stopping");
            slot.stop();
            std::process::exit(termination.exit_code());
        })
        .context("spawning signal watcher")?;
    Ok(())
}

async fn wait_for_termination() -> Termination {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal as unix_signal};

        let mut terminate = match unix_signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(err) => {
                warn!("could not install SIGTERM handler: {err}");
                return ctrl_c().await;
            }
        };
        tokio::select! {
            interrupted = ctrl_c() => interrupted,
            _ = terminate.recv() => Termination::Terminate,
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c().await
    }
}

async fn ctrl_c() -> Termination {
    match signal::ctrl_c().await {
        Ok(()) => Termination::Interrupt,
        Err(err) => {
            warn!("could not install Ctrl+C handler: {err}");
            // Keep waiting on the other signal instead of exiting.
            std::future::pending::<Termination>().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_shell_convention() {
        assert_eq!(Termination::Interrupt.exit_code(), 130);
        assert_eq!(Termination::Terminate.exit_code(), 143);
    }
}
