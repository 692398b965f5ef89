//! Reload strategies for the running frpc process.
//!
//! frpc has no way to stop a single proxy: the process is asked to re-read its
//! config document instead. Hosts with a reload-on-signal capability send
//! SIGHUP; hosts without one must restart the process. The strategy is chosen
//! once at supervisor construction so the lifecycle state machine never
//! branches on platform.

use nix::sys::signal::Signal;
use tracing::debug;

use super::error::{TunnelError, TunnelResult};
use super::process::TunnelProcess;

/// What the supervisor should do after a reload attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The process was told to re-read its config; nothing else to do.
    Reloaded,
    /// The strategy has no in-place reload; terminate and respawn.
    RestartRequired,
}

/// A way of propagating a changed config document to the running process.
pub trait ReloadStrategy: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Ask the process to pick up the current config document.
    fn reload(&self, process: &TunnelProcess) -> TunnelResult<ReloadOutcome>;
}

/// Pick the reload strategy for this host.
pub fn for_host() -> Box<dyn ReloadStrategy> {
    #[cfg(unix)]
    {
        Box::new(SignalReload)
    }
    #[cfg(not(unix))]
    {
        Box::new(RestartReload)
    }
}

/// Reload by sending SIGHUP.
pub struct SignalReload;

impl ReloadStrategy for SignalReload {
    fn name(&self) -> &'static str {
        "sighup"
    }

    fn reload(&self, process: &TunnelProcess) -> TunnelResult<ReloadOutcome> {
        process
            .signal(Signal::SIGHUP)
            .map_err(|e| TunnelError::ReloadFailed(format!("SIGHUP failed: {e}")))?;
        debug!("sent SIGHUP to frpc pid {}", process.pid());
        Ok(ReloadOutcome::Reloaded)
    }
}

/// No in-place reload: always request a restart.
pub struct RestartReload;

impl ReloadStrategy for RestartReload {
    fn name(&self) -> &'static str {
        "restart"
    }

    fn reload(&self, _process: &TunnelProcess) -> TunnelResult<ReloadOutcome> {
        Ok(ReloadOutcome::RestartRequired)
    }
}
