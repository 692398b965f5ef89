//! Error types for tunnel supervision.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from rule management, config reconciliation, and frpc supervision.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// No frpc executable could be located.
    #[error("frpc executable not found; place it in PATH, next to the program, or a standard install directory")]
    BinaryUnavailable,

    /// An frpc executable exists but did not pass the version probe.
    #[error("frpc executable is not usable: {reason}")]
    BinaryUnhealthy {
        /// Why the probe failed (non-zero exit, timeout, permissions, ...).
        reason: String,
    },

    /// A rule with the same derived name already exists.
    #[error("rule {0} already exists")]
    DuplicateRule(String),

    /// The named rule is not registered.
    #[error("rule {0} does not exist")]
    RuleNotFound(String),

    /// The config document lacks the `[common]` connection section.
    #[error("config file {path} has no [common] section; configure the server connection first")]
    ConfigMissingSection {
        /// Path of the incomplete document.
        path: PathBuf,
    },

    /// `frpc verify` rejected the config document.
    #[error("config verification failed: {diagnostic}")]
    ConfigInvalid {
        /// Diagnostic text captured from frpc.
        diagnostic: String,
    },

    /// The OS refused to spawn the frpc process.
    #[error("failed to launch frpc: {0}")]
    ProcessLaunchFailed(#[source] std::io::Error),

    /// frpc exited within the startup grace period.
    #[error("frpc exited immediately (code {code:?}): {output}")]
    ProcessExitedImmediately {
        /// Exit code, if the process exited normally.
        code: Option<i32>,
        /// Up to the first 500 bytes of captured output.
        output: String,
    },

    /// Both the reload signal and the restart fallback failed.
    #[error("could not reload frpc configuration: {0}")]
    ReloadFailed(String),

    /// Reading or writing the config document failed.
    #[error("config I/O error on {path}: {source}")]
    Io {
        /// Path of the document being read or written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for tunnel operations.
pub type TunnelResult<T> = Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_unhealthy_display() {
        let err = TunnelError::BinaryUnhealthy {
            reason: "version probe timed out".to_string(),
        };
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn test_duplicate_rule_display() {
        let err = TunnelError::DuplicateRule("tcp_8080_to_8080".to_string());
        assert!(err.to_string().contains("tcp_8080_to_8080"));
    }

    #[test]
    fn test_exited_immediately_display() {
        let err = TunnelError::ProcessExitedImmediately {
            code: Some(1),
            output: "login to server failed".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("login to server failed"));
        assert!(msg.contains('1'));
    }

    #[test]
    fn test_missing_section_display() {
        let err = TunnelError::ConfigMissingSection {
            path: PathBuf::from("/tmp/frpc.toml"),
        };
        assert!(err.to_string().contains("[common]"));
    }
}
