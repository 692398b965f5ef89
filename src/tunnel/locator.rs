//! Locating and probing the frpc executable.
//!
//! Availability (a candidate file exists) and health (the binary answers the
//! version probe) are tracked separately: a present-but-broken binary needs a
//! different user-facing message than an absent one.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use super::error::{TunnelError, TunnelResult};
use super::process::{run_with_timeout, RunError};

/// Executable name searched for.
#[cfg(not(windows))]
pub const BINARY_NAME: &str = "frpc";
/// Executable name searched for.
#[cfg(windows)]
pub const BINARY_NAME: &str = "frpc.exe";

/// Bound on the `-v` version probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Locates the frpc executable and verifies it runs.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    path: Option<PathBuf>,
}

impl BinaryLocator {
    /// Search for frpc, honoring an explicit override if it points at an
    /// existing file.
    ///
    /// Search order: the override, the process PATH, the directory of the
    /// running executable and its parent, then conventional install locations.
    pub fn discover(override_path: Option<&Path>) -> Self {
        if let Some(path) = override_path {
            if path.is_file() {
                info!("using frpc override: {}", path.display());
                return Self {
                    path: Some(path.to_path_buf()),
                };
            }
            debug!("frpc override {} does not exist, searching", path.display());
        }

        let path = search_path_dirs()
            .chain(exe_relative_dirs())
            .chain(conventional_dirs())
            .map(|dir| dir.join(BINARY_NAME))
            .find(|candidate| candidate.is_file());

        match &path {
            Some(p) => info!("found frpc at {}", p.display()),
            None => debug!("no frpc executable found"),
        }
        Self { path }
    }

    /// Construct a locator with a known outcome (for testing and embedding).
    pub fn with_binary(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Path of the located binary, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Whether the located file still exists.
    ///
    /// Re-stats on every call, so a binary deleted after discovery is
    /// reported as unavailable rather than failing later with a confusing
    /// probe error.
    pub fn is_available(&self) -> bool {
        self.path.as_deref().is_some_and(Path::is_file)
    }

    /// Run `frpc -v` under a 5s bound and return the version string.
    ///
    /// Distinguishes missing file, permission denial, timeout, and non-zero
    /// exit; none of them are coerced into "unavailable".
    pub fn probe(&self) -> TunnelResult<String> {
        let path = self.path.as_deref().ok_or(TunnelError::BinaryUnavailable)?;

        let mut cmd = Command::new(path);
        cmd.arg("-v");

        match run_with_timeout(&mut cmd, PROBE_TIMEOUT) {
            Ok(output) if output.status.success() => Ok(output.stdout.trim().to_string()),
            Ok(output) => Err(TunnelError::BinaryUnhealthy {
                reason: format!(
                    "version probe exited with {}: {}",
                    output.status,
                    output.combined()
                ),
            }),
            Err(RunError::TimedOut) => Err(TunnelError::BinaryUnhealthy {
                reason: "version probe timed out".to_string(),
            }),
            Err(RunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TunnelError::BinaryUnhealthy {
                    reason: format!("file vanished: {}", path.display()),
                })
            }
            Err(RunError::Spawn(e)) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                Err(TunnelError::BinaryUnhealthy {
                    reason: format!("no execute permission on {}", path.display()),
                })
            }
            Err(RunError::Spawn(e)) | Err(RunError::Wait(e)) => Err(TunnelError::BinaryUnhealthy {
                reason: format!("version probe failed: {e}"),
            }),
        }
    }
}

/// Directories from the process search path.
fn search_path_dirs() -> impl Iterator<Item = PathBuf> {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect::<Vec<_>>())
        .unwrap_or_default()
        .into_iter()
}

/// The directory containing the running program, and its parent.
fn exe_relative_dirs() -> impl Iterator<Item = PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            dirs.push(dir.to_path_buf());
            if let Some(parent) = dir.parent() {
                dirs.push(parent.to_path_buf());
            }
        }
    }
    dirs.into_iter()
}

/// Conventional install locations per platform.
#[cfg(not(windows))]
fn conventional_dirs() -> impl Iterator<Item = PathBuf> {
    let mut dirs = vec![
        PathBuf::from("/usr/local/bin"),
        PathBuf::from("/usr/bin"),
        PathBuf::from("/opt/frp"),
    ];
    if let Some(home) = dirs::home_dir() {
        dirs.insert(2, home.join(".local/bin"));
    }
    dirs.into_iter()
}

/// Conventional install locations per platform.
#[cfg(windows)]
fn conventional_dirs() -> impl Iterator<Item = PathBuf> {
    let mut dirs = vec![
        PathBuf::from("C:/frp"),
        PathBuf::from("C:/Program Files/frp"),
        PathBuf::from("C:/Program Files (x86)/frp"),
    ];
    if let Some(home) = dirs::home_dir() {
        dirs.insert(1, home.join("frp"));
    }
    dirs.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join(BINARY_NAME);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "#!/bin/sh\n{body}").unwrap();
        drop(file);
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_override_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo 0.52.3");
        let locator = BinaryLocator::discover(Some(script.as_path()));
        assert_eq!(locator.path(), Some(script.as_path()));
        assert!(locator.is_available());
    }

    #[test]
    fn test_missing_override_falls_back_to_search() {
        let locator = BinaryLocator::discover(Some(Path::new("/nonexistent/frpc")));
        // The override is ignored; whatever the search finds (possibly
        // nothing) must not be the bogus path.
        assert_ne!(locator.path(), Some(Path::new("/nonexistent/frpc")));
    }

    #[test]
    fn test_probe_returns_version() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo 0.52.3");
        let locator = BinaryLocator::with_binary(Some(script));
        assert_eq!(locator.probe().unwrap(), "0.52.3");
    }

    #[test]
    fn test_probe_nonzero_exit_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "echo broken >&2; exit 1");
        let locator = BinaryLocator::with_binary(Some(script));
        match locator.probe() {
            Err(TunnelError::BinaryUnhealthy { reason }) => assert!(reason.contains("broken")),
            other => panic!("expected BinaryUnhealthy, got {other:?}"),
        }
    }

    #[test]
    fn test_probe_without_binary_is_unavailable() {
        let locator = BinaryLocator::with_binary(None);
        assert!(!locator.is_available());
        assert!(matches!(
            locator.probe(),
            Err(TunnelError::BinaryUnavailable)
        ));
    }

    #[test]
    fn test_probe_missing_file_is_unhealthy_not_unavailable() {
        let locator = BinaryLocator::with_binary(Some(PathBuf::from("/nonexistent/frpc")));
        assert!(matches!(
            locator.probe(),
            Err(TunnelError::BinaryUnhealthy { .. })
        ));
    }

    #[test]
    fn test_probe_no_exec_permission() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(BINARY_NAME);
        std::fs::write(&path, "#!/bin/sh\necho hi").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();
        let locator = BinaryLocator::with_binary(Some(path));
        match locator.probe() {
            Err(TunnelError::BinaryUnhealthy { reason }) => {
                assert!(reason.contains("permission"), "reason: {reason}")
            }
            other => panic!("expected BinaryUnhealthy, got {other:?}"),
        }
    }
}
