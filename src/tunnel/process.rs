//! Handle to the external frpc process.
//!
//! Exactly one frpc process serves the whole rule set; the supervisor owns the
//! handle and nothing outside this module touches the raw child. Output is
//! forwarded line by line over a channel by dedicated reader threads, so no
//! process-wide stream redirection is ever needed.

use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::error::{TunnelError, TunnelResult};

/// How long to wait after spawn before checking for an early exit.
pub(crate) const STARTUP_GRACE: Duration = Duration::from_millis(500);

/// Bound on draining output from a process that exited during the grace period.
pub(crate) const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// At most this many bytes of early-exit output are surfaced to the caller.
pub(crate) const EXIT_OUTPUT_LIMIT: usize = 500;

/// Poll step for bounded waits.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Why a bounded command run did not produce an exit status.
#[derive(Debug)]
pub(crate) enum RunError {
    /// The process could not be spawned.
    Spawn(std::io::Error),
    /// Polling the child failed.
    Wait(std::io::Error),
    /// The deadline passed; the child was killed.
    TimedOut,
}

/// Captured result of a bounded command run.
#[derive(Debug)]
pub(crate) struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    /// Stdout and stderr joined, trimmed.
    pub fn combined(&self) -> String {
        let mut text = String::new();
        text.push_str(self.stdout.trim());
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(err);
        }
        text
    }
}

/// Run a command to completion under a deadline.
///
/// Output is read after exit; a child that fills its pipes before exiting is
/// unblocked by the deadline kill. Used for the version probe and `verify`,
/// both of which produce small output.
pub(crate) fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<CmdOutput, RunError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(RunError::Spawn)?;
    let deadline = Instant::now() + timeout;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                let mut stdout = String::new();
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stdout.take() {
                    let _ = pipe.read_to_string(&mut stdout);
                }
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr);
                }
                return Ok(CmdOutput {
                    status,
                    stdout,
                    stderr,
                });
            }
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunError::TimedOut);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(RunError::Wait(e));
            }
        }
    }
}

/// The supervised frpc child process.
pub struct TunnelProcess {
    child: Child,
    pid: u32,
}

impl TunnelProcess {
    /// Spawn `<binary> -c <config_path>` with piped output.
    pub(crate) fn spawn(binary: &Path, config_path: &Path) -> TunnelResult<Self> {
        let child = Command::new(binary)
            .arg("-c")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(TunnelError::ProcessLaunchFailed)?;

        let pid = child.id();
        debug!("frpc process spawned, pid {pid}");
        Ok(Self { child, pid })
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether the process is still alive.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status if the process has already terminated.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    /// Send a signal to the process.
    pub(crate) fn signal(&self, signal: Signal) -> Result<(), nix::errno::Errno> {
        kill(Pid::from_raw(self.pid as i32), signal)
    }

    /// Take the output pipes for the reader threads. Each pipe can be taken once.
    pub(crate) fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }

    /// Capture up to [`EXIT_OUTPUT_LIMIT`] bytes of output from a process that
    /// exited during the startup grace period.
    ///
    /// Reading happens on a helper thread bounded by [`EXIT_DRAIN_TIMEOUT`];
    /// if something (a lingering grandchild holding the pipe) keeps the read
    /// from finishing, the process group is killed and one more bounded wait
    /// is attempted before giving up.
    pub(crate) fn drain_exit_output(&mut self) -> String {
        let (stdout, stderr) = self.take_output();
        let (tx, rx) = std_mpsc::channel();

        std::thread::spawn(move || {
            let mut text = String::new();
            if let Some(mut pipe) = stdout {
                let _ = pipe.read_to_string(&mut text);
            }
            if let Some(mut pipe) = stderr {
                let _ = pipe.read_to_string(&mut text);
            }
            let _ = tx.send(text);
        });

        let mut output = match rx.recv_timeout(EXIT_DRAIN_TIMEOUT) {
            Ok(text) => text,
            Err(_) => {
                warn!("timed out draining frpc exit output, killing");
                let _ = self.child.kill();
                rx.recv_timeout(EXIT_DRAIN_TIMEOUT)
                    .unwrap_or_else(|_| "(output not captured)".to_string())
            }
        };

        // Reap the exited child.
        let _ = self.child.wait();

        if output.trim().is_empty() {
            output = "(no output)".to_string();
        }
        truncate_to_boundary(&mut output, EXIT_OUTPUT_LIMIT);
        output
    }

    /// Terminate the process: SIGTERM, wait up to `grace`, then SIGKILL.
    ///
    /// Never fails; errors are logged so a stale handle can always be dropped.
    pub(crate) fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }

        if let Err(e) = self.signal(Signal::SIGTERM) {
            warn!("SIGTERM to frpc pid {} failed: {e}", self.pid);
        }

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_running() {
                let _ = self.child.wait();
                debug!("frpc pid {} exited after SIGTERM", self.pid);
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        warn!("frpc pid {} did not exit within grace period, killing", self.pid);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Forward each output line of the process to `line_tx` until end of stream.
///
/// One reader thread per pipe; both feed the same channel, which is the merge
/// point for the process's output stream. The threads end on their own when
/// the process exits and the pipes hit EOF.
pub(crate) fn spawn_output_readers(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    line_tx: mpsc::Sender<String>,
) {
    use std::io::{BufRead, BufReader};

    fn reader_loop<R: Read + Send + 'static>(pipe: R, tx: mpsc::Sender<String>, label: &'static str) {
        let spawned = std::thread::Builder::new()
            .name(format!("frpc-{label}-reader"))
            .spawn(move || {
                // Keeps draining even if the receiver goes away, so the child
                // never blocks on a full pipe.
                let mut forward = true;
                for line in BufReader::new(pipe).lines() {
                    match line {
                        Ok(line) => {
                            trace!("frpc {label}: {line}");
                            if forward && tx.blocking_send(line).is_err() {
                                forward = false;
                            }
                        }
                        Err(e) => {
                            debug!("frpc {label} read error: {e}");
                            break;
                        }
                    }
                }
                trace!("frpc {label} stream closed");
            });
        if let Err(e) = spawned {
            warn!("could not spawn frpc {label} reader: {e}");
        }
    }

    if let Some(pipe) = stdout {
        reader_loop(pipe, line_tx.clone(), "stdout");
    }
    if let Some(pipe) = stderr {
        reader_loop(pipe, line_tx, "stderr");
    }
}

/// Truncate a string to at most `limit` bytes on a char boundary.
fn truncate_to_boundary(text: &mut String, limit: usize) {
    if text.len() <= limit {
        return;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
