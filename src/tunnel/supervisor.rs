//! Rule registry and frpc process supervision.
//!
//! One mutex guards the registry, the suspended set, and the process handle;
//! every public operation holds it for its full duration, including config
//! verification and the bring-up grace sleep. That serializes rule management
//! by design: two bring-ups or reconciles can never interleave. Callers that
//! need latency keep these calls off their hot thread.
//!
//! The document's generated sections track the registry minus rules the user
//! has explicitly stopped: `stop` withholds a rule's section, `start` restores
//! it, `remove` deletes the rule. Add/remove sequences therefore keep the
//! document in one-to-one correspondence with the registry.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::error::{TunnelError, TunnelResult};
use super::locator::BinaryLocator;
use super::process::{run_with_timeout, spawn_output_readers, RunError, TunnelProcess, STARTUP_GRACE};
use super::reconcile::ConfigReconciler;
use super::reload::{self, ReloadOutcome, ReloadStrategy};
use super::rule::{Protocol, ProxyRule, ProxyStatus};

/// Bound on `frpc verify`.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL when stopping the process.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Owns the forwarding rules and the single frpc process serving them.
pub struct TunnelSupervisor {
    locator: BinaryLocator,
    reconciler: ConfigReconciler,
    reload: Box<dyn ReloadStrategy>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rules: HashMap<String, ProxyRule>,
    /// Rules present in the registry whose section is withheld from the
    /// document because the user stopped them.
    suspended: HashSet<String>,
    /// The `[common]` section supplied by the settings layer.
    connection: Option<toml::Table>,
    process: Option<TunnelProcess>,
    output_tx: Option<mpsc::Sender<String>>,
}

impl TunnelSupervisor {
    /// Supervisor writing its config document at `config_path`.
    pub fn new(locator: BinaryLocator, config_path: PathBuf) -> Self {
        Self {
            locator,
            reconciler: ConfigReconciler::new(config_path),
            reload: reload::for_host(),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Replace the reload strategy (capability injection, tests).
    #[must_use]
    pub fn with_reload_strategy(mut self, strategy: Box<dyn ReloadStrategy>) -> Self {
        self.reload = strategy;
        self
    }

    /// Supply the `[common]` connection section used on the next reconcile.
    pub fn set_connection(&self, section: toml::Table) {
        self.locked().connection = Some(section);
    }

    /// Register the channel receiving frpc output lines.
    ///
    /// Last registration wins; it takes effect at the next process bring-up.
    pub fn set_output_channel(&self, tx: mpsc::Sender<String>) {
        self.locked().output_tx = Some(tx);
    }

    /// Declare a new forwarding rule and reconcile the document.
    ///
    /// The insert is rolled back if reconciliation fails, so in-memory and
    /// on-disk state never diverge by more than one failed call.
    pub fn add(
        &self,
        local_port: u16,
        remote_port: Option<u16>,
        protocol: Protocol,
    ) -> TunnelResult<String> {
        let mut inner = self.locked();

        if !self.locator.is_available() {
            return Err(TunnelError::BinaryUnavailable);
        }

        let rule = ProxyRule::new(local_port, remote_port, protocol);
        let name = rule.name.clone();
        if inner.rules.contains_key(&name) {
            return Err(TunnelError::DuplicateRule(name));
        }

        inner.rules.insert(name.clone(), rule);
        if let Err(e) = self.reconcile_locked(&inner) {
            inner.rules.remove(&name);
            return Err(e);
        }

        info!("added rule {name}");
        Ok(name)
    }

    /// Delete a rule, stopping it first if it is running.
    ///
    /// Returns false if the rule is unknown or the final reconcile failed.
    pub fn remove(&self, name: &str) -> bool {
        let mut inner = self.locked();

        let status = match inner.rules.get(name) {
            Some(rule) => rule.status,
            None => return false,
        };
        if status == ProxyStatus::Running {
            self.stop_locked(&mut inner, name);
        }

        inner.rules.remove(name);
        inner.suspended.remove(name);
        match self.reconcile_locked(&inner) {
            Ok(()) => {
                info!("removed rule {name}");
                true
            }
            Err(e) => {
                error!("reconcile after removing {name} failed: {e}");
                false
            }
        }
    }

    /// Start serving a rule, bringing the frpc process up if needed.
    pub fn start(&self, name: &str) -> TunnelResult<String> {
        let mut inner = self.locked();
        self.start_locked(&mut inner, name)
    }

    /// Stop serving a rule; the process is reloaded, not terminated, since it
    /// serves the whole rule set.
    ///
    /// Returns true unless the rule is unknown or propagation failed. Even on
    /// a failed propagation the rule stays `Stopped`: the in-memory intent and
    /// the written document are authoritative, and the next successful
    /// bring-up converges the process.
    pub fn stop(&self, name: &str) -> bool {
        let mut inner = self.locked();
        self.stop_locked(&mut inner, name)
    }

    /// Stop a running rule, or start a stopped one.
    pub fn toggle(&self, name: &str) -> TunnelResult<String> {
        let mut inner = self.locked();
        let status = inner
            .rules
            .get(name)
            .ok_or_else(|| TunnelError::RuleNotFound(name.to_string()))?
            .status;

        if status == ProxyStatus::Running {
            if self.stop_locked(&mut inner, name) {
                Ok(format!("stopped {name}"))
            } else {
                Err(TunnelError::ReloadFailed(format!(
                    "stopping {name} did not fully propagate"
                )))
            }
        } else {
            self.start_locked(&mut inner, name)
        }
    }

    /// Mark every rule stopped and terminate the frpc process.
    ///
    /// The handle is always cleared, even if termination misbehaved, so a
    /// later `start` is never blocked by a stale handle.
    pub fn stop_all(&self) {
        let mut inner = self.locked();
        for rule in inner.rules.values_mut() {
            rule.status = ProxyStatus::Stopped;
        }
        if let Some(mut process) = inner.process.take() {
            info!("terminating frpc pid {}", process.pid());
            process.terminate(STOP_GRACE);
        }
    }

    /// All declared rules, ordered by name.
    pub fn rules(&self) -> Vec<ProxyRule> {
        let inner = self.locked();
        let mut rules: Vec<_> = inner.rules.values().cloned().collect();
        rules.sort_by(|a, b| a.name.cmp(&b.name));
        rules
    }

    /// Rules currently being served.
    pub fn active_rules(&self) -> Vec<ProxyRule> {
        self.rules().into_iter().filter(ProxyRule::is_active).collect()
    }

    /// Lifecycle state of a rule, if it exists.
    pub fn rule_status(&self, name: &str) -> Option<ProxyStatus> {
        self.locked().rules.get(name).map(|r| r.status)
    }

    /// Find the rule forwarding a given local port.
    pub fn lookup_by_local_port(&self, port: u16) -> Option<ProxyRule> {
        self.locked()
            .rules
            .values()
            .find(|r| r.local_port == port)
            .cloned()
    }

    /// Path of the located frpc binary, if any.
    pub fn binary_path(&self) -> Option<PathBuf> {
        self.locator.path().map(Path::to_path_buf)
    }

    /// Whether an frpc executable is present.
    pub fn binary_available(&self) -> bool {
        self.locator.is_available()
    }

    /// Path of the managed config document.
    pub fn config_path(&self) -> &Path {
        self.reconciler.path()
    }

    /// Whether the frpc process is currently alive.
    pub fn is_process_running(&self) -> bool {
        self.locked()
            .process
            .as_mut()
            .map(TunnelProcess::is_running)
            .unwrap_or(false)
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Rewrite the document from current registry state.
    fn reconcile_locked(&self, inner: &Inner) -> TunnelResult<()> {
        let rules = inner
            .rules
            .values()
            .filter(|r| !inner.suspended.contains(&r.name));
        self.reconciler.reconcile(rules, inner.connection.as_ref())
    }

    fn start_locked(&self, inner: &mut Inner, name: &str) -> TunnelResult<String> {
        self.sync_process_liveness(inner);

        let rule = inner
            .rules
            .get(name)
            .ok_or_else(|| TunnelError::RuleNotFound(name.to_string()))?;
        if rule.status == ProxyStatus::Running {
            return Ok(format!("{name} is already running"));
        }

        if !self.locator.is_available() {
            return Err(TunnelError::BinaryUnavailable);
        }
        let version = self.locator.probe()?;
        debug!("using frpc {version}");

        if let Some(rule) = inner.rules.get_mut(name) {
            rule.status = ProxyStatus::Starting;
        }
        let was_suspended = inner.suspended.remove(name);

        let result = match self.reconcile_locked(inner) {
            Err(e) => Err(e),
            Ok(()) => {
                let live = inner
                    .process
                    .as_mut()
                    .map(TunnelProcess::is_running)
                    .unwrap_or(false);
                if live {
                    // The live process must pick up the restored section.
                    self.reload_locked(inner)
                } else {
                    self.bring_up_locked(inner)
                }
            }
        };

        match result {
            Ok(()) => {
                if let Some(rule) = inner.rules.get_mut(name) {
                    rule.status = ProxyStatus::Running;
                }
                info!("started rule {name}");
                Ok(format!("started {name}"))
            }
            Err(e) => {
                if was_suspended {
                    inner.suspended.insert(name.to_string());
                }
                if let Some(rule) = inner.rules.get_mut(name) {
                    rule.status = ProxyStatus::Stopped;
                }
                Err(e)
            }
        }
    }

    fn stop_locked(&self, inner: &mut Inner, name: &str) -> bool {
        let Some(rule) = inner.rules.get_mut(name) else {
            return false;
        };
        if rule.status == ProxyStatus::Stopped {
            return true;
        }
        rule.status = ProxyStatus::Stopping;

        inner.suspended.insert(name.to_string());
        let reconciled = match self.reconcile_locked(inner) {
            Ok(()) => true,
            Err(e) => {
                error!("reconcile while stopping {name} failed: {e}");
                false
            }
        };

        if let Some(rule) = inner.rules.get_mut(name) {
            rule.status = ProxyStatus::Stopped;
        }

        if !reconciled {
            return false;
        }

        let process_running = inner
            .process
            .as_mut()
            .map(TunnelProcess::is_running)
            .unwrap_or(false);
        if process_running {
            if let Err(e) = self.reload_locked(inner) {
                error!("propagating stop of {name} failed: {e}");
                return false;
            }
        }

        info!("stopped rule {name}");
        true
    }

    /// Ask the live process to re-read the document, restarting it when the
    /// strategy has no in-place reload. A failed signal falls back to restart
    /// exactly once; a failed restart surfaces as `ReloadFailed`.
    fn reload_locked(&self, inner: &mut Inner) -> TunnelResult<()> {
        let Some(process) = inner.process.as_mut() else {
            return Ok(());
        };
        if !process.is_running() {
            inner.process = None;
            return Ok(());
        }

        match self.reload.reload(process) {
            Ok(ReloadOutcome::Reloaded) => Ok(()),
            Ok(ReloadOutcome::RestartRequired) => {
                debug!("{} strategy requests restart", self.reload.name());
                self.restart_locked(inner).map_err(|e| {
                    TunnelError::ReloadFailed(format!("restart failed: {e}"))
                })
            }
            Err(signal_err) => {
                warn!("{} reload failed ({signal_err}), restarting frpc", self.reload.name());
                self.restart_locked(inner).map_err(|restart_err| {
                    TunnelError::ReloadFailed(format!(
                        "signal failed: {signal_err}; restart failed: {restart_err}"
                    ))
                })
            }
        }
    }

    fn restart_locked(&self, inner: &mut Inner) -> TunnelResult<()> {
        if let Some(mut process) = inner.process.take() {
            process.terminate(STOP_GRACE);
        }
        self.bring_up_locked(inner)
    }

    /// Verify the document, launch frpc, and watch for an early exit.
    fn bring_up_locked(&self, inner: &mut Inner) -> TunnelResult<()> {
        let binary = self
            .locator
            .path()
            .ok_or(TunnelError::BinaryUnavailable)?
            .to_path_buf();

        // Some frpc builds verify-succeed on a document with no [common]
        // section, so this is checked up front.
        if !self.reconciler.has_connection_section()? {
            return Err(TunnelError::ConfigMissingSection {
                path: self.reconciler.path().to_path_buf(),
            });
        }

        let mut verify = Command::new(&binary);
        verify.arg("verify").arg("-c").arg(self.reconciler.path());
        match run_with_timeout(&mut verify, VERIFY_TIMEOUT) {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                return Err(TunnelError::ConfigInvalid {
                    diagnostic: output.combined(),
                })
            }
            Err(RunError::TimedOut) => {
                return Err(TunnelError::ConfigInvalid {
                    diagnostic: "config verification timed out".to_string(),
                })
            }
            Err(RunError::Spawn(e)) | Err(RunError::Wait(e)) => {
                return Err(TunnelError::ProcessLaunchFailed(e))
            }
        }

        let mut process = TunnelProcess::spawn(&binary, self.reconciler.path())?;

        // Give the process a moment to fail on startup errors (bad auth,
        // unreachable server) so they surface here instead of silently.
        std::thread::sleep(STARTUP_GRACE);
        if let Some(status) = process.exit_status() {
            let output = process.drain_exit_output();
            return Err(TunnelError::ProcessExitedImmediately {
                code: status.code(),
                output,
            });
        }

        let (stdout, stderr) = process.take_output();
        let line_tx = inner
            .output_tx
            .clone()
            .unwrap_or_else(|| mpsc::channel(1).0);
        spawn_output_readers(stdout, stderr, line_tx);

        info!("frpc running, pid {}", process.pid());
        inner.process = Some(process);
        Ok(())
    }

    /// Drop a dead process handle and flag rules that thought they were
    /// running. The next bring-up revives them.
    fn sync_process_liveness(&self, inner: &mut Inner) {
        let died = match inner.process.as_mut() {
            Some(process) => !process.is_running(),
            None => return,
        };
        if !died {
            return;
        }

        warn!("frpc process died unexpectedly");
        inner.process = None;
        for rule in inner.rules.values_mut() {
            if rule.status == ProxyStatus::Running {
                rule.status = ProxyStatus::Error;
            }
        }
    }
}
