//! Periodic port polling and diff publishing.
//!
//! The tracker scans on a fixed interval, swaps the new snapshot in under its
//! own lock (never held together with any tunnel lock; the subsystems are
//! deliberately decoupled), and sends the diff over the event channel only
//! when something actually changed. A failed scan is logged and retried on
//! the next tick.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::observe::{self, PortDiff, PortObservation, Snapshot};
use super::scan::PortScanner;

/// Polls the host's listening sockets and publishes diffs.
///
/// Clones share the same snapshot state, so one clone can run the scan loop
/// while others use the read accessors.
#[derive(Clone)]
pub struct PortTracker {
    state: Arc<Mutex<TrackerState>>,
    interval: Duration,
}

/// Only the current and the immediately previous generation are kept.
#[derive(Default)]
struct TrackerState {
    current: Snapshot,
    previous: Snapshot,
}

impl PortTracker {
    /// Tracker scanning every `interval`.
    ///
    /// Callers are expected to clamp the interval to something sane before
    /// handing it over (the settings layer enforces 2..=300 seconds).
    pub fn new(interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            interval,
        }
    }

    /// Run the scan loop until shutdown is signalled or the receiver is gone.
    ///
    /// Diffs are sent over `diff_tx` only when non-empty, so a quiescent host
    /// produces no events at all.
    pub async fn run(&self, diff_tx: mpsc::Sender<PortDiff>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut scanner = PortScanner::new();
        let mut ticker = tokio::time::interval(self.interval);
        debug!("port tracker started, interval {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match scanner.scan() {
                        Ok(snapshot) => {
                            let diff = self.ingest(snapshot);
                            if diff.is_empty() {
                                trace!("scan produced no changes");
                            } else if diff_tx.send(diff).await.is_err() {
                                debug!("diff receiver dropped, stopping port tracker");
                                return;
                            }
                        }
                        // Keep polling; the next tick retries unconditionally.
                        Err(e) => warn!("port scan failed: {e}"),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("port tracker received shutdown");
                        return;
                    }
                }
            }
        }
    }

    /// Swap in a new generation and return the diff against the old one.
    fn ingest(&self, snapshot: Snapshot) -> PortDiff {
        let mut state = self.locked();
        let diff = observe::diff(&state.current, &snapshot);
        state.previous = std::mem::replace(&mut state.current, snapshot);
        diff
    }

    /// All observations in the current generation, ordered by key.
    pub fn listening_ports(&self) -> Vec<PortObservation> {
        let state = self.locked();
        let mut observations: Vec<_> = state.current.values().cloned().collect();
        observations.sort_by_key(PortObservation::key);
        observations
    }

    /// Observations for one port number (several processes can share a port
    /// across protocols and address families).
    pub fn observations_on(&self, port: u16) -> Vec<PortObservation> {
        let state = self.locked();
        let mut observations: Vec<_> = state
            .current
            .values()
            .filter(|o| o.port == port)
            .cloned()
            .collect();
        observations.sort_by_key(PortObservation::key);
        observations
    }

    /// Whether anything in the current generation listens on `port`.
    pub fn is_listening(&self, port: u16) -> bool {
        self.locked().current.values().any(|o| o.port == port)
    }

    fn locked(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portwatch::observe::SYSTEM_PROCESS_NAME;
    use crate::tunnel::rule::Protocol;
    use chrono::Utc;
    use std::net::{IpAddr, Ipv4Addr};

    fn observation(port: u16, pid: u32, status: &str) -> PortObservation {
        PortObservation {
            port,
            protocol: Protocol::Tcp,
            pid: Some(pid),
            process_name: SYSTEM_PROCESS_NAME.to_string(),
            local_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            status: status.to_string(),
            observed_at: Utc::now(),
        }
    }

    fn snapshot(observations: &[PortObservation]) -> Snapshot {
        observations.iter().map(|o| (o.key(), o.clone())).collect()
    }

    #[test]
    fn test_first_ingest_reports_everything_added() {
        let tracker = PortTracker::new(Duration::from_secs(2));
        let diff = tracker.ingest(snapshot(&[observation(80, 1, "LISTEN")]));
        assert_eq!(diff.added.len(), 1);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_identical_generation_is_quiet() {
        let tracker = PortTracker::new(Duration::from_secs(2));
        let generation = [observation(80, 1, "LISTEN"), observation(22, 2, "LISTEN")];
        tracker.ingest(snapshot(&generation));
        let diff = tracker.ingest(snapshot(&generation));
        assert!(diff.is_empty());
    }

    #[test]
    fn test_status_change_between_generations() {
        let tracker = PortTracker::new(Duration::from_secs(2));
        tracker.ingest(snapshot(&[observation(80, 1, "LISTEN")]));
        let diff = tracker.ingest(snapshot(&[observation(80, 1, "CLOSE_WAIT")]));
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.added.is_empty() && diff.removed.is_empty());
    }

    #[test]
    fn test_accessors_see_current_generation() {
        let tracker = PortTracker::new(Duration::from_secs(2));
        tracker.ingest(snapshot(&[
            observation(80, 1, "LISTEN"),
            observation(8080, 2, "LISTEN"),
        ]));

        assert!(tracker.is_listening(80));
        assert!(!tracker.is_listening(443));
        assert_eq!(tracker.listening_ports().len(), 2);
        assert_eq!(tracker.observations_on(8080).len(), 1);

        // Replacing the generation drops old entries from the accessors.
        tracker.ingest(snapshot(&[observation(443, 3, "LISTEN")]));
        assert!(!tracker.is_listening(80));
        assert!(tracker.is_listening(443));
    }

    #[test]
    fn test_accessors_return_copies() {
        let tracker = PortTracker::new(Duration::from_secs(2));
        tracker.ingest(snapshot(&[observation(80, 1, "LISTEN")]));

        let mut copy = tracker.listening_ports();
        copy.clear();
        assert!(tracker.is_listening(80));
    }

    #[tokio::test]
    async fn test_shutdown_stops_the_loop() {
        let tracker = PortTracker::new(Duration::from_secs(60));
        let (diff_tx, _diff_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.run(diff_tx, shutdown_rx).await })
        };

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("tracker did not shut down")
            .unwrap();
    }
}
