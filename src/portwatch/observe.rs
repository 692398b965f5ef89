//! Observed listening sockets, snapshots, and snapshot diffs.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::tunnel::rule::Protocol;

/// Display name recorded when socket ownership cannot be resolved.
pub const SYSTEM_PROCESS_NAME: &str = "system process";

/// Identity of an observed socket.
///
/// The pid is part of the key on purpose: the same port re-bound by a
/// different process is a distinct entity, so process churn shows up in the
/// diff instead of being masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationKey {
    /// Bound port number.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Owning process, if resolvable.
    pub pid: Option<u32>,
}

/// One listening socket seen at scan time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortObservation {
    /// Bound port number.
    pub port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Owning process id; absent for system-owned sockets.
    pub pid: Option<u32>,
    /// Owning process display name, or [`SYSTEM_PROCESS_NAME`].
    pub process_name: String,
    /// Address the socket is bound to.
    pub local_addr: std::net::IpAddr,
    /// Kernel socket state, e.g. `LISTEN` or `UNCONN`.
    pub status: String,
    /// When the observation was taken.
    pub observed_at: DateTime<Utc>,
}

impl PortObservation {
    /// Identity key of this observation.
    pub fn key(&self) -> ObservationKey {
        ObservationKey {
            port: self.port,
            protocol: self.protocol,
            pid: self.pid,
        }
    }

    /// Human-facing label, e.g. `nginx (80)`.
    pub fn display_name(&self) -> String {
        format!("{} ({})", self.process_name, self.port)
    }
}

/// All observations from one scan, keyed by identity.
///
/// Keys are unique by construction; a full generation is replaced on every
/// poll cycle.
pub type Snapshot = HashMap<ObservationKey, PortObservation>;

/// Delta between two consecutive snapshots.
///
/// The three sequences are disjoint and each is ordered by observation key.
#[derive(Debug, Clone, Default)]
pub struct PortDiff {
    /// Present now, absent before.
    pub added: Vec<PortObservation>,
    /// Present before, absent now.
    pub removed: Vec<PortObservation>,
    /// Present in both with a changed socket state.
    pub changed: Vec<PortObservation>,
}

impl PortDiff {
    /// Whether nothing changed between the two snapshots.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// Compute the added/removed/changed delta from `old` to `new`.
pub fn diff(old: &Snapshot, new: &Snapshot) -> PortDiff {
    let mut result = PortDiff::default();

    for (key, observation) in new {
        match old.get(key) {
            None => result.added.push(observation.clone()),
            Some(previous) if previous.status != observation.status => {
                result.changed.push(observation.clone())
            }
            Some(_) => {}
        }
    }

    for (key, observation) in old {
        if !new.contains_key(key) {
            result.removed.push(observation.clone());
        }
    }

    result.added.sort_by_key(PortObservation::key);
    result.removed.sort_by_key(PortObservation::key);
    result.changed.sort_by_key(PortObservation::key);
    result
}
