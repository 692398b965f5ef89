//! Host port watching: periodic snapshots of listening sockets with owning
//! processes, diffed against the previous generation.
//!
//! Runs independently of the tunnel subsystem. Consumers receive
//! [`PortDiff`] events over a channel and use them to suggest candidate
//! forwarding rules; correlating diffs with rules is their business, not ours.

pub mod error;
pub mod observe;
pub mod scan;
pub mod tracker;

pub use error::{ScanError, ScanResult};
pub use observe::{diff, ObservationKey, PortDiff, PortObservation, Snapshot, SYSTEM_PROCESS_NAME};
pub use scan::PortScanner;
pub use tracker::PortTracker;
