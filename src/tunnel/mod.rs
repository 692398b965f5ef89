//! Tunnel supervision: rule registry, config reconciliation, and lifecycle of
//! the external frpc process.
//!
//! The supervisor is the only owner of the process handle and the registry;
//! everything funnels through its lock so reconciles and bring-ups never
//! interleave. frpc output is forwarded line by line over a registered channel.

pub mod error;
pub mod locator;
pub mod process;
pub mod reconcile;
pub mod reload;
pub mod rule;
pub mod supervisor;

pub use error::{TunnelError, TunnelResult};
pub use locator::BinaryLocator;
pub use process::TunnelProcess;
pub use reconcile::ConfigReconciler;
pub use reload::{ReloadOutcome, ReloadStrategy, RestartReload, SignalReload};
pub use rule::{Protocol, ProxyRule, ProxyStatus};
pub use supervisor::TunnelSupervisor;
