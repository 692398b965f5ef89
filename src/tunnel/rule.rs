//! Forwarding rule data model.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// Loopback address rules bind to by default.
pub const DEFAULT_LOCAL_IP: &str = "127.0.0.1";

/// Transport protocol of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// TCP forwarding.
    Tcp,
    /// UDP forwarding.
    Udp,
}

impl Protocol {
    /// Lowercase wire name, as used in config sections and rule names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Lifecycle state of a forwarding rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStatus {
    /// Not being served by the tunnel process.
    Stopped,
    /// Bring-up in progress.
    Starting,
    /// Served by the running tunnel process.
    Running,
    /// Tear-down in progress.
    Stopping,
    /// The rule was Running but its tunnel process was found dead.
    Error,
}

impl fmt::Display for ProxyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProxyStatus::Stopped => "stopped",
            ProxyStatus::Starting => "starting",
            ProxyStatus::Running => "running",
            ProxyStatus::Stopping => "stopping",
            ProxyStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// A declared local-to-remote forwarding rule.
///
/// Owned by the supervisor's registry; the name is derived from protocol and
/// ports so two rules can never silently collide.
#[derive(Debug, Clone)]
pub struct ProxyRule {
    /// Unique derived name, e.g. `tcp_8080_to_8080`.
    pub name: String,
    /// Port to expose from this host.
    pub local_port: u16,
    /// Port the frp server binds on the remote side.
    pub remote_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
    /// Address frpc connects to locally.
    pub local_ip: String,
    /// Current lifecycle state.
    pub status: ProxyStatus,
    /// When the rule was declared.
    pub created_at: DateTime<Utc>,
}

impl ProxyRule {
    /// Create a rule. The remote port defaults to the local port.
    pub fn new(local_port: u16, remote_port: Option<u16>, protocol: Protocol) -> Self {
        let remote_port = remote_port.unwrap_or(local_port);
        Self {
            name: derive_name(protocol, local_port, remote_port),
            local_port,
            remote_port,
            protocol,
            local_ip: DEFAULT_LOCAL_IP.to_string(),
            status: ProxyStatus::Stopped,
            created_at: Utc::now(),
        }
    }

    /// Whether the rule is currently being served.
    pub fn is_active(&self) -> bool {
        self.status == ProxyStatus::Running
    }
}

/// Derive the unique rule name for a protocol and port pair.
pub fn derive_name(protocol: Protocol, local_port: u16, remote_port: u16) -> String {
    format!("{protocol}_{local_port}_to_{remote_port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_derivation() {
        assert_eq!(derive_name(Protocol::Tcp, 8081, 8081), "tcp_8081_to_8081");
        assert_eq!(derive_name(Protocol::Udp, 53, 5353), "udp_53_to_5353");
    }

    #[test]
    fn test_remote_port_defaults_to_local() {
        let rule = ProxyRule::new(8081, None, Protocol::Tcp);
        assert_eq!(rule.remote_port, 8081);
        assert_eq!(rule.name, "tcp_8081_to_8081");
        assert_eq!(rule.status, ProxyStatus::Stopped);
        assert_eq!(rule.local_ip, DEFAULT_LOCAL_IP);
    }

    #[test]
    fn test_explicit_remote_port() {
        let rule = ProxyRule::new(3000, Some(8080), Protocol::Tcp);
        assert_eq!(rule.remote_port, 8080);
        assert_eq!(rule.name, "tcp_3000_to_8080");
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("http".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_new_rule_is_not_active() {
        let rule = ProxyRule::new(8080, None, Protocol::Tcp);
        assert!(!rule.is_active());
    }
}
