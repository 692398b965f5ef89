//! Command-line interface definitions for portmapper.
//!
//! Uses clap's derive API for type-safe argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::tunnel::rule::Protocol;

/// Local port forwarding manager driving an external frp tunnel client.
///
/// portmapper declares forwarding rules, keeps the frpc config document in
/// sync with them, supervises the frpc process, and watches which local ports
/// are actually listening.
#[derive(Parser, Debug)]
#[command(name = "portmapper")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to run (or omit for forwarding mode).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Forwarding rule to declare and start (repeatable).
    ///
    /// Format: LOCAL[:REMOTE][/PROTOCOL]. The remote port defaults to the
    /// local port and the protocol defaults to tcp, so `-L 8080`,
    /// `-L 3000:80`, and `-L 53:53/udp` are all valid.
    #[arg(short = 'L', long = "forward", value_name = "LOCAL[:REMOTE][/PROTO]")]
    pub forward: Vec<String>,

    /// Path to the settings file.
    ///
    /// Defaults to config.toml under the user config directory; a file named
    /// here must exist.
    #[arg(short = 'c', long = "config", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Explicit frpc executable, skipping the search when it exists.
    #[arg(long = "frpc-path", value_name = "PATH")]
    pub frpc_path: Option<PathBuf>,

    /// Port scan interval in seconds (clamped to 2..=300).
    #[arg(long = "scan-interval", value_name = "SECONDS")]
    pub scan_interval: Option<u64>,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Subcommands for portmapper.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Report whether frpc can be found and whether it runs correctly.
    Doctor,
}

/// A parsed `LOCAL[:REMOTE][/PROTOCOL]` rule specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardSpec {
    /// Local port to expose.
    pub local_port: u16,
    /// Remote port, if given explicitly.
    pub remote_port: Option<u16>,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl Cli {
    /// Parse a `LOCAL[:REMOTE][/PROTOCOL]` spec.
    ///
    /// Returns None for malformed specs and for port 0.
    pub fn parse_forward_spec(spec: &str) -> Option<ForwardSpec> {
        let (ports, protocol) = match spec.split_once('/') {
            Some((ports, proto)) => (ports, proto.parse().ok()?),
            None => (spec, Protocol::Tcp),
        };

        let (local, remote) = match ports.split_once(':') {
            Some((local, remote)) => (local, Some(remote)),
            None => (ports, None),
        };

        let local_port: u16 = local.parse().ok()?;
        if local_port == 0 {
            return None;
        }

        let remote_port = match remote {
            Some(text) => {
                let port: u16 = text.parse().ok()?;
                if port == 0 {
                    return None;
                }
                Some(port)
            }
            None => None,
        };

        Some(ForwardSpec {
            local_port,
            remote_port,
            protocol,
        })
    }
}
