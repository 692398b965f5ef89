//! One full scan of the host's listening sockets.
//!
//! Listening sockets come from `/proc/net/tcp`, `/proc/net/tcp6`,
//! `/proc/net/udp`, and `/proc/net/udp6`. Addresses there are hex-encoded in
//! host byte order, so decoding has to swap; port numbers are hex in network
//! order. Ownership is resolved by walking `/proc/<pid>/fd` for `socket:[N]`
//! links and then asking the process table for the pid's name. Every part of
//! ownership resolution is best effort: a vanished process or denied access
//! becomes the "system process" sentinel, never an error.
//!
//! IPv6 matters here: plenty of dev servers bind only `::`, and scanning just
//! the IPv4 tables would miss them entirely.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use chrono::Utc;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::trace;

use super::error::{ScanError, ScanResult};
use super::observe::{PortObservation, Snapshot, SYSTEM_PROCESS_NAME};
use crate::tunnel::rule::Protocol;

/// TCP socket state value for LISTEN in /proc/net/tcp.
const TCP_LISTEN: u8 = 0x0A;

/// Socket state value for an unconnected (bound) UDP socket.
const UDP_UNCONNECTED: u8 = 0x07;

/// Scans the host's socket tables and resolves owning processes.
pub struct PortScanner {
    sys: System,
}

impl PortScanner {
    /// Create a scanner with an empty process table cache.
    pub fn new() -> Self {
        Self { sys: System::new() }
    }

    /// Take one full snapshot of listening sockets.
    pub fn scan(&mut self) -> ScanResult<Snapshot> {
        let tables: [(&str, Protocol, bool); 4] = [
            ("/proc/net/tcp", Protocol::Tcp, false),
            ("/proc/net/tcp6", Protocol::Tcp, true),
            ("/proc/net/udp", Protocol::Udp, false),
            ("/proc/net/udp6", Protocol::Udp, true),
        ];

        let mut sockets = Vec::new();
        for (path, protocol, is_ipv6) in tables {
            let path = Path::new(path);
            if !path.exists() {
                // IPv6 may be disabled on this host.
                continue;
            }
            let content = std::fs::read_to_string(path).map_err(|e| ScanError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;
            sockets.extend(parse_socket_table(&content, protocol, is_ipv6)?);
        }

        let inode_owners = map_socket_inodes();
        self.sys.refresh_processes(ProcessesToUpdate::All, true);

        let now = Utc::now();
        let mut snapshot = Snapshot::new();
        for socket in sockets {
            let pid = inode_owners.get(&socket.inode).copied();
            let process_name = pid
                .and_then(|pid| self.sys.process(Pid::from_u32(pid)))
                .map(|p| p.name().to_string_lossy().into_owned())
                .unwrap_or_else(|| SYSTEM_PROCESS_NAME.to_string());

            let observation = PortObservation {
                port: socket.port,
                protocol: socket.protocol,
                pid,
                process_name,
                local_addr: socket.addr,
                status: socket.status,
                observed_at: now,
            };
            snapshot.insert(observation.key(), observation);
        }

        trace!("scan found {} listening sockets", snapshot.len());
        Ok(snapshot)
    }
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new()
    }
}

/// A listening socket parsed out of one /proc table.
#[derive(Debug)]
struct RawSocket {
    addr: IpAddr,
    port: u16,
    protocol: Protocol,
    status: String,
    inode: u64,
}

/// Parse one /proc/net socket table, keeping only listening entries.
///
/// Line layout after the header:
/// ```text
///   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 ...
/// ```
fn parse_socket_table(
    content: &str,
    protocol: Protocol,
    is_ipv6: bool,
) -> ScanResult<Vec<RawSocket>> {
    let mut sockets = Vec::new();

    for line in content.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 10 {
            continue;
        }

        let state = u8::from_str_radix(fields[3], 16)
            .map_err(|_| ScanError::Parse(format!("bad socket state: {}", fields[3])))?;
        let listening = match protocol {
            Protocol::Tcp => state == TCP_LISTEN,
            Protocol::Udp => state == UDP_UNCONNECTED,
        };
        if !listening {
            continue;
        }

        let (addr, port) = if is_ipv6 {
            parse_ipv6_hex(fields[1])?
        } else {
            parse_ipv4_hex(fields[1])?
        };

        let inode: u64 = fields[9]
            .parse()
            .map_err(|_| ScanError::Parse(format!("bad socket inode: {}", fields[9])))?;

        sockets.push(RawSocket {
            addr,
            port,
            protocol,
            status: socket_state_name(protocol, state).to_string(),
            inode,
        });
    }

    Ok(sockets)
}

/// Kernel socket state as the name netstat prints.
fn socket_state_name(protocol: Protocol, state: u8) -> &'static str {
    if protocol == Protocol::Udp {
        return "UNCONN";
    }
    match state {
        0x01 => "ESTABLISHED",
        0x02 => "SYN_SENT",
        0x03 => "SYN_RECV",
        0x04 => "FIN_WAIT1",
        0x05 => "FIN_WAIT2",
        0x06 => "TIME_WAIT",
        0x07 => "CLOSE",
        0x08 => "CLOSE_WAIT",
        0x09 => "LAST_ACK",
        0x0A => "LISTEN",
        0x0B => "CLOSING",
        _ => "UNKNOWN",
    }
}

/// Decode a hex `ADDR:PORT` pair from an IPv4 table.
///
/// The address is the in-memory dump of a host-order u32, so `0100007F:1F90`
/// is 127.0.0.1:8080.
fn parse_ipv4_hex(field: &str) -> ScanResult<(IpAddr, u16)> {
    let (addr_hex, port_hex) = field
        .split_once(':')
        .ok_or_else(|| ScanError::Parse(format!("bad address field: {field}")))?;

    let raw = u32::from_str_radix(addr_hex, 16)
        .map_err(|_| ScanError::Parse(format!("bad IPv4 address: {addr_hex}")))?;
    let addr = Ipv4Addr::from(raw.swap_bytes());

    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|_| ScanError::Parse(format!("bad port: {port_hex}")))?;

    Ok((IpAddr::V4(addr), port))
}

/// Decode a hex `ADDR:PORT` pair from an IPv6 table.
///
/// The 128-bit address is dumped as four host-order 32-bit words.
fn parse_ipv6_hex(field: &str) -> ScanResult<(IpAddr, u16)> {
    let (addr_hex, port_hex) = field
        .split_once(':')
        .ok_or_else(|| ScanError::Parse(format!("bad address field: {field}")))?;

    if addr_hex.len() != 32 {
        return Err(ScanError::Parse(format!(
            "IPv6 address has {} hex chars, expected 32",
            addr_hex.len()
        )));
    }

    let mut octets = [0u8; 16];
    for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
        let word = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16)
            .map_err(|_| ScanError::Parse(format!("bad IPv6 word in {addr_hex}")))?;
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    let addr = Ipv6Addr::from(octets);

    let port = u16::from_str_radix(port_hex, 16)
        .map_err(|_| ScanError::Parse(format!("bad port: {port_hex}")))?;

    Ok((IpAddr::V6(addr), port))
}

/// Map socket inodes to owning pids by walking `/proc/<pid>/fd`.
///
/// Entirely best effort: processes we cannot inspect (exited, other users)
/// are skipped, and their sockets end up attributed to the system sentinel.
fn map_socket_inodes() -> HashMap<u64, u32> {
    let mut owners = HashMap::new();

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return owners;
    };
    for entry in entries.flatten() {
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
            continue;
        };
        let fd_dir = PathBuf::from("/proc").join(pid.to_string()).join("fd");
        let Ok(fds) = std::fs::read_dir(fd_dir) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            if let Some(inode) = parse_socket_link(&target.to_string_lossy()) {
                owners.entry(inode).or_insert(pid);
            }
        }
    }

    owners
}

/// Extract the inode from a `socket:[12345]` fd link target.
fn parse_socket_link(target: &str) -> Option<u64> {
    target
        .strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_hex() {
        let (addr, port) = parse_ipv4_hex("0100007F:1F90").unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(port, 8080);

        let (addr, port) = parse_ipv4_hex("00000000:0016").unwrap();
        assert_eq!(addr, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(port, 22);
    }

    #[test]
    fn test_parse_ipv4_hex_rejects_garbage() {
        assert!(parse_ipv4_hex("0100007F").is_err());
        assert!(parse_ipv4_hex("XYZ0007F:1F90").is_err());
        assert!(parse_ipv4_hex("0100007F:XYZW").is_err());
    }

    #[test]
    fn test_parse_ipv6_hex() {
        let (addr, port) =
            parse_ipv6_hex("00000000000000000000000000000000:0BB8").unwrap();
        assert_eq!(addr, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert_eq!(port, 3000);

        let (addr, port) =
            parse_ipv6_hex("00000000000000000000000001000000:0050").unwrap();
        assert_eq!(addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(port, 80);
    }

    #[test]
    fn test_parse_ipv6_hex_rejects_short_address() {
        assert!(parse_ipv6_hex("0000:0050").is_err());
    }

    #[test]
    fn test_parse_tcp_table_keeps_only_listeners() {
        let content = "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n\
             0: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 4001 1 0000000000000000 100 0 0 10 0\n\
             1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 4002 1 0000000000000000 100 0 0 10 0\n\
             2: 0100007F:1F90 0100007F:9999 01 00000000:00000000 00:00000000 00000000  1000        0 4003 1 0000000000000000 100 0 0 10 0\n";

        let sockets = parse_socket_table(content, Protocol::Tcp, false).unwrap();
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[0].port, 80);
        assert_eq!(sockets[0].inode, 4001);
        assert_eq!(sockets[0].status, "LISTEN");
        assert_eq!(sockets[1].port, 8080);
        assert_eq!(sockets[1].addr, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
    }

    #[test]
    fn test_parse_udp_table() {
        let content = "   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops\n\
            100: 0100007F:0035 00000000:0000 07 00000000:00000000 00:00000000 00000000   102        0 5001 2 0000000000000000 0\n\
            101: 0100007F:D2E4 0100007F:0035 01 00000000:00000000 00:00000000 00000000  1000        0 5002 2 0000000000000000 0\n";

        let sockets = parse_socket_table(content, Protocol::Udp, false).unwrap();
        assert_eq!(sockets.len(), 1);
        assert_eq!(sockets[0].port, 53);
        assert_eq!(sockets[0].status, "UNCONN");
    }

    #[test]
    fn test_parse_socket_link() {
        assert_eq!(parse_socket_link("socket:[12345]"), Some(12345));
        assert_eq!(parse_socket_link("pipe:[99]"), None);
        assert_eq!(parse_socket_link("/dev/null"), None);
        assert_eq!(parse_socket_link("socket:[abc]"), None);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(socket_state_name(Protocol::Tcp, 0x0A), "LISTEN");
        assert_eq!(socket_state_name(Protocol::Tcp, 0x08), "CLOSE_WAIT");
        assert_eq!(socket_state_name(Protocol::Udp, 0x07), "UNCONN");
    }

    #[test]
    fn test_scan_on_this_host() {
        // Smoke test against the real /proc; only sanity-checks invariants.
        let mut scanner = PortScanner::new();
        let snapshot = scanner.scan().unwrap();
        for (key, observation) in &snapshot {
            assert_eq!(*key, observation.key());
            assert!(!observation.process_name.is_empty());
        }
    }
}
