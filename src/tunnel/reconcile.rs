//! Reconciling the rule registry into the frpc config document.
//!
//! The document has one reserved `[common]` section (server connection and
//! auth, owned by the settings layer) plus one generated section per rule.
//! Reconciliation rewrites only the generated sections: anything else in the
//! document passes through untouched, and the write is temp-then-rename so an
//! interrupted process never leaves a half-written document behind.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{TunnelError, TunnelResult};
use super::rule::ProxyRule;

/// Reserved section holding server connection and auth settings.
pub const CONNECTION_SECTION: &str = "common";

/// Top-level key prefixes that mark a section as generated.
pub const GENERATED_PREFIXES: [&str; 4] = ["tcp_", "udp_", "http_", "https_"];

/// Whether a top-level key names a generated proxy section.
pub fn is_generated_key(key: &str) -> bool {
    GENERATED_PREFIXES.iter().any(|p| key.starts_with(p))
}

/// Writes the frpc config document from registry state.
#[derive(Debug, Clone)]
pub struct ConfigReconciler {
    path: PathBuf,
}

impl ConfigReconciler {
    /// Reconciler for the document at `path`.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Path of the managed document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Regenerate the document from the given rules.
    ///
    /// Reads the existing document if present, replaces the connection section
    /// when one is supplied (otherwise whatever is on disk is kept), removes
    /// every generated section, emits one section per rule, and writes the
    /// result atomically. Reconciling twice with the same rules produces an
    /// identical document.
    ///
    /// A document without a connection section is still written; whether that
    /// is acceptable is decided at process start, not here.
    pub fn reconcile<'a>(
        &self,
        rules: impl IntoIterator<Item = &'a ProxyRule>,
        connection: Option<&toml::Table>,
    ) -> TunnelResult<()> {
        let mut doc = self.load_document()?;

        if let Some(conn) = connection {
            doc.insert(
                CONNECTION_SECTION.to_string(),
                toml::Value::Table(conn.clone()),
            );
        }

        doc.retain(|key, _| !is_generated_key(key));

        let mut count = 0usize;
        for rule in rules {
            doc.insert(rule.name.clone(), proxy_section(rule));
            count += 1;
        }

        let text = toml::to_string(&doc).map_err(|e| TunnelError::Io {
            path: self.path.clone(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        self.write_atomic(&text)?;
        debug!("reconciled {} proxy sections into {}", count, self.path.display());
        Ok(())
    }

    /// Whether the on-disk document carries a connection section.
    pub fn has_connection_section(&self) -> TunnelResult<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let doc = self.load_document()?;
        Ok(matches!(
            doc.get(CONNECTION_SECTION),
            Some(toml::Value::Table(_))
        ))
    }

    /// Parse the existing document, or start an empty one.
    fn load_document(&self) -> TunnelResult<toml::Table> {
        if !self.path.exists() {
            return Ok(toml::Table::new());
        }
        let text = std::fs::read_to_string(&self.path).map_err(|e| TunnelError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        text.parse::<toml::Table>()
            .map_err(|e| TunnelError::ConfigInvalid {
                diagnostic: format!("existing document is not valid TOML: {e}"),
            })
    }

    /// Write via a temp file in the same directory, then rename over the target.
    fn write_atomic(&self, text: &str) -> TunnelResult<()> {
        let io_err = |source| TunnelError::Io {
            path: self.path.clone(),
            source,
        };

        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(io_err)?;

        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(io_err)?;
        tmp.write_all(text.as_bytes()).map_err(io_err)?;
        tmp.persist(&self.path).map_err(|e| io_err(e.error))?;
        Ok(())
    }
}

/// Render one rule as its generated config section.
fn proxy_section(rule: &ProxyRule) -> toml::Value {
    let mut section = toml::Table::new();
    section.insert(
        "type".to_string(),
        toml::Value::String(rule.protocol.to_string()),
    );
    section.insert(
        "local_ip".to_string(),
        toml::Value::String(rule.local_ip.clone()),
    );
    section.insert(
        "local_port".to_string(),
        toml::Value::Integer(i64::from(rule.local_port)),
    );
    section.insert(
        "remote_port".to_string(),
        toml::Value::Integer(i64::from(rule.remote_port)),
    );
    toml::Value::Table(section)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::rule::Protocol;

    fn connection() -> toml::Table {
        let mut table = toml::Table::new();
        table.insert(
            "server_addr".to_string(),
            toml::Value::String("frp.example.net".to_string()),
        );
        table.insert("server_port".to_string(), toml::Value::Integer(7000));
        table
    }

    fn read_doc(path: &Path) -> toml::Table {
        std::fs::read_to_string(path).unwrap().parse().unwrap()
    }

    #[test]
    fn test_reconcile_writes_sections_per_rule() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = ConfigReconciler::new(dir.path().join("frpc.toml"));
        let rules = [
            ProxyRule::new(8080, None, Protocol::Tcp),
            ProxyRule::new(53, Some(5353), Protocol::Udp),
        ];

        reconciler.reconcile(&rules, Some(&connection())).unwrap();

        let doc = read_doc(reconciler.path());
        let common = doc["common"].as_table().unwrap();
        assert_eq!(common["server_addr"].as_str(), Some("frp.example.net"));

        let tcp = doc["tcp_8080_to_8080"].as_table().unwrap();
        assert_eq!(tcp["type"].as_str(), Some("tcp"));
        assert_eq!(tcp["local_ip"].as_str(), Some("127.0.0.1"));
        assert_eq!(tcp["local_port"].as_integer(), Some(8080));
        assert_eq!(tcp["remote_port"].as_integer(), Some(8080));

        let udp = doc["udp_53_to_5353"].as_table().unwrap();
        assert_eq!(udp["remote_port"].as_integer(), Some(5353));

        assert_eq!(doc.len(), 3);
    }

    #[test]
    fn test_reconcile_preserves_foreign_sections_and_strips_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frpc.toml");
        std::fs::write(
            &path,
            r#"
[common]
server_addr = "old.example.net"
server_port = 7000

[webhooks]
url = "https://hooks.example.net"

[tcp_9999_to_9999]
type = "tcp"
local_ip = "127.0.0.1"
local_port = 9999
remote_port = 9999
"#,
        )
        .unwrap();

        let reconciler = ConfigReconciler::new(path);
        let rules = [ProxyRule::new(8080, None, Protocol::Tcp)];
        reconciler.reconcile(&rules, None).unwrap();

        let doc = read_doc(reconciler.path());
        // Unowned sections pass through
        assert_eq!(
            doc["common"].as_table().unwrap()["server_addr"].as_str(),
            Some("old.example.net")
        );
        assert!(doc.contains_key("webhooks"));
        // Stale generated section is gone, current one is present
        assert!(!doc.contains_key("tcp_9999_to_9999"));
        assert!(doc.contains_key("tcp_8080_to_8080"));
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = ConfigReconciler::new(dir.path().join("frpc.toml"));
        let rules = [
            ProxyRule::new(8080, None, Protocol::Tcp),
            ProxyRule::new(2222, Some(22), Protocol::Tcp),
        ];

        reconciler.reconcile(&rules, Some(&connection())).unwrap();
        let first = std::fs::read(reconciler.path()).unwrap();

        reconciler.reconcile(&rules, Some(&connection())).unwrap();
        let second = std::fs::read(reconciler.path()).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_reconcile_without_connection_still_writes() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = ConfigReconciler::new(dir.path().join("sub").join("frpc.toml"));
        let rules = [ProxyRule::new(8080, None, Protocol::Tcp)];

        reconciler.reconcile(&rules, None).unwrap();

        assert!(reconciler.path().exists());
        assert!(!reconciler.has_connection_section().unwrap());
    }

    #[test]
    fn test_has_connection_section() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = ConfigReconciler::new(dir.path().join("frpc.toml"));
        assert!(!reconciler.has_connection_section().unwrap());

        let no_rules: [ProxyRule; 0] = [];
        reconciler.reconcile(&no_rules, Some(&connection())).unwrap();
        assert!(reconciler.has_connection_section().unwrap());
    }

    #[test]
    fn test_generated_key_prefixes() {
        assert!(is_generated_key("tcp_8080_to_8080"));
        assert!(is_generated_key("udp_53_to_53"));
        assert!(is_generated_key("http_x"));
        assert!(is_generated_key("https_x"));
        assert!(!is_generated_key("common"));
        assert!(!is_generated_key("webhooks"));
    }
}
