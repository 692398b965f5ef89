//! Settings schema.
//!
//! Two sections: `[server]` describes the frp server connection and becomes
//! the `[common]` section of the generated frpc document; `[app]` holds local
//! behavior knobs.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Default frp server control port.
pub const DEFAULT_SERVER_PORT: u16 = 7000;

/// Default port scan interval in seconds.
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 30;

/// Lower bound on the scan interval.
pub const MIN_SCAN_INTERVAL_SECS: u64 = 2;

/// Upper bound on the scan interval.
pub const MAX_SCAN_INTERVAL_SECS: u64 = 300;

/// Root of the settings file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// frp server connection settings.
    #[serde(default)]
    pub server: ServerSettings,
    /// Local application behavior.
    #[serde(default)]
    pub app: AppSettings,
}

/// Connection settings for the frp server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    /// Server hostname or address. Empty means not configured yet.
    #[serde(default)]
    pub server_addr: String,
    /// Server control port.
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Shared auth token, if the server requires one.
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            server_addr: String::new(),
            server_port: DEFAULT_SERVER_PORT,
            token: None,
        }
    }
}

impl ServerSettings {
    /// Whether enough is configured to build a usable `[common]` section.
    pub fn is_complete(&self) -> bool {
        !self.server_addr.is_empty() && self.server_port != 0
    }

    /// Render as the `[common]` section handed to the reconciler.
    pub fn connection_section(&self) -> toml::Table {
        let mut section = toml::Table::new();
        section.insert(
            "server_addr".to_string(),
            toml::Value::String(self.server_addr.clone()),
        );
        section.insert(
            "server_port".to_string(),
            toml::Value::Integer(i64::from(self.server_port)),
        );
        if let Some(token) = &self.token {
            section.insert("token".to_string(), toml::Value::String(token.clone()));
        }
        section
    }
}

/// Local application behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct AppSettings {
    /// Port scan interval in seconds; clamped to 2..=300 when used.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: u64,
    /// Explicit frpc path, skipping the search when it exists.
    #[serde(default)]
    pub frpc_path: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            scan_interval: DEFAULT_SCAN_INTERVAL_SECS,
            frpc_path: None,
        }
    }
}

impl AppSettings {
    /// The scan interval clamped to its allowed range.
    pub fn effective_scan_interval(&self) -> Duration {
        Duration::from_secs(
            self.scan_interval
                .clamp(MIN_SCAN_INTERVAL_SECS, MAX_SCAN_INTERVAL_SECS),
        )
    }
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_scan_interval() -> u64 {
    DEFAULT_SCAN_INTERVAL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.server_port, 7000);
        assert!(!settings.server.is_complete());
        assert_eq!(settings.app.scan_interval, 30);
    }

    #[test]
    fn test_server_completeness() {
        let mut server = ServerSettings::default();
        assert!(!server.is_complete());
        server.server_addr = "frp.example.net".to_string();
        assert!(server.is_complete());
    }

    #[test]
    fn test_connection_section_includes_token_only_when_set() {
        let mut server = ServerSettings {
            server_addr: "frp.example.net".to_string(),
            ..Default::default()
        };

        let section = server.connection_section();
        assert_eq!(section["server_addr"].as_str(), Some("frp.example.net"));
        assert_eq!(section["server_port"].as_integer(), Some(7000));
        assert!(!section.contains_key("token"));

        server.token = Some("secret".to_string());
        assert_eq!(
            server.connection_section()["token"].as_str(),
            Some("secret")
        );
    }

    #[test]
    fn test_scan_interval_clamping() {
        let mut app = AppSettings::default();
        assert_eq!(app.effective_scan_interval(), Duration::from_secs(30));

        app.scan_interval = 0;
        assert_eq!(app.effective_scan_interval(), Duration::from_secs(2));

        app.scan_interval = 100_000;
        assert_eq!(app.effective_scan_interval(), Duration::from_secs(300));
    }

    #[test]
    fn test_parse_full_file() {
        let settings: Settings = toml::from_str(
            r#"
[server]
server_addr = "frp.example.net"
server_port = 7100
token = "secret"

[app]
scan_interval = 10
frpc_path = "/opt/frp/frpc"
"#,
        )
        .unwrap();

        assert_eq!(settings.server.server_port, 7100);
        assert_eq!(settings.app.scan_interval, 10);
        assert_eq!(
            settings.app.frpc_path,
            Some(PathBuf::from("/opt/frp/frpc"))
        );
    }

    #[test]
    fn test_parse_partial_file_fills_defaults() {
        let settings: Settings = toml::from_str(
            r#"
[server]
server_addr = "frp.example.net"
"#,
        )
        .unwrap();

        assert_eq!(settings.server.server_port, 7000);
        assert_eq!(settings.app.scan_interval, 30);
        assert!(settings.app.frpc_path.is_none());
    }
}
