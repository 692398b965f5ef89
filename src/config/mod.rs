//! Application settings.
//!
//! One optional TOML file: `[server]` is the frp server connection (it becomes
//! the generated document's `[common]` section), `[app]` is local behavior.
//! Credential storage and first-run setup flows live outside this crate; this
//! layer only reads what is already on disk.

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{SettingsLoader, CONFIG_DIR, FRPC_CONFIG_FILE, SETTINGS_FILE};
pub use schema::{
    AppSettings, ServerSettings, Settings, DEFAULT_SCAN_INTERVAL_SECS, DEFAULT_SERVER_PORT,
    MAX_SCAN_INTERVAL_SECS, MIN_SCAN_INTERVAL_SECS,
};
