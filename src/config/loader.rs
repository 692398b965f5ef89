//! Settings loading.
//!
//! Settings live in one optional TOML file. A missing file is not an error
//! (defaults apply); unreadable or invalid TOML fails fast with a clear
//! message, and an explicitly requested file must exist.

use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::ConfigError;
use super::schema::Settings;

/// Configuration directory name under the user config root.
pub const CONFIG_DIR: &str = "portmapper";

/// Settings filename.
pub const SETTINGS_FILE: &str = "config.toml";

/// Generated frpc document filename.
pub const FRPC_CONFIG_FILE: &str = "frpc.toml";

/// Resolves settings paths and loads the settings file.
pub struct SettingsLoader {
    config_dir: PathBuf,
}

impl SettingsLoader {
    /// Loader rooted at the user's config directory.
    #[must_use]
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .map(|p| p.join(CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(CONFIG_DIR));
        Self { config_dir }
    }

    /// Loader rooted at a custom directory (for testing).
    #[must_use]
    pub fn with_config_dir(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    /// Where the generated frpc document lives.
    pub fn frpc_config_path(&self) -> PathBuf {
        self.config_dir.join(FRPC_CONFIG_FILE)
    }

    /// Load settings from `explicit` if given, else from the default path.
    ///
    /// A missing default file yields defaults; a missing explicit file is an
    /// error, since the user asked for it by name.
    pub fn load(&self, explicit: Option<&Path>) -> Result<Settings, ConfigError> {
        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => (self.config_dir.join(SETTINGS_FILE), false),
        };

        if !path.exists() {
            if required {
                return Err(ConfigError::Read {
                    path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "settings file not found",
                    ),
                });
            }
            debug!("no settings file at {}, using defaults", path.display());
            return Ok(Settings::default());
        }

        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
            path: path.clone(),
            source: e,
        })?;
        let settings = toml::from_str(&text).map_err(|e| ConfigError::Parse {
            path: path.clone(),
            source: e,
        })?;
        debug!("loaded settings from {}", path.display());
        Ok(settings)
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}
