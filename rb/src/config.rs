//! resbroker configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::manager::messages::Capabilities;
use crate::manager::{self, Destination};

/// Environment override for the manager socket path
pub const SOCKET_ENV: &str = "RESBROKER_SOCKET";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when the CLI flag is absent
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Resource-manager endpoint
    pub manager: ManagerConfig,

    /// Session registration parameters
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()))
                .map(Self::apply_env);
        }

        // Try project-local config: .resbroker.yml
        let local_config = PathBuf::from(".resbroker.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config.apply_env()),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/resbroker/resbroker.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("resbroker").join("resbroker.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config.apply_env()),
                    Err(e) => {
                        tracing::warn!(
                            "Failed to load config from {}: {}",
                            user_config.display(),
                            e
                        );
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default().apply_env())
    }

    /// Peek at the configured log level before logging is initialized
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    fn apply_env(mut self) -> Self {
        if let Ok(socket) = std::env::var(SOCKET_ENV) {
            self.manager.socket = PathBuf::from(socket);
        }
        self
    }
}

/// Resource-manager endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Unix socket the manager listens on (env: RESBROKER_SOCKET)
    pub socket: PathBuf,

    /// Bus destination service name
    pub service: String,

    /// Bus destination object path
    #[serde(rename = "object-path")]
    pub object_path: String,

    /// Bus destination interface
    pub interface: String,

    /// Timeout for each blocking protocol step in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            socket: manager::default_socket_path(),
            service: manager::DEFAULT_SERVICE.to_string(),
            object_path: manager::DEFAULT_OBJECT_PATH.to_string(),
            interface: manager::DEFAULT_INTERFACE.to_string(),
            timeout_ms: 5000,
        }
    }
}

impl ManagerConfig {
    pub fn destination(&self) -> Destination {
        Destination {
            service: self.service.clone(),
            object_path: self.object_path.clone(),
            interface: self.interface.clone(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Session registration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Application class reported at registration
    pub class: String,

    /// Capability names to request
    pub capabilities: Vec<String>,

    /// Registration mode bits
    pub mode: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            class: "player".to_string(),
            capabilities: vec!["video-playback".to_string()],
            mode: 0,
        }
    }
}

impl SessionConfig {
    /// Resolve the configured capability names into the wire bit-set
    ///
    /// A session requests exactly the set it intends to hold, so an empty or
    /// unknown selection is an error, not a default.
    pub fn capability_set(&self) -> Result<Capabilities> {
        let mut caps = Capabilities::empty();
        for name in &self.capabilities {
            caps |= Capabilities::from_name(name)
                .ok_or_else(|| eyre::eyre!("unknown capability '{}'", name))?;
        }
        if caps.is_empty() {
            return Err(eyre::eyre!("at least one capability must be requested"));
        }
        Ok(caps)
    }
}
