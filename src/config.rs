use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ServerError};

pub fn default_true() -> bool {
    true
}

pub fn default_name() -> String {
    "switchyard".to_string()
}

pub fn default_listening_addresses() -> Vec<String> {
    vec!["127.0.0.1:8080".to_string()]
}

pub fn default_shutdown_grace_secs() -> u64 {
    5
}

pub fn default_free_port_search_limit() -> u16 {
    100
}

pub fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration for one server instance, usually loaded from TOML.
///
/// A listening address ending in `+` (for example `0.0.0.0:8080+`) asks the
/// listener set to search upwards for a free port when the requested one is
/// taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Serve plain HTTP on `listening_addresses`.
    #[serde(default = "default_true")]
    pub enable_plain: bool,
    #[serde(default = "default_listening_addresses")]
    pub listening_addresses: Vec<String>,

    /// Serve HTTPS on `listening_addresses_tls`.
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub listening_addresses_tls: Vec<String>,
    #[serde(default)]
    pub tls_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_path: Option<PathBuf>,

    /// Maintain the per-dimension client indices.
    #[serde(default = "default_true")]
    pub enable_indexing: bool,
    /// How long in-flight requests may drain after stop before being cut.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Ports tried above the requested one for `+` addresses.
    #[serde(default = "default_free_port_search_limit")]
    pub free_port_search_limit: u16,

    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// One of error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            description: String::new(),
            enabled: true,
            enable_plain: true,
            listening_addresses: default_listening_addresses(),
            enable_tls: false,
            listening_addresses_tls: Vec::new(),
            tls_cert_path: None,
            tls_key_path: None,
            enable_indexing: true,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            free_port_search_limit: default_free_port_search_limit(),
            logging: LoggingSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Load and validate configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Self::read_file(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config = Self::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file without validating, for callers that still apply
    /// overrides before constructing a server.
    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ServerError::Config(format!("failed to read config file {}: {e}", path.display()))
        })?;
        Self::parse_toml(&content)
    }

    pub fn parse_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| ServerError::Config(format!("failed to parse config: {e}")))
    }

    /// Command-line overrides. A non-empty address list replaces the
    /// configured one and enables its transport.
    pub fn apply_overrides(&mut self, listen: &[String], listen_tls: &[String], name: Option<&str>) {
        if !listen.is_empty() {
            self.enable_plain = true;
            self.listening_addresses = listen.to_vec();
        }
        if !listen_tls.is_empty() {
            self.enable_tls = true;
            self.listening_addresses_tls = listen_tls.to_vec();
        }
        if let Some(name) = name {
            self.name = name.to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Err(ServerError::Disabled(self.name.clone()));
        }

        if self.enable_plain && !has_address(&self.listening_addresses) {
            return Err(ServerError::Config(
                "plain listening is enabled but no listening addresses are provided".into(),
            ));
        }

        if self.enable_tls {
            if !has_address(&self.listening_addresses_tls) {
                return Err(ServerError::Config(
                    "tls listening is enabled but no tls listening addresses are provided".into(),
                ));
            }
            if self.tls_cert_path.is_none() || self.tls_key_path.is_none() {
                return Err(ServerError::Config(
                    "tls listening requires both tls_cert_path and tls_key_path".into(),
                ));
            }
        }

        if self.free_port_search_limit == 0 {
            return Err(ServerError::Config("free_port_search_limit cannot be 0".into()));
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ServerError::Config(format!(
                "invalid log level '{}', must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

fn has_address(addresses: &[String]) -> bool {
    addresses.iter().any(|a| !a.trim().is_empty())
}
