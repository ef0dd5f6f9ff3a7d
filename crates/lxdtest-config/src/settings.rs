//! lxdtest configuration
//!
//! Located at `~/.config/lxdtest/lxdtest.toml` unless a path is given
//! explicitly. A missing file yields the defaults.

use crate::{ConfigError, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level lxdtest configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub transport: TransportConfig,
}

/// Options for the container lifecycle driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// User whose authorized_keys receives the public key
    pub username: String,
    /// Path to the private key used for container access
    pub ssh_key: Option<String>,
    /// Remote name passed to every `lxc` target (`remote:name`)
    pub remote: String,
    /// Binary used for hypervisor calls
    pub lxc_binary: String,
    /// Launch containers as ephemeral
    pub ephemeral: bool,
    /// Profiles applied at launch
    pub profiles: Vec<String>,
    /// `--config key=value` overrides applied at launch
    pub config: BTreeMap<String, String>,
    /// Status re-checks after the immediate one while waiting for a container
    pub wait_retries: u32,
    /// Seconds between status checks while waiting for a container
    pub wait_interval_secs: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            username: "ubuntu".to_string(),
            ssh_key: None,
            remote: "local".to_string(),
            lxc_binary: "lxc".to_string(),
            ephemeral: false,
            profiles: Vec::new(),
            config: BTreeMap::new(),
            wait_retries: 10,
            wait_interval_secs: 6,
        }
    }
}

impl DriverConfig {
    /// Private key path with `~` and environment variables expanded
    pub fn ssh_key_path(&self) -> Option<PathBuf> {
        self.ssh_key.as_deref().map(expand_path)
    }

    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }
}

/// Which session the transport uses to reach the hypervisor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    /// Shell out to the `lxc` binary
    #[default]
    Cli,
    /// Talk to the LXD REST API at `api_endpoint`
    Api,
}

impl std::fmt::Display for SessionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "cli"),
            Self::Api => write!(f, "api"),
        }
    }
}

/// Options for the remote execution transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub api_endpoint: String,
    pub verify_ssl: bool,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
    pub session: SessionKind,
    /// Status checks allowed before readiness gives up
    pub ready_iterations: u32,
    pub ready_interval_secs: u64,
    /// Retries granted to `execute_with_retry` callers that don't choose their own
    pub max_retries: u32,
    pub retry_wait_secs: u64,
    pub retryable_exit_codes: Vec<i32>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "https://localhost:8443".to_string(),
            verify_ssl: false,
            client_cert: None,
            client_key: None,
            session: SessionKind::Cli,
            ready_iterations: 10,
            ready_interval_secs: 3,
            max_retries: 1,
            retry_wait_secs: 30,
            retryable_exit_codes: Vec::new(),
        }
    }
}

impl TransportConfig {
    pub fn ready_interval(&self) -> Duration {
        Duration::from_secs(self.ready_interval_secs)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_secs)
    }

    pub fn client_cert_path(&self) -> Option<PathBuf> {
        self.client_cert.as_deref().map(expand_path)
    }

    pub fn client_key_path(&self) -> Option<PathBuf> {
        self.client_key.as_deref().map(expand_path)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            tracing::debug!("Could not expand {}: {}, using it verbatim", raw, e);
            PathBuf::from(raw)
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::TomlParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;

        tracing::debug!(
            "Loaded config from {:?}: remote={}, session={}",
            path,
            config.driver.remote,
            config.transport.session
        );

        Ok(config)
    }

    /// Reject combinations that can never produce a working connection
    pub fn validate(&self) -> Result<()> {
        if self.driver.username.is_empty() {
            return Err(ConfigError::Invalid("driver.username must not be empty".into()));
        }
        if self.driver.remote.is_empty() {
            return Err(ConfigError::Invalid("driver.remote must not be empty".into()));
        }
        match (&self.transport.client_cert, &self.transport.client_key) {
            (Some(_), None) | (None, Some(_)) => Err(ConfigError::Invalid(
                "transport.client_cert and transport.client_key must be set together".into(),
            )),
            _ => Ok(()),
        }
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "lxdtest").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("lxdtest.toml"))
    }

    /// Get the data directory path
    pub fn data_dir() -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", "lxdtest").ok_or(ConfigError::NoDataDir)?;
        Ok(dirs.data_dir().to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.driver.username, "ubuntu");
        assert_eq!(config.driver.remote, "local");
        assert!(config.driver.ssh_key.is_none());
        assert_eq!(config.transport.api_endpoint, "https://localhost:8443");
        assert!(!config.transport.verify_ssl);
        assert_eq!(config.transport.session, SessionKind::Cli);
    }

    #[test]
    fn test_readiness_gates_are_independent() {
        let config = Config::default();
        assert_eq!(config.driver.wait_retries, 10);
        assert_eq!(config.driver.wait_interval(), Duration::from_secs(6));
        assert_eq!(config.transport.ready_iterations, 10);
        assert_eq!(config.transport.ready_interval(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[driver]
username = "kitchen"
ssh_key = "/keys/id_rsa"
profiles = ["default", "docker"]

[driver.config]
"security.nesting" = "true"

[transport]
session = "api"
verify_ssl = true
retryable_exit_codes = [35, 255]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.driver.username, "kitchen");
        assert_eq!(config.driver.ssh_key_path(), Some(PathBuf::from("/keys/id_rsa")));
        assert_eq!(config.driver.profiles, vec!["default", "docker"]);
        assert_eq!(
            config.driver.config.get("security.nesting").map(String::as_str),
            Some("true")
        );
        assert_eq!(config.driver.remote, "local");
        assert_eq!(config.transport.session, SessionKind::Api);
        assert!(config.transport.verify_ssl);
        assert_eq!(config.transport.retryable_exit_codes, vec![35, 255]);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_from(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.driver, DriverConfig::default());
    }

    #[test]
    fn test_load_rejects_half_client_identity() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lxdtest.toml");
        std::fs::write(&path, "[transport]\nclient_cert = \"/c.crt\"\n").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_load_reports_parse_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("lxdtest.toml");
        std::fs::write(&path, "[driver\nusername = ").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::TomlParseError { .. })
        ));
    }

    #[test]
    fn test_to_toml_round_trips_session() {
        let mut config = Config::default();
        config.transport.session = SessionKind::Api;
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("session = \"api\""));
    }
}
