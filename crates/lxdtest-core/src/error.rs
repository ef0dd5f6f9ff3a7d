//! Error types for lxdtest-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] lxdtest_config::ConfigError),

    #[error("Hypervisor error: {0}")]
    Provider(#[from] lxdtest_provider::ProviderError),

    /// A required setting is missing or unusable
    #[error("{0}")]
    Configuration(String),

    #[error("Container {name} failed to start: still not running after {checks} status checks")]
    Timeout { name: String, checks: u32 },

    #[error("Transport failed: [{command}] {}", describe_exit(.exit_code))]
    TransportFailed {
        command: String,
        exit_code: Option<i32>,
    },

    #[error("Public key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn describe_exit(exit_code: &Option<i32>) -> String {
    match exit_code {
        Some(code) => format!("exited ({})", code),
        None => "did not complete".to_string(),
    }
}

impl CoreError {
    /// Exit code carried by a failed command, from either layer
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::TransportFailed { exit_code, .. } => *exit_code,
            Self::Provider(e) => e.exit_code(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
