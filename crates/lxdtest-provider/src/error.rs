//! Error types for hypervisor adapters

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("[{command}] exited ({exit_code}): {stderr}")]
    AdapterFailure {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Failed to run [{command}]: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Unexpected hypervisor response: {0}")]
    Parse(String),

    #[error("LXD API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ProviderError {
    /// Exit code of the failed external call, if there was one
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::AdapterFailure { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;
