use std::path::PathBuf;

use thiserror::Error;

/// Failure talking to the tracking service or the CI service.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected response payload: {0}")]
    Decode(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Transport failures, timeouts, rate limits and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http(_) => true,
            GatewayError::Api { status, .. } => *status == 429 || *status >= 500,
            GatewayError::Decode(_) | GatewayError::NotFound(_) => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Missing required configuration: {}", keys.join(", "))]
    Missing { keys: Vec<&'static str> },

    #[error("Invalid configuration for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}
