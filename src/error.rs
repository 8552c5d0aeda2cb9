use std::time::Duration;

use thiserror::Error;

/// Problems detected before any fetching starts. These abort the run.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("channel list is empty, add channel @usernames to {0}")]
    EmptyChannels(String),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
}

/// Errors raised by a message source while iterating a channel.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("rate limited, retry after {}s", .retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed message: {0}")]
    Malformed(String),
}
