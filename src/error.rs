//! Error types shared across the crate.

use thiserror::Error;

/// Configuration errors. These are fatal: they surface at construction time
/// and abort startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Channel lifecycle errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {name} failed to start: {reason}")]
    StartupFailed { name: String, reason: String },
}
