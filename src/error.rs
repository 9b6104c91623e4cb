//! Error taxonomy for the watcher pipeline.
//!
//! Only [`ConfigError`] and a fatal [`SourceError`] terminate a watcher.
//! Everything in [`EventError`] is isolated to the offending event: the
//! event is dropped, the loop keeps running.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal configuration problems. A watcher never starts with one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("invalid '{section}' section: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },

    /// An inline credential was found in the configuration. The field name is
    /// reported, the value never is.
    #[error("credential-bearing field '{field}' in '{backend}' configuration cannot be published safely")]
    SecretInConfig { backend: String, field: String },
}

/// Failures of a backend source.
///
/// `Transient` skips the current poll/notification cycle; `Fatal` terminates
/// the watcher (credentials revoked, watched scope deleted, or a transient
/// failure repeating past the configured threshold).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("transient source failure: {0}")]
    Transient(String),

    #[error("source failed permanently: {0}")]
    Fatal(String),
}

/// Failures scoped to a single event. Logged, the event is dropped, the
/// watcher continues with the next one.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("fetch failed for '{uri}': {reason}")]
    Fetch { uri: String, reason: String },

    #[error("unpack failed for '{uri}': {reason}")]
    Unpack { uri: String, reason: String },

    /// A credential-bearing field survived up to the publish boundary.
    /// Carries the backend protocol and the field name only; the value is
    /// never echoed.
    #[error("credential-bearing field '{field}' present in '{protocol}' filesystem descriptor")]
    SecretLeak { protocol: String, field: String },

    #[error("failed to assemble message: {0}")]
    Assemble(String),

    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Terminal outcome of a publish call for one event. Not retried internally.
#[derive(Debug, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

/// Top-level watcher outcome.
#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),
}
