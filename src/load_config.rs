//! YAML configuration loading with eager validation.
//!
//! The raw YAML shape mirrors the documented watcher configuration:
//!
//! ```yaml
//! backend: local
//! fs_config:
//!   directory: /data
//!   file_pattern: "(?P<channel_name>[^-]+)-(?P<start_time>\\d{12})\\.hrit"
//! publisher_config:
//!   endpoint: http://localhost:3000/messages
//!   name: hrit_watcher
//! message_config:
//!   subject: /segment/hrit/l1b/
//!   atype: file
//!   aliases:
//!     platform_name:
//!       npp: Suomi-NPP
//! data_config:
//!   - unpack:
//!       format: zip
//! ```
//!
//! All structural problems surface here as [`ConfigError`], before any
//! watcher starts.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{error, info};

use crate::config::{
    duration_from_spec, FsConfig, LocalFsConfig, MessageConfig, MinioFsConfig, ObserverKind,
    S3FsConfig, TransformStep, WatcherConfig, DEFAULT_MAX_CONSECUTIVE_FAILURES,
};
use crate::error::{ConfigError, EventError};
use crate::secrets;

/// Backend names the loader knows how to dispatch on.
pub const REGISTERED_BACKENDS: &[&str] = &["local", "minio", "s3"];

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    backend: String,
    fs_config: serde_yaml::Value,
    #[serde(default)]
    publisher_config: serde_yaml::Value,
    message_config: MessageConfig,
    #[serde(default)]
    data_config: Vec<TransformStep>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLocalFs {
    directory: PathBuf,
    #[serde(default = "default_observer")]
    observer: ObserverKind,
    #[serde(default)]
    file_pattern: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    storage_options: Map<String, Value>,
}

fn default_observer() -> ObserverKind {
    ObserverKind::Os
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawMinioFs {
    endpoint_url: String,
    bucket_name: String,
    #[serde(default)]
    file_pattern: Option<String>,
    #[serde(default)]
    storage_options: Map<String, Value>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawS3Fs {
    bucket_name: String,
    polling_interval: HashMap<String, f64>,
    #[serde(default)]
    start_from: Option<HashMap<String, f64>>,
    #[serde(default)]
    file_pattern: Option<String>,
    #[serde(default)]
    storage_options: Map<String, Value>,
    #[serde(default)]
    max_consecutive_failures: Option<u32>,
}

/// Load and validate a watcher configuration from a YAML file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<WatcherConfig, ConfigError> {
    let path_ref = path.as_ref();
    info!(config_path = ?path_ref, "Loading configuration from file");

    let content = fs::read_to_string(path_ref).map_err(|e| {
        error!(error = ?e, config_path = ?path_ref, "Failed to read config file");
        ConfigError::Io {
            path: path_ref.to_path_buf(),
            source: e,
        }
    })?;

    parse_config(&content)
}

/// Parse and validate a watcher configuration from a YAML string.
pub fn parse_config(content: &str) -> Result<WatcherConfig, ConfigError> {
    let raw: RawConfig = serde_yaml::from_str(content).map_err(|e| {
        error!(error = %e, "Failed to parse config YAML");
        ConfigError::Yaml(e)
    })?;

    let fs = parse_fs_config(&raw.backend, raw.fs_config)?;
    validate_data_config(&raw.data_config)?;

    info!(
        backend = raw.backend,
        subject = %raw.message_config.subject,
        transform_steps = raw.data_config.len(),
        "Config loaded and validated"
    );

    Ok(WatcherConfig {
        fs,
        publisher: raw.publisher_config,
        message: raw.message_config,
        data: raw.data_config,
    })
}

fn parse_fs_config(backend: &str, raw: serde_yaml::Value) -> Result<FsConfig, ConfigError> {
    match backend {
        "local" => {
            let raw: RawLocalFs = section(raw, "fs_config")?;
            check_storage_options(backend, &raw.storage_options)?;
            Ok(FsConfig::Local(LocalFsConfig {
                directory: raw.directory,
                observer: raw.observer,
                file_pattern: compile_pattern(raw.file_pattern)?,
                protocol: raw.protocol,
                storage_options: raw.storage_options,
            }))
        }
        "minio" => {
            let raw: RawMinioFs = section(raw, "fs_config")?;
            check_storage_options(backend, &raw.storage_options)?;
            Ok(FsConfig::Minio(MinioFsConfig {
                endpoint_url: raw.endpoint_url,
                bucket_name: raw.bucket_name,
                file_pattern: compile_pattern(raw.file_pattern)?,
                storage_options: raw.storage_options,
            }))
        }
        "s3" => {
            let raw: RawS3Fs = section(raw, "fs_config")?;
            check_storage_options(backend, &raw.storage_options)?;
            let polling_interval = duration_from_spec(&raw.polling_interval)?;
            if polling_interval.is_zero() {
                return Err(ConfigError::Invalid {
                    section: "fs_config",
                    reason: "polling_interval must be greater than zero".into(),
                });
            }
            Ok(FsConfig::S3(S3FsConfig {
                bucket_name: raw.bucket_name,
                polling_interval,
                start_from: raw.start_from.as_ref().map(duration_from_spec).transpose()?,
                file_pattern: compile_pattern(raw.file_pattern)?,
                storage_options: raw.storage_options,
                max_consecutive_failures: raw
                    .max_consecutive_failures
                    .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            }))
        }
        other => {
            error!(backend = other, registered = ?REGISTERED_BACKENDS, "Unknown backend in config");
            Err(ConfigError::UnknownBackend(other.to_string()))
        }
    }
}

fn section<T: serde::de::DeserializeOwned>(
    value: serde_yaml::Value,
    name: &'static str,
) -> Result<T, ConfigError> {
    serde_yaml::from_value(value).map_err(|e| ConfigError::Invalid {
        section: name,
        reason: e.to_string(),
    })
}

fn compile_pattern(pattern: Option<String>) -> Result<Option<Regex>, ConfigError> {
    match pattern {
        None => Ok(None),
        Some(p) => Regex::new(&p).map(Some).map_err(|e| ConfigError::Invalid {
            section: "fs_config",
            reason: format!("invalid file_pattern: {e}"),
        }),
    }
}

/// Inline credentials in storage options can never be published safely, so
/// they are refused before the watcher even starts.
fn check_storage_options(backend: &str, options: &Map<String, Value>) -> Result<(), ConfigError> {
    if let Some(field) = secrets::find_credential_field(options) {
        error!(backend, field, "Credential-bearing field in fs_config");
        return Err(ConfigError::SecretInConfig {
            backend: backend.to_string(),
            field,
        });
    }
    Ok(())
}

fn validate_data_config(steps: &[TransformStep]) -> Result<(), ConfigError> {
    let fetches = steps
        .iter()
        .filter(|s| matches!(s, TransformStep::Fetch(_)))
        .count();
    let unpacks = steps
        .iter()
        .filter(|s| matches!(s, TransformStep::Unpack(_)))
        .count();
    if fetches > 1 || unpacks > 1 {
        return Err(ConfigError::Invalid {
            section: "data_config",
            reason: "at most one fetch and one unpack step are allowed".into(),
        });
    }
    Ok(())
}

impl From<EventError> for ConfigError {
    fn from(err: EventError) -> Self {
        match err {
            EventError::SecretLeak { protocol, field } => ConfigError::SecretInConfig {
                backend: protocol,
                field,
            },
            other => ConfigError::Invalid {
                section: "fs_config",
                reason: other.to_string(),
            },
        }
    }
}
