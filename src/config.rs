//! Typed configuration for one watcher instance.
//!
//! Every section is validated eagerly at load time (see
//! [`crate::load_config`]); a watcher never starts on a malformed or
//! credential-leaking configuration.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::event::Metadata;

/// The full configuration of one watcher instance.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub fs: FsConfig,
    /// Opaque, passed through to the publisher adapter's constructor.
    pub publisher: serde_yaml::Value,
    pub message: MessageConfig,
    /// Ordered transform chain; at most one fetch and one unpack.
    pub data: Vec<TransformStep>,
}

/// Backend-specific connection and scope parameters.
#[derive(Debug, Clone)]
pub enum FsConfig {
    Local(LocalFsConfig),
    Minio(MinioFsConfig),
    S3(S3FsConfig),
}

impl FsConfig {
    /// The backend name this section was registered under.
    pub fn backend(&self) -> &'static str {
        match self {
            FsConfig::Local(_) => "local",
            FsConfig::Minio(_) => "minio",
            FsConfig::S3(_) => "s3",
        }
    }
}

/// Watch a locally accessible directory for new files.
#[derive(Debug, Clone)]
pub struct LocalFsConfig {
    pub directory: PathBuf,
    pub observer: ObserverKind,
    /// Filenames must match to be published; named captures become metadata.
    pub file_pattern: Option<Regex>,
    /// Advertise the files under another protocol (e.g. `ssh`) instead of
    /// bare local paths.
    pub protocol: Option<String>,
    pub storage_options: Map<String, Value>,
}

/// How the local backend detects changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObserverKind {
    /// OS-level events (inotify and friends).
    Os,
    /// Directory polling, for filesystems without reliable events (NFS).
    Polling,
}

/// Subscribe to bucket notifications pushed by a minio/S3-compatible server.
#[derive(Debug, Clone)]
pub struct MinioFsConfig {
    pub endpoint_url: String,
    pub bucket_name: String,
    pub file_pattern: Option<Regex>,
    pub storage_options: Map<String, Value>,
}

/// Poll an S3 bucket listing on a fixed interval.
#[derive(Debug, Clone)]
pub struct S3FsConfig {
    /// Bucket, optionally with a key prefix: `my-bucket/some/prefix`.
    pub bucket_name: String,
    pub polling_interval: Duration,
    /// Look-back window for the first listing; objects older than this are
    /// never published. `None` starts observation strictly from now.
    pub start_from: Option<Duration>,
    pub file_pattern: Option<Regex>,
    pub storage_options: Map<String, Value>,
    /// Consecutive listing failures tolerated before the watcher terminates.
    pub max_consecutive_failures: u32,
}

pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Static parts of the outbound message.
#[derive(Debug, Clone, Deserialize)]
pub struct MessageConfig {
    pub subject: String,
    /// Message type annotation, e.g. `file` or `dataset`.
    pub atype: String,
    /// Literal data fields included in every message.
    #[serde(default)]
    pub data: Metadata,
    /// Per-field exact-match substitution maps, e.g.
    /// `{platform_name: {npp: "Suomi-NPP"}}`.
    #[serde(default)]
    pub aliases: HashMap<String, HashMap<String, String>>,
}

/// One step of the data transform chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStep {
    Fetch(FetchConfig),
    Unpack(UnpackConfig),
}

/// Materialize the resource locally before publishing.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    pub destination: PathBuf,
}

/// Expand a container resource into one event per member.
#[derive(Debug, Clone, Deserialize)]
pub struct UnpackConfig {
    pub format: UnpackFormat,
    /// Qualify each member identifier with the container's identifier, to
    /// disambiguate basenames recurring across containers.
    #[serde(default)]
    pub include_dir_in_uid: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnpackFormat {
    Zip,
    Directory,
}

/// Interpret an interval spec like `{minutes: 10, seconds: 30}`.
///
/// Unknown units are a configuration error rather than a silently wrong
/// duration: a typoed unit would otherwise shift the interval unnoticed.
pub fn duration_from_spec(spec: &HashMap<String, f64>) -> Result<Duration, ConfigError> {
    let mut seconds = 0.0;
    for (unit, amount) in spec {
        seconds += match unit.as_str() {
            "days" => amount * 86_400.0,
            "hours" => amount * 3_600.0,
            "minutes" => amount * 60.0,
            "seconds" => *amount,
            other => {
                return Err(ConfigError::Invalid {
                    section: "fs_config",
                    reason: format!(
                        "unknown interval unit '{other}' (expected days, hours, minutes or seconds)"
                    ),
                });
            }
        };
    }
    Ok(Duration::from_secs_f64(seconds.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_spec_combines_units() {
        let spec = HashMap::from([("minutes".to_string(), 10.0), ("seconds".to_string(), 30.0)]);
        assert_eq!(duration_from_spec(&spec).unwrap(), Duration::from_secs(630));
    }

    #[test]
    fn typoed_unit_is_rejected_not_ignored() {
        let spec = HashMap::from([("minutes".to_string(), 10.0), ("secconds".to_string(), 30.0)]);
        match duration_from_spec(&spec) {
            Err(ConfigError::Invalid { section, reason }) => {
                assert_eq!(section, "fs_config");
                assert!(reason.contains("secconds"));
            }
            other => panic!("expected Invalid, got {other:?}"),
        }
    }
}
