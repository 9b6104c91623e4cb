//! Poll-based source for S3 buckets.
//!
//! On every cycle the full watched scope is listed and diffed against the
//! retained [`WatcherState`]; only identities that are new or whose stable
//! key changed are emitted, in ascending key order. The state is then
//! replaced wholesale with the latest listing, bounding memory to one
//! listing. Nothing is persisted across restarts: a new watcher observes
//! from "now" (minus the optional `start_from` look-back).
//!
//! A failed listing skips the cycle and leaves the state untouched; failures
//! repeating past `max_consecutive_failures` terminate the watcher instead
//! of retrying forever.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3 as s3;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::config::S3FsConfig;
use crate::error::SourceError;
use crate::event::{metadata_from_pattern, FileEvent, Metadata};
use crate::locator::{FsDescriptor, ResourceLocator};
use crate::source::EventSource;

/// One object in a bucket listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectEntry {
    pub key: String,
    pub etag: Option<String>,
    pub last_modified_epoch: Option<i64>,
    pub size: Option<i64>,
}

impl ObjectEntry {
    /// Stable identity key: etag when the backend provides one, otherwise
    /// the last-modified timestamp. A change in either re-emits the object.
    fn stable_token(&self) -> String {
        self.etag.clone().unwrap_or_else(|| {
            self.last_modified_epoch
                .map(|epoch| epoch.to_string())
                .unwrap_or_default()
        })
    }
}

/// The set of already-observed object identities, key → stable token.
pub type WatcherState = HashMap<String, String>;

/// Lists the watched scope. Mocked in tests; the real implementation pages
/// through `ListObjectsV2`.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ObjectLister: Send + Sync {
    async fn list_objects(&self) -> Result<Vec<ObjectEntry>, SourceError>;
}

pub struct S3Lister {
    client: s3::Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3Lister {
    pub async fn from_config(config: &S3FsConfig) -> Self {
        let (bucket, prefix) = split_bucket(&config.bucket_name);
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(Value::String(profile)) = config.storage_options.get("profile") {
            loader = loader.profile_name(profile);
        }
        if let Some(Value::String(endpoint)) = config.storage_options.get("endpoint_url") {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;
        Self {
            client: s3::Client::new(&shared),
            bucket,
            prefix,
        }
    }
}

#[async_trait]
impl ObjectLister for S3Lister {
    async fn list_objects(&self) -> Result<Vec<ObjectEntry>, SourceError> {
        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket);
            if let Some(prefix) = &self.prefix {
                request = request.prefix(prefix);
            }
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| SourceError::Transient(format!("bucket listing: {e}")))?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                entries.push(ObjectEntry {
                    key: key.to_string(),
                    etag: object.e_tag().map(str::to_string),
                    last_modified_epoch: object.last_modified().map(|dt| dt.secs()),
                    size: object.size(),
                });
            }
            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(entries)
    }
}

fn split_bucket(bucket_name: &str) -> (String, Option<String>) {
    match bucket_name.split_once('/') {
        Some((bucket, prefix)) if !prefix.is_empty() => {
            (bucket.to_string(), Some(prefix.to_string()))
        }
        _ => (bucket_name.to_string(), None),
    }
}

pub struct S3PollSource {
    config: S3FsConfig,
}

impl S3PollSource {
    pub fn new(config: S3FsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl EventSource for S3PollSource {
    async fn run(
        &self,
        tx: mpsc::Sender<FileEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        info!(bucket = %self.config.bucket_name, "Starting polling on s3");
        let lister = S3Lister::from_config(&self.config).await;
        poll_loop(&lister, &self.config, &tx, &shutdown).await
    }
}

/// The polling cycle, generic over the lister so tests can script listings.
pub async fn poll_loop<L: ObjectLister>(
    lister: &L,
    config: &S3FsConfig,
    tx: &mpsc::Sender<FileEvent>,
    shutdown: &CancellationToken,
) -> Result<(), SourceError> {
    let mut state: Option<WatcherState> = None;
    let mut consecutive_failures: u32 = 0;
    let cutoff_epoch = config.start_from.map(|lookback| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        now - lookback.as_secs() as i64
    });

    loop {
        match lister.list_objects().await {
            Ok(listing) => {
                consecutive_failures = 0;
                let fresh = match &state {
                    // First listing: seed the state; publish only objects
                    // inside the optional look-back window.
                    None => initial_entries(&listing, cutoff_epoch),
                    Some(seen) => new_entries(seen, &listing),
                };
                for entry in &fresh {
                    if let Some(event) = event_for_entry(entry, config)? {
                        if tx.send(event).await.is_err() {
                            return Ok(());
                        }
                    }
                }
                state = Some(state_of(&listing));
                debug!(objects = listing.len(), fresh = fresh.len(), "Finished polling cycle");
            }
            Err(SourceError::Fatal(reason)) => return Err(SourceError::Fatal(reason)),
            Err(SourceError::Transient(reason)) => {
                consecutive_failures += 1;
                if consecutive_failures >= config.max_consecutive_failures {
                    return Err(SourceError::Fatal(format!(
                        "listing failed {consecutive_failures} consecutive times: {reason}"
                    )));
                }
                // State untouched; the next cycle re-diffs against it.
                warn!(reason, consecutive_failures, "Polling cycle skipped");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = tokio::time::sleep(config.polling_interval) => {}
        }
    }
}

fn state_of(listing: &[ObjectEntry]) -> WatcherState {
    listing
        .iter()
        .map(|entry| (entry.key.clone(), entry.stable_token()))
        .collect()
}

/// Entries not present in, or differing from, the retained state, in
/// ascending key order for reproducible behavior.
pub fn new_entries(seen: &WatcherState, listing: &[ObjectEntry]) -> Vec<ObjectEntry> {
    let mut fresh: Vec<ObjectEntry> = listing
        .iter()
        .filter(|entry| {
            let token = entry.stable_token();
            seen.get(&entry.key) != Some(&token)
        })
        .cloned()
        .collect();
    fresh.sort_by(|a, b| a.key.cmp(&b.key));
    fresh
}

fn initial_entries(listing: &[ObjectEntry], cutoff_epoch: Option<i64>) -> Vec<ObjectEntry> {
    let Some(cutoff) = cutoff_epoch else {
        return Vec::new();
    };
    let mut fresh: Vec<ObjectEntry> = listing
        .iter()
        .filter(|entry| entry.last_modified_epoch.is_some_and(|epoch| epoch >= cutoff))
        .cloned()
        .collect();
    fresh.sort_by(|a, b| a.key.cmp(&b.key));
    fresh
}

fn event_for_entry(
    entry: &ObjectEntry,
    config: &S3FsConfig,
) -> Result<Option<FileEvent>, SourceError> {
    let basename = entry.key.rsplit('/').next().unwrap_or(&entry.key);

    let mut metadata = match &config.file_pattern {
        Some(pattern) => match metadata_from_pattern(pattern, basename) {
            Some(metadata) => metadata,
            None => return Ok(None),
        },
        None => Metadata::new(),
    };
    if let Some(size) = entry.size {
        metadata.insert("size".into(), Value::from(size));
    }
    if let Some(epoch) = entry.last_modified_epoch {
        metadata.insert("last_modified".into(), Value::from(epoch));
    }

    // Validated at config load; a secret here would repeat every cycle.
    let descriptor = FsDescriptor::checked("s3", config.storage_options.clone())
        .map_err(|e| SourceError::Fatal(e.to_string()))?;
    let (bucket, _) = split_bucket(&config.bucket_name);
    let path = format!("{bucket}/{}", entry.key);
    Ok(Some(FileEvent::new(
        ResourceLocator::remote(descriptor, path),
        metadata,
    )))
}
