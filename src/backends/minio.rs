//! Notification-stream source for minio/S3-compatible bucket events.
//!
//! Opens a long-lived subscription to the server's bucket-notification
//! endpoint, which streams one JSON record per line. Each record may carry
//! several object entries; every entry becomes one [`FileEvent`]. Records
//! that fail to decode are logged and skipped; the subscription itself stays
//! up and is re-established when the server closes it.
//!
//! The server must grant access through its own credential mechanism
//! (profile, pre-exchanged token); inline credentials in `storage_options`
//! are refused at config load.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{MinioFsConfig, DEFAULT_MAX_CONSECUTIVE_FAILURES};
use crate::error::{EventError, SourceError};
use crate::event::{metadata_from_pattern, FileEvent, Metadata};
use crate::locator::{FsDescriptor, ResourceLocator};
use crate::source::EventSource;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Upper bound on one buffered record line. Notification records are small;
/// anything larger means the server is streaming something else entirely.
const MAX_RECORD_BYTES: usize = 1 << 20;

/// A long-lived stream of raw notification records.
///
/// One implementation speaks HTTP to a real server; tests substitute a
/// scripted stream.
#[async_trait]
pub trait RecordStream: Send {
    /// The next raw record line, or `None` when the server closed the
    /// subscription.
    async fn next_record(&mut self) -> Result<Option<String>, SourceError>;
}

type ByteChunks = Pin<Box<dyn Stream<Item = reqwest::Result<Vec<u8>>> + Send>>;

/// Line-delimited record stream over a streaming HTTP response.
pub struct HttpRecordStream {
    chunks: ByteChunks,
    buffer: Vec<u8>,
}

impl HttpRecordStream {
    pub async fn connect(config: &MinioFsConfig) -> Result<Self, SourceError> {
        let url = format!(
            "{}/{}?events=s3:ObjectCreated:*",
            config.endpoint_url.trim_end_matches('/'),
            config.bucket_name
        );
        let response = reqwest::Client::new()
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SourceError::Transient(format!("notification subscription: {e}")))?;
        info!(url, "Subscribed to bucket notifications");
        let chunks = Box::pin(response.bytes_stream().map(|r| r.map(|b| b.to_vec())));
        Ok(Self {
            chunks,
            buffer: Vec::new(),
        })
    }
}

#[async_trait]
impl RecordStream for HttpRecordStream {
    async fn next_record(&mut self) -> Result<Option<String>, SourceError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                return Ok(Some(line));
            }
            if self.buffer.len() > MAX_RECORD_BYTES {
                self.buffer.clear();
                return Err(SourceError::Transient(format!(
                    "notification record exceeds {MAX_RECORD_BYTES} bytes without a line break"
                )));
            }
            match self.chunks.next().await {
                Some(Ok(chunk)) => self.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(SourceError::Transient(e.to_string())),
                None => {
                    let line = String::from_utf8_lossy(&self.buffer).trim().to_string();
                    self.buffer.clear();
                    return Ok(if line.is_empty() { None } else { Some(line) });
                }
            }
        }
    }
}

// Wire shape of one bucket notification record.
#[derive(Deserialize)]
struct NotificationEnvelope {
    #[serde(rename = "Records", default)]
    records: Vec<NotificationRecord>,
}

#[derive(Deserialize)]
struct NotificationRecord {
    s3: S3Entity,
}

#[derive(Deserialize)]
struct S3Entity {
    bucket: BucketEntity,
    object: ObjectEntity,
}

#[derive(Deserialize)]
struct BucketEntity {
    name: String,
}

#[derive(Deserialize)]
struct ObjectEntity {
    key: String,
    #[serde(default)]
    size: Option<i64>,
}

pub struct MinioNotificationSource {
    config: MinioFsConfig,
}

impl MinioNotificationSource {
    pub fn new(config: MinioFsConfig) -> Self {
        Self { config }
    }

    /// Forward records from an open stream until it closes, the channel
    /// closes, or shutdown fires. Returns whether forwarding should resume
    /// on a fresh subscription.
    pub async fn forward_records<S: RecordStream>(
        &self,
        stream: &mut S,
        tx: &mpsc::Sender<FileEvent>,
        shutdown: &CancellationToken,
    ) -> Result<Forward, SourceError> {
        loop {
            let record = tokio::select! {
                _ = shutdown.cancelled() => return Ok(Forward::Stop),
                record = stream.next_record() => record?,
            };
            let Some(record) = record else {
                return Ok(Forward::Resubscribe);
            };

            let events = match events_from_record(&record, &self.config) {
                Ok(events) => events,
                Err(e) => {
                    // Malformed records are the server's problem, not ours;
                    // the subscription stays up.
                    warn!(error = %e, "Skipping undecodable notification record");
                    continue;
                }
            };
            for event in events {
                if tx.send(event).await.is_err() {
                    return Ok(Forward::Stop);
                }
            }
        }
    }
}

/// Whether the subscription loop should reconnect or stop.
#[derive(Debug, PartialEq, Eq)]
pub enum Forward {
    Resubscribe,
    Stop,
}

#[async_trait]
impl EventSource for MinioNotificationSource {
    async fn run(
        &self,
        tx: mpsc::Sender<FileEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        let mut consecutive_failures: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let mut stream = match HttpRecordStream::connect(&self.config).await {
                Ok(stream) => {
                    consecutive_failures = 0;
                    stream
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= DEFAULT_MAX_CONSECUTIVE_FAILURES {
                        return Err(SourceError::Fatal(format!(
                            "subscription failed {consecutive_failures} consecutive times: {e}"
                        )));
                    }
                    warn!(error = %e, "Subscription attempt failed, retrying");
                    tokio::select! {
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RECONNECT_DELAY) => continue,
                    }
                }
            };

            match self.forward_records(&mut stream, &tx, &shutdown).await {
                Ok(Forward::Stop) => return Ok(()),
                Ok(Forward::Resubscribe) => {
                    info!("Notification stream closed by server, resubscribing");
                }
                Err(SourceError::Transient(reason)) => {
                    warn!(reason, "Notification stream failed, resubscribing");
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }
}

/// Decode one raw record line into events.
pub fn events_from_record(
    record: &str,
    config: &MinioFsConfig,
) -> Result<Vec<FileEvent>, EventError> {
    let envelope: NotificationEnvelope = serde_json::from_str(record)
        .map_err(|e| EventError::Assemble(format!("malformed notification record: {e}")))?;

    let mut events = Vec::new();
    for entry in envelope.records {
        let key = entry.s3.object.key;
        let basename = key.rsplit('/').next().unwrap_or(&key);

        let mut metadata = match &config.file_pattern {
            Some(pattern) => match metadata_from_pattern(pattern, basename) {
                Some(metadata) => metadata,
                None => continue,
            },
            None => Metadata::new(),
        };
        if let Some(size) = entry.s3.object.size {
            metadata.insert("size".into(), Value::from(size));
        }

        let descriptor = FsDescriptor::checked("s3", config.storage_options.clone())?;
        let path = format!("{}/{}", entry.s3.bucket.name, key);
        events.push(FileEvent::new(
            ResourceLocator::remote(descriptor, path),
            metadata,
        ));
    }
    Ok(events)
}
