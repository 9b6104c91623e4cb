use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use serial_test::serial;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

use object_watcher::backends::s3::{poll_loop, MockObjectLister, ObjectEntry};
use object_watcher::config::{
    FsConfig, LocalFsConfig, MessageConfig, ObserverKind, S3FsConfig, TransformStep, UnpackConfig,
    UnpackFormat, WatcherConfig,
};
use object_watcher::error::PublishError;
use object_watcher::event::{FileEvent, Metadata};
use object_watcher::locator::ResourceLocator;
use object_watcher::message::OutboundMessage;
use object_watcher::pipeline::{handle_event, run_watcher, WatchReport};
use object_watcher::publisher::Publisher;

/// Test double that records every published message.
#[derive(Clone, Default)]
struct RecordingPublisher {
    messages: Arc<Mutex<Vec<OutboundMessage>>>,
}

impl RecordingPublisher {
    fn recorded(&self) -> Vec<OutboundMessage> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

fn watcher_config(fs: FsConfig, data: Vec<TransformStep>) -> WatcherConfig {
    WatcherConfig {
        fs,
        publisher: serde_yaml::Value::Null,
        message: MessageConfig {
            subject: "/segment/viirs/l1b/".into(),
            atype: "file".into(),
            data: json!({"sensor": "viirs"}).as_object().unwrap().clone(),
            aliases: HashMap::from([(
                "platform_name".to_string(),
                HashMap::from([("npp".to_string(), "Suomi-NPP".to_string())]),
            )]),
        },
        data,
    }
}

fn local_fs(directory: &Path) -> FsConfig {
    FsConfig::Local(LocalFsConfig {
        directory: directory.to_path_buf(),
        observer: ObserverKind::Polling,
        file_pattern: None,
        protocol: None,
        storage_options: serde_json::Map::new(),
    })
}

fn write_zip(dir: &Path, members: &[&str]) -> std::path::PathBuf {
    let path = dir.join("archive.zip");
    let file = std::fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    for member in members {
        writer
            .start_file(*member, zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"payload").unwrap();
    }
    writer.finish().unwrap();
    path
}

/// A zip container event fans out into one message per member, each
/// addressed through the archive rather than extracted.
#[tokio::test]
async fn test_zip_event_fans_out_into_member_messages() {
    let dir = tempdir().unwrap();
    let archive = write_zip(dir.path(), &["a.h5", "b.h5"]);

    let config = watcher_config(
        local_fs(dir.path()),
        vec![TransformStep::Unpack(UnpackConfig {
            format: UnpackFormat::Zip,
            include_dir_in_uid: false,
        })],
    );
    let publisher = RecordingPublisher::default();
    let mut report = WatchReport::default();

    let event = FileEvent::new(ResourceLocator::local(&archive), Metadata::new());
    handle_event(event, &config, &publisher, &mut report).await;

    let messages = publisher.recorded();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].data["uid"], json!("a.h5"));
    assert_eq!(messages[1].data["uid"], json!("b.h5"));
    assert_eq!(messages[0].data["uri"], json!("zip://a.h5"));
    let filesystem = &messages[0].data["filesystem"];
    assert_eq!(filesystem["protocol"], json!("zip"));
    assert_eq!(filesystem["fo"], json!(archive.to_string_lossy()));
    assert_eq!(report, WatchReport { published: 2, failed: 0 });
}

/// Aliases resolve before assembly, so the published metadata carries the
/// substituted value.
#[tokio::test]
async fn test_alias_is_resolved_in_the_published_message() {
    let dir = tempdir().unwrap();
    let config = watcher_config(local_fs(dir.path()), Vec::new());
    let publisher = RecordingPublisher::default();
    let mut report = WatchReport::default();

    let metadata = json!({"platform_name": "npp"}).as_object().unwrap().clone();
    let event = FileEvent::new(
        ResourceLocator::local(dir.path().join("granule.h5")),
        metadata,
    );
    handle_event(event, &config, &publisher, &mut report).await;

    let messages = publisher.recorded();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data["platform_name"], json!("Suomi-NPP"));
    assert_eq!(messages[0].data["sensor"], json!("viirs"));
    assert_eq!(messages[0].subject, "/segment/viirs/l1b/");
}

/// End-to-end: a file appearing in a watched directory comes out as one
/// published message.
#[tokio::test]
#[serial]
async fn test_local_watcher_publishes_new_file() {
    let dir = tempdir().unwrap();
    let config = watcher_config(local_fs(dir.path()), Vec::new());
    let publisher = RecordingPublisher::default();
    let shutdown = CancellationToken::new();

    let watcher_publisher = publisher.clone();
    let watcher_shutdown = shutdown.clone();
    let watcher = tokio::spawn(async move {
        run_watcher(&config, &watcher_publisher, watcher_shutdown).await
    });

    // Let the polling observer take its baseline scan before the file lands.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    std::fs::write(dir.path().join("granule.h5"), b"payload").unwrap();

    let mut published = Vec::new();
    for _ in 0..50 {
        published = publisher.recorded();
        if !published.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    shutdown.cancel();
    let report = watcher.await.unwrap().expect("watcher should stop cleanly");

    assert_eq!(published.len(), 1, "expected exactly one message");
    assert_eq!(published[0].data["uid"], json!("granule.h5"));
    assert_eq!(
        published[0].data["uri"],
        json!(dir.path().join("granule.h5").to_string_lossy())
    );
    assert_eq!(report.published, 1);
}

fn entry(key: &str, etag: &str) -> ObjectEntry {
    ObjectEntry {
        key: key.to_string(),
        etag: Some(etag.to_string()),
        last_modified_epoch: Some(1_700_000_000),
        size: Some(7),
    }
}

/// The poll source seeds its state on the first listing and emits only the
/// diff afterwards; unchanged objects are never re-published.
#[tokio::test]
#[serial]
async fn test_poll_source_emits_only_new_objects() {
    let baseline = vec![entry("a.h5", "e1"), entry("b.h5", "e2")];
    let mut grown = baseline.clone();
    grown.push(entry("c.h5", "e3"));

    let shutdown = CancellationToken::new();
    let mut lister = MockObjectLister::new();
    let mut seq = mockall::Sequence::new();
    let first = baseline.clone();
    lister
        .expect_list_objects()
        .times(1)
        .in_sequence(&mut seq)
        .returning(move || Ok(first.clone()));
    let second = grown.clone();
    lister
        .expect_list_objects()
        .times(1)
        .in_sequence(&mut seq)
        .returning(move || Ok(second.clone()));
    let third = grown.clone();
    let stop = shutdown.clone();
    lister
        .expect_list_objects()
        .times(1)
        .in_sequence(&mut seq)
        .returning(move || {
            stop.cancel();
            Ok(third.clone())
        });

    let config = S3FsConfig {
        bucket_name: "viirs-data".into(),
        polling_interval: Duration::from_millis(5),
        start_from: None,
        file_pattern: None,
        storage_options: serde_json::Map::new(),
        max_consecutive_failures: 3,
    };
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    poll_loop(&lister, &config, &tx, &shutdown)
        .await
        .expect("poll loop should stop cleanly");
    drop(tx);

    let mut uids = Vec::new();
    while let Some(event) = rx.recv().await {
        uids.push(event.uid());
    }
    assert_eq!(uids, vec!["c.h5"]);
}
