//! The data transform chain: fetch and unpack.
//!
//! Transforms run between detection and message assembly, in configuration
//! order. Fetch replaces an event with one pointing at a local copy of the
//! resource; unpack fans a container event into one child per member. Both
//! orders compose: unpack-before-fetch lists a remote container in place
//! (staging it to a temporary file) and materializes members afterwards. A
//! transform failure drops the affected event and is reported back to the
//! pipeline; sibling events continue through the chain.

use std::path::{Path, PathBuf};

use aws_config::BehaviorVersion;
use aws_sdk_s3 as s3;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;

use crate::config::{FetchConfig, TransformStep, UnpackConfig, UnpackFormat};
use crate::error::EventError;
use crate::event::FileEvent;
use crate::locator::ResourceLocator;

/// Result of running one event through the transform chain.
#[derive(Debug, Default)]
pub struct TransformOutcome {
    pub events: Vec<FileEvent>,
    pub failures: Vec<EventError>,
}

/// Run one detected event through the configured transform steps.
pub async fn run_data_config(event: FileEvent, steps: &[TransformStep]) -> TransformOutcome {
    let mut events = vec![event];
    let mut failures = Vec::new();

    for step in steps {
        let mut surviving = Vec::new();
        for event in events {
            match step {
                TransformStep::Fetch(config) => match fetch_event(event, config).await {
                    Ok(fetched) => surviving.push(fetched),
                    Err(e) => failures.push(e),
                },
                TransformStep::Unpack(config) => match unpack_event(&event, config).await {
                    Ok(children) => surviving.extend(children),
                    Err(e) => failures.push(e),
                },
            }
        }
        events = surviving;
    }

    TransformOutcome { events, failures }
}

/// Materialize the resource under the configured destination directory and
/// return an event pointing at the local copy.
///
/// The identifier and metadata carry over; the original access uri is kept
/// as the `original_uri` metadata field.
async fn fetch_event(event: FileEvent, config: &FetchConfig) -> Result<FileEvent, EventError> {
    let uri = event.locator.uri();
    let destination = config.destination.join(event.locator.basename());

    match event.locator.protocol() {
        None => {
            tokio::fs::copy(event.locator.path(), &destination)
                .await
                .map_err(|e| fetch_error(&uri, e))?;
        }
        Some("s3") => fetch_s3(&event, &destination).await?,
        Some("zip") => fetch_zip_member(&event, &destination).await?,
        Some(other) => {
            return Err(EventError::Fetch {
                uri,
                reason: format!("no fetch support for protocol '{other}'"),
            });
        }
    }

    let uid = event.uid();
    let mut metadata = event.metadata;
    metadata.insert("original_uri".into(), Value::String(uri));
    Ok(FileEvent::new(ResourceLocator::local(&destination), metadata).with_uid(uid))
}

fn fetch_error(uri: &str, e: impl std::fmt::Display) -> EventError {
    EventError::Fetch {
        uri: uri.to_string(),
        reason: e.to_string(),
    }
}

async fn fetch_s3(event: &FileEvent, destination: &Path) -> Result<(), EventError> {
    let uri = event.locator.uri();
    let options = event
        .locator
        .filesystem()
        .map(|fs| fs.storage_options().clone())
        .unwrap_or_default();
    download_s3(event.locator.path(), &options, destination)
        .await
        .map_err(|reason| fetch_error(&uri, reason))
}

/// Stream one object into `destination`. `bucket_path` is
/// `bucket/key...`, as carried by s3 locators.
async fn download_s3(
    bucket_path: &str,
    options: &Map<String, Value>,
    destination: &Path,
) -> Result<(), String> {
    let (bucket, key) = bucket_path
        .split_once('/')
        .ok_or_else(|| "object path carries no bucket".to_string())?;

    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(Value::String(profile)) = options.get("profile") {
        loader = loader.profile_name(profile);
    }
    if let Some(Value::String(endpoint)) = options.get("endpoint_url") {
        loader = loader.endpoint_url(endpoint);
    }
    let client = s3::Client::new(&loader.load().await);

    let mut object = client
        .get_object()
        .bucket(bucket)
        .key(key)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let mut file = tokio::fs::File::create(destination)
        .await
        .map_err(|e| e.to_string())?;
    while let Some(chunk) = object.body.try_next().await.map_err(|e| e.to_string())? {
        file.write_all(&chunk).await.map_err(|e| e.to_string())?;
    }
    file.flush().await.map_err(|e| e.to_string())
}

/// Extract a single archive member addressed by a chained locator. A remote
/// container (unpack-before-fetch) is staged to a temporary file first.
async fn fetch_zip_member(event: &FileEvent, destination: &Path) -> Result<(), EventError> {
    let uri = event.locator.uri();
    let options = event
        .locator
        .filesystem()
        .map(|fs| fs.storage_options().clone())
        .unwrap_or_default();

    let target = options
        .get("target_protocol")
        .and_then(Value::as_str)
        .unwrap_or("file");
    let fo = options
        .get("fo")
        .and_then(Value::as_str)
        .ok_or_else(|| fetch_error(&uri, "chained locator names no container"))?;

    // The staging handle must outlive the extraction below.
    let (container, _staged) = match target {
        "file" => (PathBuf::from(fo), None),
        "s3" => {
            let bucket_path = fo
                .strip_prefix("s3://")
                .ok_or_else(|| fetch_error(&uri, "container uri does not match its protocol"))?;
            let target_options = match options.get("target_options") {
                Some(Value::Object(map)) => map.clone(),
                _ => Map::new(),
            };
            let staged = NamedTempFile::new().map_err(|e| fetch_error(&uri, e))?;
            download_s3(bucket_path, &target_options, staged.path())
                .await
                .map_err(|reason| fetch_error(&uri, reason))?;
            (staged.path().to_path_buf(), Some(staged))
        }
        other => {
            return Err(fetch_error(
                &uri,
                format!("no fetch support for container protocol '{other}'"),
            ));
        }
    };

    let member = event.locator.path().to_string();
    let destination = destination.to_path_buf();
    let extract_uri = uri.clone();
    tokio::task::spawn_blocking(move || -> Result<(), EventError> {
        let file = std::fs::File::open(&container).map_err(|e| fetch_error(&extract_uri, e))?;
        let mut archive =
            zip::ZipArchive::new(file).map_err(|e| fetch_error(&extract_uri, e))?;
        let mut entry = archive
            .by_name(&member)
            .map_err(|e| fetch_error(&extract_uri, e))?;
        let mut out =
            std::fs::File::create(&destination).map_err(|e| fetch_error(&extract_uri, e))?;
        std::io::copy(&mut entry, &mut out).map_err(|e| fetch_error(&extract_uri, e))?;
        Ok(())
    })
    .await
    .map_err(|e| fetch_error(&uri, e))?
}

/// Expand one container event into child events, one per member.
///
/// Children inherit the container's metadata. With `include_dir_in_uid` each
/// member identifier is qualified by the container's identifier, so that the
/// same member name recurring across containers stays distinguishable.
async fn unpack_event(
    event: &FileEvent,
    config: &UnpackConfig,
) -> Result<Vec<FileEvent>, EventError> {
    match config.format {
        UnpackFormat::Zip => unpack_zip(event, config).await,
        UnpackFormat::Directory => unpack_directory(event, config).await,
    }
}

fn unpack_error(uri: &str, e: impl std::fmt::Display) -> EventError {
    EventError::Unpack {
        uri: uri.to_string(),
        reason: e.to_string(),
    }
}

/// Where the bytes of a container can be read from.
#[derive(Debug, PartialEq)]
enum ContainerSource {
    Local(PathBuf),
    S3 {
        bucket_path: String,
        options: Map<String, Value>,
    },
}

fn container_source(locator: &ResourceLocator) -> Result<ContainerSource, EventError> {
    match locator.protocol() {
        None => Ok(ContainerSource::Local(PathBuf::from(locator.path()))),
        Some("s3") => Ok(ContainerSource::S3 {
            bucket_path: locator.path().to_string(),
            options: locator
                .filesystem()
                .map(|fs| fs.storage_options().clone())
                .unwrap_or_default(),
        }),
        Some(other) => Err(EventError::Unpack {
            uri: locator.uri(),
            reason: format!("no unpack support for protocol '{other}'"),
        }),
    }
}

async fn unpack_zip(
    event: &FileEvent,
    config: &UnpackConfig,
) -> Result<Vec<FileEvent>, EventError> {
    let uri = event.locator.uri();

    // Remote containers are staged for listing only; the child locators
    // still address the members inside the remote archive.
    let (path, _staged) = match container_source(&event.locator)? {
        ContainerSource::Local(path) => (path, None),
        ContainerSource::S3 {
            bucket_path,
            options,
        } => {
            let staged = NamedTempFile::new().map_err(|e| unpack_error(&uri, e))?;
            download_s3(&bucket_path, &options, staged.path())
                .await
                .map_err(|reason| unpack_error(&uri, reason))?;
            (staged.path().to_path_buf(), Some(staged))
        }
    };

    let members = list_zip_members(path)
        .await
        .map_err(|reason| unpack_error(&uri, reason))?;

    let mut children = Vec::with_capacity(members.len());
    for member in members {
        let locator = ResourceLocator::archive_member(&event.locator, "zip", &member)?;
        let mut child = FileEvent::new(locator, event.metadata.clone());
        if config.include_dir_in_uid {
            child = child.with_uid(format!("{}/{member}", event.uid()));
        }
        children.push(child);
    }
    Ok(children)
}

async fn list_zip_members(path: PathBuf) -> Result<Vec<String>, String> {
    tokio::task::spawn_blocking(move || -> Result<Vec<String>, String> {
        let file = std::fs::File::open(&path).map_err(|e| e.to_string())?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
        // by_index preserves archive order; file_names() does not.
        let mut names = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let entry = archive.by_index(index).map_err(|e| e.to_string())?;
            if !entry.is_dir() {
                names.push(entry.name().to_string());
            }
        }
        Ok(names)
    })
    .await
    .map_err(|e| e.to_string())?
}

async fn unpack_directory(
    event: &FileEvent,
    config: &UnpackConfig,
) -> Result<Vec<FileEvent>, EventError> {
    let uri = event.locator.uri();
    if event.locator.filesystem().is_some() {
        return Err(unpack_error(&uri, "remote directory containers cannot be listed"));
    }
    let root = PathBuf::from(event.locator.path());
    if !root.is_dir() {
        return Err(unpack_error(&uri, "not a directory"));
    }

    let mut files = Vec::new();
    let mut pending = vec![root.clone()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| unpack_error(&uri, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| unpack_error(&uri, e))? {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();

    let mut children = Vec::with_capacity(files.len());
    for path in files {
        let mut child = FileEvent::new(ResourceLocator::local(&path), event.metadata.clone());
        if config.include_dir_in_uid {
            if let Ok(relative) = path.strip_prefix(&root) {
                child = child.with_uid(format!(
                    "{}/{}",
                    event.uid(),
                    relative.to_string_lossy()
                ));
            }
        }
        children.push(child);
    }
    Ok(children)
}
