//! Watch-based source for locally accessible directories.
//!
//! Uses OS-level events (inotify and friends) by default, or directory
//! polling for filesystems without reliable events. Only events that mark a
//! file as complete are forwarded: close-write and move-in for the os
//! observer, creation and move-in for the polling observer. Directory events
//! and partial writes are filtered out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RenameMode};
use notify::{PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LocalFsConfig, ObserverKind};
use crate::error::SourceError;
use crate::event::{metadata_from_pattern, FileEvent, Metadata};
use crate::locator::{FsDescriptor, ResourceLocator};
use crate::source::EventSource;

const RAW_EVENT_QUEUE: usize = 1024;
const POLL_OBSERVER_INTERVAL: Duration = Duration::from_secs(1);

pub struct LocalWatchSource {
    config: LocalFsConfig,
}

impl LocalWatchSource {
    pub fn new(config: LocalFsConfig) -> Self {
        Self { config }
    }

    /// Convert one accepted filesystem path into an event, or `None` when
    /// the name does not match the configured pattern.
    fn event_for_path(&self, path: &Path) -> Result<Option<FileEvent>, SourceError> {
        let name = match path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return Ok(None),
        };

        let metadata = match &self.config.file_pattern {
            Some(pattern) => match metadata_from_pattern(pattern, &name) {
                Some(metadata) => metadata,
                None => {
                    debug!(file = %name, "Skipping file not matching pattern");
                    return Ok(None);
                }
            },
            None => Metadata::new(),
        };

        let locator = match &self.config.protocol {
            Some(protocol) => {
                // Validated at config load; a secret here would repeat on
                // every event, so it is fatal rather than per-event.
                let descriptor =
                    FsDescriptor::checked(protocol, self.config.storage_options.clone())
                        .map_err(|e| SourceError::Fatal(e.to_string()))?;
                ResourceLocator::remote(descriptor, path.to_string_lossy().into_owned())
            }
            None => ResourceLocator::local(path),
        };

        Ok(Some(FileEvent::new(locator, metadata)))
    }
}

#[async_trait]
impl EventSource for LocalWatchSource {
    async fn run(
        &self,
        tx: mpsc::Sender<FileEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError> {
        let (raw_tx, mut raw_rx) = mpsc::channel::<notify::Result<notify::Event>>(RAW_EVENT_QUEUE);
        let handler = move |result: notify::Result<notify::Event>| {
            // Runs on the watcher's own thread; a full queue blocks that
            // thread, not the async loop.
            let _ = raw_tx.blocking_send(result);
        };

        let mut watcher: Box<dyn Watcher + Send> = match self.config.observer {
            ObserverKind::Os => Box::new(
                RecommendedWatcher::new(handler, notify::Config::default())
                    .map_err(|e| SourceError::Fatal(format!("failed to create watcher: {e}")))?,
            ),
            ObserverKind::Polling => Box::new(
                PollWatcher::new(
                    handler,
                    notify::Config::default().with_poll_interval(POLL_OBSERVER_INTERVAL),
                )
                .map_err(|e| SourceError::Fatal(format!("failed to create watcher: {e}")))?,
            ),
        };

        watcher
            .watch(&self.config.directory, RecursiveMode::NonRecursive)
            .map_err(|e| {
                SourceError::Fatal(format!(
                    "cannot watch '{}': {e}",
                    self.config.directory.display()
                ))
            })?;
        info!(directory = %self.config.directory.display(), "Started watch on directory");

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = raw_rx.recv() => match received {
                    Some(result) => result,
                    None => break,
                },
            };

            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "Watch backend reported an error, skipping");
                    continue;
                }
            };

            if !accepted_kind(self.config.observer, &raw.kind) {
                continue;
            }
            let Some(path) = final_path(&raw) else {
                continue;
            };
            // Directory-only events never describe a publishable object.
            if !path.is_file() {
                continue;
            }

            if let Some(event) = self.event_for_path(&path)? {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        }

        info!(directory = %self.config.directory.display(), "Stopped watch on directory");
        Ok(())
    }
}

/// Which raw event kinds mark a file as complete, per observer.
///
/// The os observer waits for close-write so half-written files are never
/// published; the polling observer has no close notion and takes creations.
fn accepted_kind(observer: ObserverKind, kind: &EventKind) -> bool {
    match observer {
        ObserverKind::Os => matches!(
            kind,
            EventKind::Access(AccessKind::Close(AccessMode::Write))
                | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
        ),
        ObserverKind::Polling => matches!(
            kind,
            EventKind::Create(_)
                | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
        ),
    }
}

/// The path the event settles on: the destination for renames, the single
/// path otherwise.
fn final_path(event: &notify::Event) -> Option<PathBuf> {
    event.paths.last().cloned()
}
