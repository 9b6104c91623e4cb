//! The backend source contract and the backend registry.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backends::local::LocalWatchSource;
use crate::backends::minio::MinioNotificationSource;
use crate::backends::s3::S3PollSource;
use crate::config::FsConfig;
use crate::error::SourceError;
use crate::event::FileEvent;

/// A producer of an unbounded sequence of [`FileEvent`]s.
///
/// Implementations feed the bounded channel until it closes or the shutdown
/// token fires; both are observable at every suspension point. The sequence
/// is not restartable: running a source again starts observation from "now",
/// not from history.
///
/// A closed channel (receiver dropped) is a normal stop, not an error.
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn run(
        &self,
        tx: mpsc::Sender<FileEvent>,
        shutdown: CancellationToken,
    ) -> Result<(), SourceError>;
}

/// Look up the source for a validated backend configuration.
///
/// The name-keyed dispatch itself happens at config load time (see
/// [`crate::load_config::REGISTERED_BACKENDS`]); by this point every variant
/// maps to exactly one source.
pub fn source_for_config(fs: &FsConfig) -> Box<dyn EventSource> {
    match fs {
        FsConfig::Local(config) => Box::new(LocalWatchSource::new(config.clone())),
        FsConfig::Minio(config) => Box::new(MinioNotificationSource::new(config.clone())),
        FsConfig::S3(config) => Box::new(S3PollSource::new(config.clone())),
    }
}
