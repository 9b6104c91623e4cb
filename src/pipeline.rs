//! The watcher pipeline: one source feeding one publisher.
//!
//! Events flow through a bounded channel; a slow publisher therefore
//! backpressures the source instead of growing an unbounded queue. Event
//! failures are logged and counted, never fatal. The watcher itself only
//! terminates on shutdown, on a closed source, or on a fatal source error.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::WatcherConfig;
use crate::error::{EventError, SourceError, WatcherError};
use crate::event::FileEvent;
use crate::message;
use crate::publisher::Publisher;
use crate::secrets;
use crate::source::source_for_config;
use crate::transform;

const EVENT_QUEUE: usize = 16;

/// Counters for one watcher run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WatchReport {
    pub published: u64,
    pub failed: u64,
}

/// Run one watcher until shutdown or a fatal source failure.
pub async fn run_watcher<P: Publisher>(
    config: &WatcherConfig,
    publisher: &P,
    shutdown: CancellationToken,
) -> Result<WatchReport, WatcherError> {
    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE);
    let source = source_for_config(&config.fs);
    let source_shutdown = shutdown.clone();
    let source_task = tokio::spawn(async move { source.run(tx, source_shutdown).await });

    info!(backend = config.fs.backend(), subject = %config.message.subject, "Watcher started");

    let mut report = WatchReport::default();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Some(event) => event,
                None => break,
            },
        };
        handle_event(event, config, publisher, &mut report).await;
    }

    // Closing the channel lets a source blocked on send observe the stop.
    drop(rx);
    match source_task.await {
        Ok(outcome) => outcome?,
        Err(e) => {
            return Err(WatcherError::Source(SourceError::Fatal(format!(
                "source task panicked: {e}"
            ))));
        }
    }

    info!(
        published = report.published,
        failed = report.failed,
        "Watcher stopped"
    );
    Ok(report)
}

/// Carry one detected event through aliasing, transforms, the secret filter,
/// assembly, and publication. Failures drop the affected event (or child)
/// only; siblings still go out.
pub async fn handle_event<P: Publisher>(
    mut event: FileEvent,
    config: &WatcherConfig,
    publisher: &P,
    report: &mut WatchReport,
) {
    message::apply_event_aliases(&mut event, &config.message.aliases);

    let outcome = transform::run_data_config(event, &config.data).await;
    for failure in &outcome.failures {
        report.failed += 1;
        warn!(error = %failure, "Transform dropped an event");
    }

    for child in outcome.events {
        match publish_event(&child, config, publisher).await {
            Ok(()) => report.published += 1,
            Err(EventError::SecretLeak { protocol, field }) => {
                report.failed += 1;
                // Field name and backend only. The value must never reach
                // the log stream either.
                error!(protocol, field, "Blocked event with credential-bearing descriptor");
            }
            Err(e) => {
                report.failed += 1;
                warn!(error = %e, uid = %child.uid(), "Failed to publish event");
            }
        }
    }
}

async fn publish_event<P: Publisher>(
    event: &FileEvent,
    config: &WatcherConfig,
    publisher: &P,
) -> Result<(), EventError> {
    secrets::filter_locator(&event.locator)?;
    let message = message::assemble(event, &config.message)?;
    publisher.publish(&message).await?;
    Ok(())
}
