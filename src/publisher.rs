//! The publisher contract and the bundled HTTP adapter.
//!
//! The pipeline takes its publisher by injection and never constructs one
//! itself, so embedders can plug in their own transport. The bundled adapter
//! posts each message as JSON to a configured endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

use crate::error::{ConfigError, PublishError};
use crate::message::OutboundMessage;

/// Delivers assembled messages. One call per message; delivery errors are
/// terminal for that message and reported back, never retried here.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError>;
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpPublisherConfig {
    endpoint: String,
    /// Identifies this watcher to the receiving side.
    name: String,
}

/// Posts each message as a JSON body to a fixed endpoint.
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: String,
    name: String,
}

impl HttpPublisher {
    /// Build the adapter from the opaque `publisher_config` section.
    pub fn from_config(config: &serde_yaml::Value) -> Result<Self, ConfigError> {
        let config: HttpPublisherConfig =
            serde_yaml::from_value(config.clone()).map_err(|e| ConfigError::Invalid {
                section: "publisher_config",
                reason: e.to_string(),
            })?;
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: config.endpoint,
            name: config.name,
        })
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        self.client
            .post(&self.endpoint)
            .header("x-publisher-name", &self.name)
            .json(message)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| PublishError(e.to_string()))?;
        debug!(message_id = %message.message_id, subject = %message.subject, "Published message");
        Ok(())
    }
}
