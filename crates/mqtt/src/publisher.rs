//! Acknowledged publishing with base topic support.
//!
//! [`Publisher::publish`] resolves only once the broker confirmed the message
//! (PUBACK for QoS 1, PUBCOMP for QoS 2) or, for QoS 0, once it was written to
//! the socket. Topics are prefixed with the instance's `base_topic`:
//!
//! ```ignore
//! let publisher = instance.publisher();
//! let endpoint = EndpointMetadata::new("readings", 1, false);
//! // With base_topic = "weatherbee", publishes to "weatherbee/readings"
//! let pkid = publisher.publish(br#"{"temperature":21.5}"#.to_vec(), &endpoint).await?;
//! ```

use std::{sync::Arc, time::Duration};

use rumqttc::AsyncClient;
use tracing::debug;

use super::{
    ack::AckTracker,
    config::{join_topic, EndpointMetadata},
    manager::PublishDrain,
    TransferError,
};

#[derive(Debug, Clone)]
pub struct Publisher {
    client: AsyncClient,
    acks: AckTracker,
    base_topic: String,
    ack_timeout: Duration,

    /// Delays connection shutdown until publishes complete.
    publish_drain: Arc<PublishDrain>,
}

impl Publisher {
    pub fn new(
        client: AsyncClient,
        acks: AckTracker,
        base_topic: &str,
        ack_timeout: Duration,
        publish_drain: Arc<PublishDrain>,
    ) -> Self {
        Self {
            client,
            acks,
            base_topic: base_topic.to_string(),
            ack_timeout,
            publish_drain,
        }
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn with_base_topic(&self, topic: &str) -> String {
        join_topic(&self.base_topic, topic)
    }

    /// Publishes `payload` and waits for the broker acknowledgement.
    ///
    /// Returns the packet identifier the broker acknowledged (`0` for QoS 0).
    /// Fails with [`TransferError::AckTimeout`] if no acknowledgement arrives
    /// within the configured timeout; the message may still reach the broker
    /// later, so callers retrying on error get at-least-once delivery.
    pub async fn publish(
        &self,
        payload: impl Into<Vec<u8>>,
        metadata: &EndpointMetadata,
    ) -> Result<u16, TransferError> {
        let _guard = self.publish_drain.enter();

        let qos = metadata.qos_level()?;
        if metadata.topic.is_empty() {
            return Err(TransferError::InvalidMetadata("Topic must not be empty".into()));
        }
        let full_topic = self.with_base_topic(&metadata.topic);
        let payload = payload.into();

        debug!(
            "Publishing {} bytes to '{}' (qos {}, retain {})",
            payload.len(),
            full_topic,
            metadata.qos,
            metadata.retain,
        );

        let pending = self
            .acks
            .publish(&self.client, full_topic, qos, metadata.retain, payload)?;

        tokio::time::timeout(self.ack_timeout, pending.wait())
            .await
            .map_err(|_| TransferError::AckTimeout(self.ack_timeout))?
    }
}
