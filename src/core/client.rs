//! The seam between the delivery pipeline and the broker transport.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;
use weatherbee_mqtt::{EndpointMetadata, Publisher, TransferError};

use super::encoder::Payload;

/// Identifier assigned to a message once the broker accepted it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Any failure to get a payload acknowledged.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Transport error: {0}")]
    Transport(TransferError),

    /// The connection is gone for good.
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    /// The message itself is unusable, e.g. an invalid topic or QoS.
    #[error("Broker rejected the message: {0}")]
    Rejected(String),
}

impl From<TransferError> for PublishError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::InvalidMetadata(reason) => PublishError::Rejected(reason),
            TransferError::Closed => PublishError::Unavailable(err.to_string()),
            other => PublishError::Transport(other),
        }
    }
}

/// One publish, one acknowledgement. No retries and no local state.
#[async_trait]
pub trait PublishClient: Send + Sync {
    async fn publish(&self, payload: &Payload) -> Result<MessageId, PublishError>;
}

/// Publishes to a fixed MQTT endpoint and waits for the broker acknowledgement.
#[derive(Debug, Clone)]
pub struct MqttPublishClient {
    publisher: Publisher,
    endpoint: EndpointMetadata,
}

impl MqttPublishClient {
    pub fn new(publisher: Publisher, endpoint: EndpointMetadata) -> Self {
        Self {
            publisher,
            endpoint,
        }
    }

    /// Topic including the base topic prefix.
    pub fn topic(&self) -> String {
        self.publisher.with_base_topic(&self.endpoint.topic)
    }
}

#[async_trait]
impl PublishClient for MqttPublishClient {
    async fn publish(&self, payload: &Payload) -> Result<MessageId, PublishError> {
        let pkid = self
            .publisher
            .publish(payload.as_bytes().to_vec(), &self.endpoint)
            .await?;
        trace!("Payload #{} acknowledged as packet {}", payload.sequence(), pkid);

        // Packet ids are recycled by the broker session, the sequence is not.
        Ok(MessageId::new(format!("{}/{}", payload.sequence(), pkid)))
    }
}
