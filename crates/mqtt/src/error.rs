//! Error type shared by every fallible operation in the transport crate.
//!
//! Setup errors (`InvalidMetadata`, `ClientSetup`, `ConfigError`, `Io`) surface
//! at startup. Runtime errors (`ClientTransfer`, `ClientConnection`,
//! `AckTimeout`, `NotAcknowledged`, `Closed`) are transient from the caller's
//! point of view and are expected to be retried one layer up.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// Endpoint metadata is unusable (QoS outside 0..=2, empty topic).
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// The client could not be constructed, usually a TLS file problem.
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// The connection kernel failed or never reached the broker.
    #[error("Connection kernel error: {0}")]
    ConnectionKernel(String),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The request could not be handed to the event loop (channel full or closed).
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// The reconnect budget is spent.
    #[error("Retry policy error: {0}")]
    RetriesPolicy(#[from] super::backoff::BackoffError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The broker did not acknowledge the publish in time.
    #[error("Broker did not acknowledge publish within {0:?}")]
    AckTimeout(Duration),

    /// The connection dropped while the publish was waiting for its acknowledgement.
    #[error("Publish not acknowledged: {0}")]
    NotAcknowledged(String),

    /// The connection kernel has stopped; nothing more can be published.
    #[error("Transport closed")]
    Closed,
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_error_display() {
        let err = TransferError::InvalidMetadata("QoS must be 0-2".into());
        assert_eq!(err.to_string(), "Invalid metadata: QoS must be 0-2");

        let err = TransferError::AckTimeout(Duration::from_secs(5));
        assert_eq!(
            err.to_string(),
            "Broker did not acknowledge publish within 5s"
        );
    }

    #[test]
    fn test_transfer_error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let transfer_err: TransferError = io_err.into();
        assert!(matches!(transfer_err, TransferError::Io(_)));
        assert!(transfer_err.to_string().contains("file not found"));
    }

    #[test]
    fn test_transfer_error_from_connection_error_is_boxed() {
        let err: TransferError = rumqttc::ConnectionError::NetworkTimeout.into();
        assert!(matches!(err, TransferError::ClientConnection(_)));
    }

    #[test]
    fn test_transfer_error_is_std_error() {
        let err: Box<dyn std::error::Error> = Box::new(TransferError::Closed);
        assert_eq!(err.to_string(), "Transport closed");
    }
}
