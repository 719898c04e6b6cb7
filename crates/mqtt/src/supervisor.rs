//! Presence announcements on `{base_topic}/status`.
//!
//! The supervisor publishes a retained `online` every time the kernel reports
//! `Connected`, and a retained `offline` on graceful shutdown. An ungraceful
//! exit is covered by the last will registered in the CONNECT packet.

use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ack::AckTracker, error::TransferError, state::ConnectionState};

#[derive(Debug, Clone)]
pub struct Supervisor {
    state_rx: watch::Receiver<ConnectionState>,
    status_topic: String,
    client: AsyncClient,
    acks: AckTracker,
    ack_timeout: Duration,
    cancel_token: CancellationToken,
}

impl Supervisor {
    pub fn new(
        status_topic: impl Into<String>,
        state_rx: watch::Receiver<ConnectionState>,
        client: AsyncClient,
        acks: AckTracker,
        ack_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            status_topic: status_topic.into(),
            state_rx,
            client,
            acks,
            ack_timeout,
            cancel_token,
        }
    }

    /// Publishes a retained presence value and waits for the broker to take it.
    pub async fn publish_status(&self, status: &str) -> Result<(), TransferError> {
        let pending = self.acks.publish(
            &self.client,
            self.status_topic.clone(),
            QoS::AtLeastOnce,
            true,
            status.as_bytes().to_vec(),
        )?;

        tokio::time::timeout(self.ack_timeout, pending.wait())
            .await
            .map_err(|_| TransferError::AckTimeout(self.ack_timeout))??;

        info!("Published {status} status to {}", self.status_topic);
        Ok(())
    }

    async fn on_connect(&self) {
        if let Err(e) = self.publish_status("online").await {
            warn!("Failed to publish online status: {e}");
        }
    }

    /// Spawns the monitoring task and returns immediately.
    pub fn monitor(&self) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor.run_monitor_loop().await;
        });
    }

    async fn run_monitor_loop(&self) {
        let mut state_rx = self.state_rx.clone();
        info!("Supervisor monitoring started");

        if state_rx.borrow_and_update().is_connected() {
            self.on_connect().await;
        }

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    debug!("Supervisor shutting down due to cancellation");
                    break;
                }

                changed = state_rx.changed() => {
                    if changed.is_err() {
                        debug!("State channel closed, supervisor exiting");
                        break;
                    }

                    let state = state_rx.borrow_and_update().clone();
                    match state {
                        ConnectionState::Connected => self.on_connect().await,
                        ConnectionState::Disconnected(reason) => {
                            warn!("Disconnected from broker: {reason}");
                        }
                        ConnectionState::Failed(reason) => {
                            warn!("Connection failed permanently: {reason}");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        info!("Supervisor monitoring stopped");
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn status_topic(&self) -> &str {
        &self.status_topic
    }
}
