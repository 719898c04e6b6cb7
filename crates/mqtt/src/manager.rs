//! Entry point: wires the client, kernel, supervisor and ack tracker together.
//!
//! ```ignore
//! let instance = MqttManager::from_config(config)?.build_and_start()?;
//! instance.start_monitoring();
//! let mut state_rx = instance.state_receiver();
//! state_rx.wait_for(ConnectionState::is_connected).await?;
//!
//! let publisher = instance.publisher();
//! publisher.publish(payload, &endpoint).await?;
//!
//! instance.shutdown().await?;
//! ```
//!
//! Shutdown is two-phase: [`MqttInstance::shutdown`] announces `offline`,
//! then waits for in-flight publishes to drain before the connection kernel
//! is cancelled.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rumqttc::AsyncClient;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use validator::Validate;

use super::{
    ack::AckTracker, client::ClientBuilder, config::Config, connection::ConnectionKernel,
    error::TransferError, publisher::Publisher, state::ConnectionState, supervisor::Supervisor,
};

/// Counts publishes in progress so shutdown can wait for them.
#[derive(Debug, Default)]
pub struct PublishDrain {
    inflight: AtomicUsize,
    notify: Notify,
}

impl PublishDrain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(self: &Arc<Self>) -> PublishGuard {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        PublishGuard {
            drain: self.clone(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.notify.notified();
            if self.inflight() == 0 {
                return;
            }
            notified.await;
        }
    }
}

pub struct PublishGuard {
    drain: Arc<PublishDrain>,
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        if self.drain.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drain.notify.notify_waiters();
        }
    }
}

pub struct MqttManager {
    config: Config,
    cancel_token: CancellationToken,
}

impl MqttManager {
    /// Validates `config`; nothing connects until [`MqttManager::build_and_start`].
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            config,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Builds the client and spawns the connection kernel.
    ///
    /// Returns as soon as the kernel task is running; watch
    /// [`MqttInstance::state_receiver`] for the first CONNACK.
    /// Must be called inside a tokio runtime.
    pub fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        info!(
            "Building MQTT infrastructure for {}:{} with base_topic: '{}'",
            self.config.host, self.config.port, self.config.base_topic
        );

        let (client, event_loop) = ClientBuilder::from_config(&self.config)?.build()?;
        let acks = AckTracker::new();

        // Stops the kernel; fires only after the publish drain.
        let connection_cancel = CancellationToken::new();
        let mut connection_kernel = ConnectionKernel::new(
            client.clone(),
            event_loop,
            acks.clone(),
            connection_cancel.clone(),
        )
        .with_reconnect_policy(&self.config);
        let publish_drain = Arc::new(PublishDrain::new());
        let state_rx = connection_kernel.subscribe_state();

        let supervisor = Supervisor::new(
            self.config.status_topic(),
            state_rx,
            client.clone(),
            acks.clone(),
            self.config.ack_timeout(),
            self.cancel_token.clone(),
        );

        tokio::spawn(async move {
            if let Err(e) = connection_kernel.run().await {
                error!("MQTT connection kernel exited with error: {e}");
            }
        });

        {
            let shutdown_request = self.cancel_token.clone();
            let drain = publish_drain.clone();
            let conn_cancel = connection_cancel.clone();
            tokio::spawn(async move {
                shutdown_request.cancelled().await;
                drain.wait_idle().await;
                conn_cancel.cancel();
            });
        }

        info!("MQTT infrastructure built successfully");
        Ok(MqttInstance {
            client,
            supervisor,
            acks,
            cancel_token: self.cancel_token,
            connection_cancel,
            publish_drain,
            config: self.config,
        })
    }
}

/// A running connection. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MqttInstance {
    client: AsyncClient,
    supervisor: Supervisor,
    acks: AckTracker,
    cancel_token: CancellationToken,
    connection_cancel: CancellationToken,
    publish_drain: Arc<PublishDrain>,
    config: Config,
}

impl MqttInstance {
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.supervisor.state_receiver()
    }

    /// A publisher sharing this instance's connection and drain barrier.
    pub fn publisher(&self) -> Publisher {
        Publisher::new(
            self.client.clone(),
            self.acks.clone(),
            &self.config.base_topic,
            self.config.ack_timeout(),
            self.publish_drain.clone(),
        )
    }

    /// Starts the presence supervisor in the background.
    pub fn start_monitoring(&self) {
        self.supervisor.monitor();
    }

    /// Announces `offline`, waits for in-flight publishes, then stops the kernel.
    pub async fn shutdown(&self) -> Result<(), TransferError> {
        if self.state_receiver().borrow().is_connected() {
            if let Err(e) = self.supervisor.publish_status("offline").await {
                warn!("Failed to publish offline status: {e}");
            }
        }

        self.cancel_token.cancel();
        self.publish_drain.wait_idle().await;
        self.connection_cancel.cancel();
        Ok(())
    }
}
