//! Connection kernel: drives the `rumqttc` event loop.
//!
//! ```text
//! Publisher / Supervisor ──(AckTracker)──> AsyncClient ──channel──> EventLoop
//!                                                                      │
//!                              ConnectionKernel::run polls ────────────┘
//!                              ├─ ConnAck          -> Connected, reset backoff
//!                              ├─ Outgoing publish -> AckTracker::on_outgoing_publish
//!                              ├─ PubAck / PubComp -> AckTracker::on_ack
//!                              ├─ transient error  -> Disconnected, backoff, Reconnecting
//!                              └─ fatal error      -> Failed, AckTracker::close
//! ```

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{
    ack::AckTracker, backoff::Backoff, config::Config, error::TransferError,
    state::ConnectionState,
};

/// Owns the event loop. Runs on a single task; everything else talks to it
/// through the client handle, the ack tracker and the state channel.
pub struct ConnectionKernel {
    client: AsyncClient,
    event_loop: EventLoop,
    is_connected: Arc<AtomicBool>,
    backoff: Mutex<Backoff>,
    acks: AckTracker,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionKernel {
    pub fn new(
        client: AsyncClient,
        event_loop: EventLoop,
        acks: AckTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        Self {
            client,
            event_loop,
            is_connected: Arc::new(AtomicBool::new(false)),
            backoff: Mutex::new(Backoff::default()),
            acks,
            cancel,
            state_tx,
            state_rx,
        }
    }

    /// Uses the reconnect schedule from `config` instead of the default.
    pub fn with_reconnect_policy(mut self, config: &Config) -> Self {
        let backoff = Backoff::new(
            Duration::from_secs(config.reconnect_delay),
            Duration::from_secs(config.reconnect_max_delay),
            config.reconnect_backoff_multiplier,
        )
        .with_max_attempts(config.max_reconnect_attempts);
        self.backoff = Mutex::new(backoff);
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });

        if changed {
            info!("Connection state changed to: {state}");
        }
    }

    /// Runs until cancelled, a fatal error, or the reconnect budget is spent.
    ///
    /// On any exit the ack tracker is closed, so pending publishes fail
    /// instead of waiting for their timeout.
    pub async fn run(&mut self) -> Result<(), TransferError> {
        self.update_state(ConnectionState::Connecting);
        self.backoff.lock().await.reset();

        info!("Starting connection event loop...");
        let result = self.drive().await;

        self.is_connected.store(false, Ordering::Release);
        match &result {
            Ok(()) => {
                self.acks.close("connection kernel stopped");
                info!("Connection kernel shutdown completed");
            }
            Err(e) => {
                self.acks.close(&e.to_string());
                self.update_state(ConnectionState::Failed(e.to_string()));
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<(), TransferError> {
        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, disconnecting from broker");
                    self.disconnect().await;
                    return Ok(());
                }

                event_result = self.event_loop.poll() => {
                    match event_result {
                        Ok(event) => self.handle_event(event),
                        Err(e) => {
                            let reason = get_error_message(&e);
                            self.is_connected.store(false, Ordering::Release);
                            self.acks.on_connection_lost(&reason);

                            if is_fatal_error(&e) {
                                error!("Fatal connection error, giving up: {reason}");
                                debug!("Fatal connection error detail: {e:?}");
                                return Err(TransferError::from(e));
                            }

                            self.update_state(ConnectionState::Disconnected(reason.clone()));
                            let sleep_duration = match self.backoff.lock().await.next_sleep() {
                                Ok(sleep_duration) => sleep_duration,
                                Err(backoff_err) => {
                                    error!("Maximum reconnect attempts exceeded: {backoff_err}");
                                    return Err(backoff_err.into());
                                }
                            };

                            warn!(
                                "Reconnecting in {:.2} seconds due to error: {reason}",
                                sleep_duration.as_secs_f64(),
                            );
                            self.update_state(ConnectionState::Reconnecting(sleep_duration.as_secs_f64()));

                            tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    info!("Shutdown requested while waiting to reconnect");
                                    return Ok(());
                                }
                                _ = tokio::time::sleep(sleep_duration) => {
                                    self.update_state(ConnectionState::Connecting);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(packet) => match packet {
                Packet::ConnAck(conn_ack) => {
                    if conn_ack.code == ConnectReturnCode::Success {
                        info!("Connection established successfully.");
                        self.is_connected.store(true, Ordering::Release);
                        self.update_state(ConnectionState::Connected);
                        if let Ok(mut backoff) = self.backoff.try_lock() {
                            backoff.reset();
                        }
                    }
                }
                Packet::PubAck(ack) => self.acks.on_ack(ack.pkid),
                Packet::PubComp(comp) => self.acks.on_ack(comp.pkid),
                Packet::PingResp | Packet::PingReq => {}
                Packet::Disconnect => {
                    warn!("Disconnected by broker");
                    self.is_connected.store(false, Ordering::Release);
                    self.update_state(ConnectionState::Disconnected(
                        "Disconnected by broker".into(),
                    ));
                }
                other => trace!("Incoming packet: {other:?}"),
            },
            Event::Outgoing(Outgoing::Publish(pkid)) => {
                trace!("Outgoing publish, pkid {pkid}");
                self.acks.on_outgoing_publish(pkid);
            }
            Event::Outgoing(outgoing) => trace!("Outgoing packet: {outgoing:?}"),
        }
    }

    /// Best effort; the socket closes either way.
    async fn disconnect(&mut self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Could not queue DISCONNECT: {e}");
            return;
        }
        // Give the event loop a chance to flush the DISCONNECT packet.
        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), flush).await.is_err() {
            debug!("DISCONNECT not flushed within 1s");
        }
    }

    /// Lock-free view of the connection for other tasks.
    pub fn is_connected(&self) -> Arc<AtomicBool> {
        self.is_connected.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Fatal,
    Reconnect,
}

fn classify_connection_error(err: &ConnectionError) -> Disposition {
    use Disposition::*;

    match err {
        ConnectionError::Tls(_) => Fatal,
        ConnectionError::MqttState(_) => Fatal,
        ConnectionError::NotConnAck(_) => Fatal,
        ConnectionError::RequestsDone => Fatal,

        ConnectionError::Io(e) => match e.kind() {
            // Local misconfiguration rather than a network condition
            std::io::ErrorKind::AddrInUse
            | std::io::ErrorKind::PermissionDenied
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::InvalidData => Fatal,
            _ => Reconnect,
        },

        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => Reconnect,

        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion
            | ConnectReturnCode::BadClientId
            | ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized => Fatal,
            _ => Reconnect,
        },

        #[allow(unreachable_patterns)]
        _ => Reconnect,
    }
}

fn is_fatal_error(err: &ConnectionError) -> bool {
    matches!(classify_connection_error(err), Disposition::Fatal)
}

/// Innermost message of an error chain, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
