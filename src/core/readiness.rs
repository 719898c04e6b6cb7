//! Readiness state management for the application.
//!
//! Readiness is the application's view of whether the broker connection is
//! usable. The entry point waits for `Ready` before sampling starts; a
//! `Failed` state or a timeout aborts startup.

use std::{fmt, time::Duration};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use weatherbee_mqtt::ConnectionState;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Ready,
    /// Not ready yet, with the reason.
    NotReadyYet(String),
    /// The broker connection gave up and will not recover.
    Failed(String),
    Unknown,
}

impl ReadinessState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessState::Ready)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ReadinessState::Failed(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            ReadinessState::Ready => "Ready",
            ReadinessState::NotReadyYet(_) => "NotReadyYet",
            ReadinessState::Failed(_) => "Failed",
            ReadinessState::Unknown => "Unknown",
        }
    }

    /// Empty unless the state carries a reason.
    pub fn reason(&self) -> &str {
        match self {
            ReadinessState::NotReadyYet(reason) | ReadinessState::Failed(reason) => reason,
            _ => "",
        }
    }
}

impl fmt::Display for ReadinessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessState::Ready | ReadinessState::Unknown => f.write_str(self.as_str()),
            _ => write!(f, "{}: {}", self.as_str(), self.reason()),
        }
    }
}

impl From<&ConnectionState> for ReadinessState {
    fn from(state: &ConnectionState) -> Self {
        match state {
            ConnectionState::Connected => ReadinessState::Ready,
            ConnectionState::Connecting => ReadinessState::NotReadyYet("Connecting...".to_string()),
            ConnectionState::Disconnected(reason) => {
                ReadinessState::NotReadyYet(format!("Disconnected: {reason}"))
            }
            ConnectionState::Reconnecting(secs) => {
                ReadinessState::NotReadyYet(format!("Reconnecting in {secs:.1} sec"))
            }
            ConnectionState::Failed(reason) => ReadinessState::Failed(reason.clone()),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("Not ready within {0:?}")]
    Timeout(Duration),

    #[error("Broker connection failed: {0}")]
    Failed(String),

    #[error("Readiness source closed")]
    Closed,
}

/// Shared readiness tracker; clones observe the same state.
#[derive(Debug, Clone)]
pub struct Readiness {
    state_tx: watch::Sender<ReadinessState>,
    state_rx: watch::Receiver<ReadinessState>,
}

impl Readiness {
    pub fn new() -> Self {
        let (state_tx, state_rx) = watch::channel(ReadinessState::Unknown);
        Self { state_tx, state_rx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ReadinessState {
        self.state_rx.borrow().clone()
    }

    /// Mirrors broker connection state into readiness on a background task.
    /// The task ends when the connection state sender is dropped.
    pub fn start_listening(&self, mut connection_rx: watch::Receiver<ConnectionState>) {
        let readiness = self.clone();
        tokio::spawn(async move {
            let initial = ReadinessState::from(&*connection_rx.borrow_and_update());
            readiness.set_state(initial);

            while connection_rx.changed().await.is_ok() {
                let next = ReadinessState::from(&*connection_rx.borrow_and_update());
                readiness.set_state(next);
            }
            debug!("ConnectionState channel closed, listening stopped");
        });
    }

    pub fn set_state(&self, state: ReadinessState) {
        let old_state = self.state_rx.borrow().clone();
        if old_state == state {
            return;
        }
        let _ = self.state_tx.send(state.clone());
        debug!("The readiness status has changed: {} -> {}", old_state, state);
    }

    /// Waits until the state is `Ready`.
    ///
    /// # Errors
    ///
    /// `Failed` if the connection gave up, `Timeout` if `timeout` elapsed first.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<(), ReadinessError> {
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                match state {
                    ReadinessState::Ready => return Ok(()),
                    ReadinessState::Failed(reason) => return Err(ReadinessError::Failed(reason)),
                    other => debug!("Waiting for readiness, current: {}", other),
                }
                if rx.changed().await.is_err() {
                    return Err(ReadinessError::Closed);
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(())) => {
                info!("System is ready");
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(
                    "Not ready after {:?}, last state: {}",
                    timeout,
                    self.current_state()
                );
                Err(ReadinessError::Timeout(timeout))
            }
        }
    }
}

impl Default for Readiness {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_state_queries() {
        assert!(ReadinessState::Ready.is_ready());
        assert!(!ReadinessState::Unknown.is_ready());
        assert!(ReadinessState::Failed("bad auth".into()).is_failed());
        assert_eq!(ReadinessState::Failed("bad auth".into()).reason(), "bad auth");
        assert_eq!(ReadinessState::Ready.reason(), "");
    }

    #[test]
    fn test_readiness_state_display() {
        assert_eq!(ReadinessState::Ready.to_string(), "Ready");
        assert_eq!(
            ReadinessState::NotReadyYet("Connecting...".into()).to_string(),
            "NotReadyYet: Connecting..."
        );
    }

    #[test]
    fn test_connection_state_mapping() {
        assert_eq!(
            ReadinessState::from(&ConnectionState::Connected),
            ReadinessState::Ready
        );
        assert_eq!(
            ReadinessState::from(&ConnectionState::Reconnecting(2.0)),
            ReadinessState::NotReadyYet("Reconnecting in 2.0 sec".into())
        );
        assert_eq!(
            ReadinessState::from(&ConnectionState::Failed("not authorized".into())),
            ReadinessState::Failed("not authorized".into())
        );
    }

    #[tokio::test]
    async fn test_readiness_multiple_subscribers() {
        let readiness = Readiness::new();
        let mut rx1 = readiness.subscribe();
        let mut rx2 = readiness.subscribe();
        readiness.set_state(ReadinessState::Ready);
        rx1.changed().await.unwrap();
        rx2.changed().await.unwrap();
        assert_eq!(*rx1.borrow(), ReadinessState::Ready);
        assert_eq!(*rx2.borrow(), ReadinessState::Ready);
    }

    #[tokio::test]
    async fn test_listener_follows_connection() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let readiness = Readiness::new();
        readiness.start_listening(rx);

        let waiter = {
            let readiness = readiness.clone();
            tokio::spawn(async move { readiness.wait_ready(Duration::from_secs(5)).await })
        };
        tx.send(ConnectionState::Connected).unwrap();

        assert_eq!(waiter.await.unwrap(), Ok(()));
        assert!(readiness.current_state().is_ready());
    }

    #[tokio::test]
    async fn test_wait_ready_fails_fast() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let readiness = Readiness::new();
        readiness.start_listening(rx);
        tx.send(ConnectionState::Failed("bad credentials".into()))
            .unwrap();

        assert_eq!(
            readiness.wait_ready(Duration::from_secs(5)).await,
            Err(ReadinessError::Failed("bad credentials".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_times_out() {
        let readiness = Readiness::new();
        readiness.set_state(ReadinessState::NotReadyYet("Connecting...".into()));

        assert_eq!(
            readiness.wait_ready(Duration::from_secs(3)).await,
            Err(ReadinessError::Timeout(Duration::from_secs(3)))
        );
    }
}
