//! Broker connection state as published by the connection kernel.
//!
//! Observers subscribe through a `watch` channel; the kernel only sends a new
//! value when the state actually changes.

use std::fmt;

/// Lifecycle of the broker connection.
///
/// ```text
/// Connecting -> Connected -> Disconnected -> Reconnecting -> Connected ...
///      \______________________________________________/
///                             |
///                          Failed   (fatal error or reconnect budget spent)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// CONNECT sent, waiting for CONNACK.
    Connecting,

    /// CONNACK accepted; publishes can be acknowledged.
    Connected,

    /// The link dropped. Carries the reason. The kernel will retry.
    Disconnected(String),

    /// Waiting out a backoff delay, in seconds, before the next attempt.
    Reconnecting(f64),

    /// The kernel gave up. Carries the reason. Terminal.
    Failed(String),
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
            ConnectionState::Failed(_) => "Failed",
        }
    }

    /// Reason or delay attached to the state; empty for the plain states.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Connecting | ConnectionState::Connected => String::new(),
            ConnectionState::Disconnected(reason) | ConnectionState::Failed(reason) => {
                reason.clone()
            }
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }

    /// True once the kernel has stopped for good.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
