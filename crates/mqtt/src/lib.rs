//! # weatherbee_mqtt: acknowledged MQTT publishing with automatic reconnection
//!
//! Built on `rumqttc`, this crate adds what a long-running telemetry device
//! needs from its broker connection:
//!
//! - **Automatic reconnection** with exponential backoff and fatal-error detection
//! - **Broker acknowledgements**: a publish resolves on PUBACK/PUBCOMP, not on enqueue
//! - **State monitoring** through a `watch` channel
//! - **Presence**: retained `online`/`offline` on `{base_topic}/status`, plus a last will
//! - **TLS** with optional client certificates, and username/password credentials
//!
//! # Quick Start
//!
//! ```ignore
//! use weatherbee_mqtt::{Config, ConnectionState, EndpointMetadata, MqttManager};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config {
//!         host: "mqtt.example.com".into(),
//!         ..Default::default()
//!     };
//!     let instance = MqttManager::from_config(config)?.build_and_start()?;
//!     instance.start_monitoring();
//!     instance
//!         .state_receiver()
//!         .wait_for(ConnectionState::is_connected)
//!         .await?;
//!
//!     let endpoint = EndpointMetadata::new("readings", 1, false);
//!     let pkid = instance
//!         .publisher()
//!         .publish(br#"{"temperature":21.5}"#.to_vec(), &endpoint)
//!         .await?;
//!     println!("acknowledged as packet {pkid}");
//!
//!     instance.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Connection Lifecycle
//!
//! ```text
//! Connecting ──(CONNACK)──> Connected
//!      ▲                        │
//!      │                 (network error)
//!      │                        ▼
//!      └──(delay)── Reconnecting(secs) <── Disconnected(reason)
//!
//! fatal error / reconnect budget spent ──> Failed(reason)
//! ```
//!
//! # Delivery Semantics
//!
//! A publish that times out or loses its connection before the
//! acknowledgement fails, but the broker may still have received it. Callers
//! that retry on failure therefore get at-least-once delivery.

pub mod ack;
pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod publisher;
pub mod state;
pub mod supervisor;

pub use ack::{AckTracker, PendingAck};
pub use backoff::{Backoff, BackoffError};
pub use client::ClientBuilder;
pub use config::{Config, EndpointMetadata, TlsConfig};
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager, PublishDrain};
pub use publisher::Publisher;
pub use state::ConnectionState;
pub use supervisor::Supervisor;

/// Alias for `std::result::Result<T, TransferError>`.
pub type Result<T> = std::result::Result<T, TransferError>;
