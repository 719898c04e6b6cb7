//! Configuration for the broker connection and publish endpoints.
//!
//! Every struct derives `serde` for TOML loading and `validator::Validate`, so
//! a bad value fails when the file is loaded instead of when the first
//! publish goes out.
//!
//! # Examples
//!
//! ```toml
//! [transport]
//! base_topic = "weatherbee"
//! host = "mqtt.example.com"
//! port = 8883
//! username = "rasp-bi-00"
//! password = "secret"
//! ack_timeout = 10
//!
//! [transport.tls]
//! ca_cert_path = "/etc/weatherbee/ca.pem"
//! ```

use std::{path::Path, time::Duration};

use rumqttc::QoS;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::TransferError;

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_credentials"))]
pub struct Config {
    /// Prefix applied to every topic this client publishes to, and to the
    /// `{base_topic}/status` presence topic. Empty disables the prefix.
    #[validate(length(max = 255, message = "Base topic must not exceed 255 characters"))]
    pub base_topic: String,

    /// Broker hostname or IP address. Resolved at connect time.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    /// 1883 for plain MQTT, 8883 for MQTT over TLS.
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Seconds the application waits for the first CONNACK before giving up
    /// on startup.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Connection timeout must be between 1 and 300 seconds"
    ))]
    pub connection_timeout: u64,

    /// Ask the broker to drop any previous session state on connect.
    pub clean_session: bool,

    /// Maximum QoS 1/2 publishes awaiting acknowledgement at once.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Client identifier. Empty generates a UUID when the client is built.
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// Broker username. Must be set together with `password`.
    pub username: Option<String>,

    /// Broker password. Must be set together with `username`.
    pub password: Option<String>,

    /// Maximum packet size in bytes, applied in both directions.
    #[validate(range(
        min = 64,
        max = 65535,
        message = "Max packet size must be between 64 and 65535 bytes"
    ))]
    pub max_packet_size: Option<u16>,

    /// Capacity of the request channel between the client handle and the
    /// event loop. A full channel fails a publish instead of blocking.
    #[validate(range(
        min = 1,
        max = 255,
        message = "Request channel capacity must be between 1 and 255"
    ))]
    pub request_channel_capacity: Option<u8>,

    /// Initial reconnect delay in seconds.
    #[validate(range(
        min = 1,
        max = 60,
        message = "Reconnect delay must be between 1 and 60 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Upper bound for the reconnect delay in seconds.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Reconnect max delay must be between 1 and 3600 seconds"
    ))]
    pub reconnect_max_delay: u64,

    /// Reconnect attempts before the kernel gives up. `0` retries forever.
    #[validate(range(
        min = 0,
        max = 100,
        message = "Max reconnect attempts must be between 0 and 100"
    ))]
    pub max_reconnect_attempts: u32,

    /// Growth factor applied to the reconnect delay after each failure.
    #[validate(range(
        min = 1.0,
        max = 30.0,
        message = "Reconnect backoff multiplier must be between 1 and 30"
    ))]
    pub reconnect_backoff_multiplier: f64,

    /// Seconds to wait for PUBACK/PUBCOMP before a publish counts as failed.
    #[validate(range(
        min = 1,
        max = 300,
        message = "Ack timeout must be between 1 and 300 seconds"
    ))]
    pub ack_timeout: u64,

    /// TLS is used when this section is present and names a CA certificate.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Config {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout)
    }

    /// Joins `topic` onto `base_topic` with exactly one separator.
    pub fn with_base_topic(&self, topic: &str) -> String {
        join_topic(&self.base_topic, topic)
    }

    pub fn status_topic(&self) -> String {
        self.with_base_topic("status")
    }
}

impl Default for Config {
    /// Plain TCP to a local broker, no credentials.
    fn default() -> Self {
        Config {
            base_topic: "weatherbee".to_string(),
            host: "localhost".to_string(),
            port: 1883,
            connection_timeout: 30,
            clean_session: true,
            max_inflight: 10,
            keep_alive: 60,
            client_id: String::new(),
            username: None,
            password: None,
            max_packet_size: Some(65_535),
            request_channel_capacity: Some(10),
            reconnect_delay: 1,
            reconnect_max_delay: 60,
            max_reconnect_attempts: 0,
            reconnect_backoff_multiplier: 2.0,
            ack_timeout: 10,
            tls: None,
        }
    }
}

pub(crate) fn join_topic(base: &str, topic: &str) -> String {
    if base.is_empty() {
        topic.to_string()
    } else {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            topic.trim_start_matches('/')
        )
    }
}

fn validate_credentials(config: &Config) -> Result<(), ValidationError> {
    let username = config.username.as_deref().map(str::is_empty);
    let password = config.password.is_some();
    match (username, password) {
        (Some(true), _) => Err(ValidationError::new("empty_username")
            .with_message("Username must not be empty".into())),
        (Some(false), false) | (None, true) => Err(ValidationError::new("incomplete_credentials")
            .with_message("Username and password must be provided together".into())),
        _ => Ok(()),
    }
}

/// Certificate paths for TLS. Files are checked again when the client is built.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    /// CA certificate (PEM) used to verify the broker.
    #[validate(custom(
        function = "validate_file_path",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    /// Client certificate (PEM) for mutual TLS. Pairs with `client_key_path`.
    #[validate(custom(
        function = "validate_file_path",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    /// Unencrypted client private key (PEM). Pairs with `client_cert_path`.
    #[validate(custom(
        function = "validate_file_path",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn new(
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: Some(client_cert_path.into()),
            client_key_path: Some(client_key_path.into()),
        }
    }

    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Checks the files exist and that client auth is either complete or absent.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = self.ca_cert_path.as_deref() else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (
            self.client_cert_path.as_deref(),
            self.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
                Ok(())
            }
            (None, None) => Ok(()),
            _ => Err(ValidationError::new("incomplete_client_auth").with_message(
                "Both client certificate and key must be provided or neither".into(),
            )),
        }
    }
}

fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);

    if !path_obj.exists() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    if !path_obj.is_file() {
        return Err(ValidationError::new("not_a_file")
            .with_message(format!("Path is not a file: {path}").into()));
    }

    Ok(())
}

/// Topic, QoS and retain flag for one publish destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EndpointMetadata {
    /// 0 = at most once, 1 = at least once (PUBACK), 2 = exactly once (PUBCOMP).
    #[validate(range(min = 0, max = 2, message = "Invalid QoS value, must be 0, 1, or 2"))]
    pub qos: u8,

    /// Concrete topic, without the base topic prefix.
    #[validate(length(min = 1, message = "Topic must not be empty"))]
    pub topic: String,

    pub retain: bool,
}

impl EndpointMetadata {
    pub fn new(topic: impl Into<String>, qos: u8, retain: bool) -> Self {
        Self {
            qos,
            topic: topic.into(),
            retain,
        }
    }

    /// Maps the numeric QoS onto the protocol level.
    pub fn qos_level(&self) -> Result<QoS, TransferError> {
        match self.qos {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(TransferError::InvalidMetadata(format!(
                "Invalid QoS value: {other}"
            ))),
        }
    }
}

impl Default for EndpointMetadata {
    fn default() -> Self {
        Self {
            qos: QoS::AtLeastOnce as u8,
            topic: "telemetry".to_string(),
            retain: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.clean_session);
        assert_eq!(config.ack_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_empty_host_is_rejected() {
        let config = Config {
            host: String::new(),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("host"));
    }

    #[test]
    fn test_partial_credentials_are_rejected() {
        let only_user = Config {
            username: Some("device".into()),
            ..Default::default()
        };
        assert!(only_user.validate().is_err());

        let only_password = Config {
            password: Some("secret".into()),
            ..Default::default()
        };
        assert!(only_password.validate().is_err());

        let both = Config {
            username: Some("device".into()),
            password: Some("secret".into()),
            ..Default::default()
        };
        assert!(both.validate().is_ok());
    }

    #[test]
    fn test_base_topic_join() {
        let config = Config {
            base_topic: "weatherbee/".into(),
            ..Default::default()
        };
        assert_eq!(config.with_base_topic("/readings"), "weatherbee/readings");
        assert_eq!(config.status_topic(), "weatherbee/status");

        let bare = Config {
            base_topic: String::new(),
            ..Default::default()
        };
        assert_eq!(bare.with_base_topic("readings"), "readings");
    }

    #[test]
    fn test_config_from_toml() {
        let config: Config = toml::from_str(
            r#"
            host = "broker.local"
            port = 8883
            username = "rasp-bi-00"
            password = "pw"
            ack_timeout = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 8883);
        assert_eq!(config.ack_timeout(), Duration::from_secs(3));
        assert_eq!(config.base_topic, "weatherbee");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_validation() {
        let mut ca = NamedTempFile::new().unwrap();
        writeln!(ca, "ca").unwrap();
        let ca_path = ca.path().to_string_lossy().into_owned();

        assert!(TlsConfig::with_ca_only(&ca_path).validate_config().is_ok());
        assert!(TlsConfig::with_ca_only("/nonexistent/ca.pem")
            .validate_config()
            .is_err());

        let partial = TlsConfig {
            ca_cert_path: Some(ca_path.clone()),
            client_cert_path: Some(ca_path),
            client_key_path: None,
        };
        assert!(!partial.has_client_auth());
        assert!(partial.validate_config().is_err());
    }

    #[test]
    fn test_endpoint_qos_mapping() {
        assert_eq!(
            EndpointMetadata::new("t", 0, false).qos_level().unwrap(),
            QoS::AtMostOnce
        );
        assert_eq!(
            EndpointMetadata::new("t", 2, false).qos_level().unwrap(),
            QoS::ExactlyOnce
        );
        assert!(EndpointMetadata::new("t", 3, false).qos_level().is_err());
        assert!(EndpointMetadata::new("t", 3, false).validate().is_err());
        assert!(EndpointMetadata::new("", 1, false).validate().is_err());
    }
}
