//! Builds the `rumqttc` client handle and event loop.
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::new("rasp-bi-00", "mqtt.example.com", 8883, 10)?
//!     .with_tls_ca_only("/etc/weatherbee/ca.pem")
//!     .credentials("rasp-bi-00", "secret")
//!     .set_last_will("weatherbee/status")
//!     .build()?;
//! ```
//!
//! The client handle is cheap to clone and used from any task; the event loop
//! belongs to the connection kernel.

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

pub struct ClientBuilder {
    opts: MqttOptions,

    /// Request channel capacity between the client handle and the event loop.
    cap: usize,

    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    pub fn new(
        client_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        cap: usize,
    ) -> Result<Self, TransferError> {
        if cap == 0 {
            return Err(TransferError::ClientSetup(
                "Request channel capacity must be at least 1".into(),
            ));
        }
        Ok(Self {
            opts: MqttOptions::new(client_id, host, port),
            cap,
            tls_config: None,
        })
    }

    /// Applies every connection setting from `config`.
    ///
    /// The last will publishes a retained `offline` to `{base_topic}/status`.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };

        let cap = config.request_channel_capacity.unwrap_or(10) as usize;
        let mut builder = Self::new(client_id, config.host.clone(), config.port, cap)?
            .keep_alive(config.keep_alive)
            .clean_session(config.clean_session)
            .max_inflight(config.max_inflight)
            .set_last_will(&config.status_topic());

        if let Some(max_packet_size) = config.max_packet_size {
            builder = builder.max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                builder = builder.credentials(username.clone(), password.clone());
            }
            (None, None) => {}
            _ => {
                return Err(TransferError::ClientSetup(
                    "Username and password must be provided together".into(),
                ))
            }
        }

        builder.tls_config = config.tls.clone().filter(TlsConfig::is_enabled);
        Ok(builder)
    }

    /// Mutual TLS: CA plus client certificate and key, all PEM.
    pub fn with_tls(
        mut self,
        ca_cert_path: impl Into<String>,
        client_cert_path: impl Into<String>,
        client_key_path: impl Into<String>,
    ) -> Self {
        self.tls_config = Some(TlsConfig::new(
            ca_cert_path,
            client_cert_path,
            client_key_path,
        ));
        self
    }

    /// Server-authenticated TLS only.
    pub fn with_tls_ca_only(mut self, ca_cert_path: impl Into<String>) -> Self {
        self.tls_config = Some(TlsConfig::with_ca_only(ca_cert_path));
        self
    }

    pub fn keep_alive(mut self, secs: u64) -> Self {
        self.opts.set_keep_alive(Duration::from_secs(secs));
        self
    }

    pub fn max_packet_size(mut self, incoming: usize, outgoing: usize) -> Self {
        self.opts.set_max_packet_size(incoming, outgoing);
        self
    }

    pub fn clean_session(mut self, clean: bool) -> Self {
        self.opts.set_clean_session(clean);
        self
    }

    /// Sent in the CONNECT packet; in clear text unless TLS is configured.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.opts.set_credentials(username, password);
        self
    }

    pub fn max_inflight(mut self, max: u16) -> Self {
        self.opts.set_inflight(max);
        self
    }

    /// Registers a retained QoS 1 `offline` on `status_topic`.
    pub fn set_last_will(mut self, status_topic: &str) -> Self {
        let last_will = LastWill::new(
            status_topic,
            "offline".as_bytes().to_vec(),
            QoS::AtLeastOnce,
            true,
        );
        self.opts.set_last_will(last_will);
        self
    }

    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, TransferError> {
        tls_config
            .validate_config()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransferError::ClientSetup("CA certificate path is required".into()))?;
        let ca = fs::read(ca_path)?;

        let client_auth = match (
            tls_config.client_cert_path.as_deref(),
            tls_config.client_key_path.as_deref(),
        ) {
            (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
            _ => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    /// Consumes the builder. TLS files are read here.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;
        if let Some(tls) = &self.tls_config {
            opts.set_transport(Self::build_tls_transport(tls)?);
        }

        Ok(AsyncClient::new(opts, self.cap))
    }
}

#[cfg(test)]
mod tests {
    use std::{fs::File, io::Write};

    use tempfile::TempDir;

    use super::*;

    struct TestFiles {
        _temp_dir: TempDir,
        ca_cert: String,
        client_cert: String,
        client_key: String,
    }

    impl TestFiles {
        fn new() -> std::io::Result<Self> {
            let temp_dir = TempDir::new()?;

            let ca_cert = temp_dir.path().join("ca.crt");
            let client_cert = temp_dir.path().join("client.crt");
            let client_key = temp_dir.path().join("client.key");

            File::create(&ca_cert)?.write_all(b"ca certificate content")?;
            File::create(&client_cert)?.write_all(b"client certificate content")?;
            File::create(&client_key)?.write_all(b"client key content")?;

            Ok(TestFiles {
                _temp_dir: temp_dir,
                ca_cert: ca_cert.to_string_lossy().into_owned(),
                client_cert: client_cert.to_string_lossy().into_owned(),
                client_key: client_key.to_string_lossy().into_owned(),
            })
        }
    }

    #[test]
    fn test_builder_rejects_zero_capacity() {
        assert!(ClientBuilder::new("c", "localhost", 1883, 0).is_err());
    }

    #[test]
    fn test_build_tcp_client() {
        let result = ClientBuilder::new("test_client", "localhost", 1883, 100)
            .expect("Failed to create ClientBuilder")
            .keep_alive(30)
            .clean_session(true)
            .credentials("user", "pass")
            .max_inflight(50)
            .build();

        assert!(result.is_ok());
    }

    #[test]
    fn test_build_tls_client_with_client_auth() {
        let test_files = TestFiles::new().expect("Failed to create test files");

        let result = ClientBuilder::new("test_client", "localhost", 8883, 100)
            .expect("Failed to create ClientBuilder")
            .with_tls(
                &test_files.ca_cert,
                &test_files.client_cert,
                &test_files.client_key,
            )
            .build();

        assert!(result.is_ok());
    }

    #[test]
    fn test_build_tls_client_ca_only() {
        let test_files = TestFiles::new().expect("Failed to create test files");

        let result = ClientBuilder::new("test_client", "localhost", 8883, 100)
            .expect("Failed to create ClientBuilder")
            .with_tls_ca_only(&test_files.ca_cert)
            .build();

        assert!(result.is_ok());
    }

    #[test]
    fn test_build_tls_missing_ca() {
        let result = ClientBuilder::new("test_client", "localhost", 8883, 100)
            .expect("Failed to create ClientBuilder")
            .with_tls_ca_only("/nonexistent/ca.crt")
            .build();

        assert!(matches!(result, Err(TransferError::ClientSetup(_))));
    }

    #[test]
    fn test_build_from_config() {
        let config = Config {
            client_id: String::new(),
            username: Some("rasp-bi-00".into()),
            password: Some("secret".into()),
            ..Default::default()
        };

        let builder = ClientBuilder::from_config(&config).expect("builder");
        assert!(builder.tls_config.is_none());
        assert_eq!(builder.cap, 10);
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_build_from_config_rejects_partial_credentials() {
        let config = Config {
            username: Some("rasp-bi-00".into()),
            ..Default::default()
        };

        assert!(ClientBuilder::from_config(&config).is_err());
    }
}
