//! Application configuration loading, validation, and management.
//!
//! The top-level [`Config`] aggregates logging, telemetry, delivery and
//! transport settings. It is read from TOML, patched with a small set of
//! environment overrides, validated, and then treated as immutable.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{delivery::DeliveryConfig, logger::LoggerConfig, telemetry::TelemetryConfig};

pub mod delivery;
pub mod logger;
pub mod telemetry;

pub type TransportConfig = weatherbee_mqtt::Config;

/// Timestamp used by the early print macros.
#[doc(hidden)]
pub fn early_timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(time::macros::format_description!(
            "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]Z"
        ))
        .unwrap_or_default()
}

/// Prints timestamped lines before the tracing subscriber is installed.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::early_timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

/// Errors raised while locating, parsing or validating configuration.
/// Any of them stops the process before the pipeline starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(errors: validator::ValidationErrors) -> Self {
        ConfigError::ValidationError(errors.to_string())
    }
}

/// Top-level application configuration.
#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    /// Device identity, cadence, sensor and display.
    #[validate(nested)]
    pub telemetry: TelemetryConfig,

    /// Retry policy for outgoing readings.
    #[validate(nested)]
    pub delivery: DeliveryConfig,

    #[validate(nested)]
    pub transport: TransportConfig,
}

const CONFIG_ENV: &str = "WEATHERBEE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/weatherbee/config.toml";

impl Config {
    /// Locates, loads and validates the configuration file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be found, read, parsed, or
    /// validated.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// Priority:
    /// 1. `WEATHERBEE_CONFIG` environment variable
    /// 2. `/etc/weatherbee/config.toml`
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {CONFIG_ENV}: {}", path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::Config(format!(
            "No configuration file found. Set {CONFIG_ENV} or create {DEFAULT_CONFIG_PATH}"
        )))
    }

    /// Loads configuration from `path`, applies environment overrides from
    /// the process environment and validates the result.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::Config(format!(
                "Configuration file does not exist: {}",
                path.display()
            )));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&config_str, |key| std::env::var(key).ok())?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses `source`, applies overrides resolved through `lookup` and validates.
    pub fn from_toml_str(
        source: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Config, ConfigError> {
        let mut config: Config =
            toml::from_str(source).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.apply_env_overrides(lookup);
        config.validate()?;
        Ok(config)
    }

    /// Overrides device id, telemetry topic and broker credentials.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `WEATHERBEE_DEVICE_ID` | `telemetry.device_id` |
    /// | `WEATHERBEE_TOPIC` | `telemetry.endpoint.topic` |
    /// | `WEATHERBEE_MQTT_USERNAME` | `transport.username` |
    /// | `WEATHERBEE_MQTT_PASSWORD` | `transport.password` |
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(device_id) = lookup("WEATHERBEE_DEVICE_ID") {
            self.telemetry.device_id = device_id;
        }
        if let Some(topic) = lookup("WEATHERBEE_TOPIC") {
            self.telemetry.endpoint.topic = topic;
        }
        if let Some(username) = lookup("WEATHERBEE_MQTT_USERNAME") {
            self.transport.username = Some(username);
        }
        if let Some(password) = lookup("WEATHERBEE_MQTT_PASSWORD") {
            self.transport.password = Some(password);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, io::Write};

    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_toml_str("", no_env).unwrap();
        assert_eq!(config.telemetry.device_id, "rasp-bi-00");
        assert_eq!(config.delivery.max_attempts, 4);
        assert_eq!(config.transport.base_topic, "weatherbee");
    }

    #[test]
    fn test_full_document() {
        let config = Config::from_toml_str(
            r#"
            [logger]
            level = "debug"

            [telemetry]
            device_id = "greenhouse"
            sample_interval_ms = 1000
            include_timestamp = false

            [telemetry.endpoint]
            topic = "sensors/greenhouse"
            qos = 1

            [telemetry.sensor]
            kind = "simulated"

            [delivery]
            max_attempts = 6
            base_delay_ms = 500
            max_delay_ms = 4000
            jitter = false

            [transport]
            host = "broker.local"
            port = 8883
            "#,
            no_env,
        )
        .unwrap();

        assert_eq!(config.logger.level, "debug");
        assert_eq!(config.telemetry.device_id, "greenhouse");
        assert!(!config.telemetry.include_timestamp);
        assert_eq!(config.telemetry.endpoint.topic, "sensors/greenhouse");
        assert_eq!(config.delivery.max_attempts, 6);
        assert!(!config.delivery.jitter);
        assert_eq!(config.transport.host, "broker.local");
        assert_eq!(config.transport.port, 8883);
    }

    #[test]
    fn test_env_overrides_applied_before_validation() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("WEATHERBEE_DEVICE_ID", "attic"),
            ("WEATHERBEE_TOPIC", "attic/readings"),
            ("WEATHERBEE_MQTT_USERNAME", "bee"),
            ("WEATHERBEE_MQTT_PASSWORD", "hive"),
        ]);

        let config =
            Config::from_toml_str("", |key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.telemetry.device_id, "attic");
        assert_eq!(config.telemetry.endpoint.topic, "attic/readings");
        assert_eq!(config.transport.username.as_deref(), Some("bee"));
        assert_eq!(config.transport.password.as_deref(), Some("hive"));
    }

    #[test]
    fn test_empty_topic_is_fatal() {
        let err = Config::from_toml_str(
            r#"
            [telemetry.endpoint]
            topic = ""
            "#,
            no_env,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_partial_credentials_are_fatal() {
        let err = Config::from_toml_str("", |key| {
            (key == "WEATHERBEE_MQTT_USERNAME").then(|| "bee".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let err = Config::from_toml_str("[telemetry\n", no_env).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[telemetry]\ndevice_id = \"shed\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.telemetry.device_id, "shed");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Config(_)));
    }
}
