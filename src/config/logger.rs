//! Logging configuration structures and validation logic.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

/// Timestamp rendering for console output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampFormat {
    /// `2024-05-01T12:00:00.123456Z`
    #[default]
    Rfc3339,
    /// Seconds since the epoch with millisecond precision.
    Unix,
    /// A `time` crate format description, e.g. `"[hour]:[minute]:[second]"`.
    Custom(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// One of trace, debug, info, warn, error (case-insensitive).
    /// `RUST_LOG` takes precedence when set.
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,

    #[validate(custom(function = "validate_timestamp_format"))]
    pub timestamp_format: TimestampFormat,
}

fn validate_timestamp_format(format: &TimestampFormat) -> Result<(), ValidationError> {
    let TimestampFormat::Custom(description) = format else {
        return Ok(());
    };

    if description.is_empty() {
        let mut err = ValidationError::new("invalid_timestamp_format");
        err.message = Some("Custom timestamp format cannot be empty".into());
        return Err(err);
    }

    if let Err(e) = time::format_description::parse_owned::<2>(description) {
        let mut err = ValidationError::new("invalid_timestamp_format");
        err.message = Some(format!("Invalid custom timestamp format: {e}").into());
        return Err(err);
    }

    Ok(())
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {level}").into());
            Err(err)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            timestamp_format: TimestampFormat::default(),
            console: Some(ConsoleConfig::default()),
            journald: Some(JournaldConfig::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,
    pub format: LogFormat,

    /// Include the module path of each event.
    pub show_target: bool,
    pub show_thread_ids: bool,

    /// Emit an event when a span closes, with its timing.
    pub show_spans: bool,
    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journal output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct JournaldConfig {
    pub enabled: bool,

    /// `SYSLOG_IDENTIFIER` attached to every entry.
    #[validate(length(min = 1, message = "Journald identifier must not be empty"))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "weatherbee".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_logger_config_is_valid() {
        assert!(LoggerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_log_level_validation() {
        let config = LoggerConfig {
            level: "WARN".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = LoggerConfig {
            level: "verbose".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_custom_timestamp_format_validation() {
        let valid = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour]:[minute]:[second]".into()),
            ..Default::default()
        };
        assert!(valid.validate().is_ok());

        let empty = LoggerConfig {
            timestamp_format: TimestampFormat::Custom(String::new()),
            ..Default::default()
        };
        assert!(empty.validate().is_err());

        let malformed = LoggerConfig {
            timestamp_format: TimestampFormat::Custom("[hour".into()),
            ..Default::default()
        };
        assert!(malformed.validate().is_err());
    }

    #[test]
    fn test_logger_config_from_toml() {
        let config: LoggerConfig = toml::from_str(
            r#"
            level = "debug"
            timestamp_format = "unix"

            [console]
            format = "json"

            [journald]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.level, "debug");
        assert_eq!(config.timestamp_format, TimestampFormat::Unix);
        assert_eq!(config.console.unwrap().format, LogFormat::Json);
        assert_eq!(config.journald.unwrap().identifier, "weatherbee");
    }
}
