//! Logging initialization.
//!
//! [`LoggerManager`] validates [`LoggerConfig`] and installs the global
//! `tracing` subscriber with a console layer, a systemd journald layer, or
//! both. `RUST_LOG` overrides the configured level when it is set.

use std::io;

use thiserror::Error;
use tracing::instrument;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, format::Writer, time::FormatTime, time::UtcTime},
    prelude::*,
    EnvFilter, Layer, Registry,
};
use validator::{Validate, ValidationErrors};

use crate::{
    config::logger::{ConsoleConfig, LogFormat, LoggerConfig, TimestampFormat},
    print_info, print_warn,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("Logger initialization error: {0}")]
    InitializationError(String),

    #[error("Logger configuration validation error: {0}")]
    ValidationError(#[from] ValidationErrors),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("No logging layers were configured or successfully initialized")]
    NoLayersConfigured,

    /// Journald was requested alongside the console and could not be reached.
    #[error("Failed to initialize journald logger while console logging is enabled")]
    JournaldUnavailable,
}

/// Seconds since the epoch with millisecond precision.
struct UnixTimestamp;

impl FormatTime for UnixTimestamp {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let millis = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        write!(w, "{}.{:03}", millis / 1_000, millis % 1_000)
    }
}

pub struct LoggerManager {
    config: LoggerConfig,
}

impl LoggerManager {
    /// # Errors
    ///
    /// Returns `LoggerError::ValidationError` if configuration validation fails.
    pub fn new(config: LoggerConfig) -> Result<Self, LoggerError> {
        config.validate()?;

        Ok(LoggerManager { config })
    }

    /// Installs the global subscriber. Call once, before the first event.
    #[instrument(skip(self))]
    pub fn init(&self) -> Result<(), LoggerError> {
        let layers = self.build_layers()?;
        tracing_subscriber::registry()
            .with(layers)
            .try_init()
            .map_err(|e| LoggerError::InitializationError(e.to_string()))
    }

    fn build_layers(&self) -> Result<Vec<BoxedLayer>, LoggerError> {
        let mut layers = Vec::new();

        if let Some(console) = self.config.console.as_ref().filter(|c| c.enabled) {
            layers.push(self.console_layer(console)?);
        }

        if let Some(journald) = self.config.journald.as_ref().filter(|j| j.enabled) {
            match tracing_journald::layer() {
                Ok(layer) => {
                    let layer = layer
                        .with_syslog_identifier(journald.identifier.clone())
                        .with_filter(self.filter())
                        .boxed();
                    layers.push(layer);
                    print_info!(
                        "Systemd journald logger initialized with identifier: {}",
                        journald.identifier
                    );
                }
                Err(e) => {
                    print_warn!("Failed to initialize systemd journald logger: {}", e);
                    if !layers.is_empty() {
                        return Err(LoggerError::JournaldUnavailable);
                    }
                }
            }
        }

        if layers.is_empty() {
            print_warn!("No logging layers were initialized. Please check your configuration.");
            return Err(LoggerError::NoLayersConfigured);
        }
        Ok(layers)
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.config.level))
    }

    fn console_layer(&self, console: &ConsoleConfig) -> Result<BoxedLayer, LoggerError> {
        let filter = self.filter();
        let layer = match &self.config.timestamp_format {
            TimestampFormat::Rfc3339 => console_layer(console, filter, UtcTime::rfc_3339()),
            TimestampFormat::Unix => console_layer(console, filter, UnixTimestamp),
            TimestampFormat::Custom(description) => {
                let format = time::format_description::parse_owned::<2>(description)
                    .map_err(|e| LoggerError::InitializationError(e.to_string()))?;
                console_layer(console, filter, UtcTime::new(format))
            }
        };
        Ok(layer)
    }
}

fn console_layer<T>(config: &ConsoleConfig, filter: EnvFilter, timer: T) -> BoxedLayer
where
    T: FormatTime + Send + Sync + 'static,
{
    let span_events = if config.show_spans {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let base = fmt::layer()
        .with_target(config.show_target)
        .with_thread_ids(config.show_thread_ids)
        .with_span_events(span_events)
        .with_ansi(config.ansi_colors)
        .with_writer(io::stdout)
        .with_timer(timer);

    match config.format {
        LogFormat::Json => base.json().with_filter(filter).boxed(),
        LogFormat::Pretty => base.pretty().with_filter(filter).boxed(),
        LogFormat::Compact => base.compact().with_filter(filter).boxed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::logger::JournaldConfig;

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggerConfig {
            level: "loud".into(),
            ..Default::default()
        };
        assert!(matches!(
            LoggerManager::new(config),
            Err(LoggerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_no_layers_is_an_error() {
        let config = LoggerConfig {
            console: None,
            journald: Some(JournaldConfig {
                enabled: false,
                ..Default::default()
            }),
            ..Default::default()
        };
        let manager = LoggerManager::new(config).unwrap();
        assert!(matches!(
            manager.build_layers(),
            Err(LoggerError::NoLayersConfigured)
        ));
    }

    #[test]
    fn test_console_layer_for_every_timestamp_format() {
        for timestamp_format in [
            TimestampFormat::Rfc3339,
            TimestampFormat::Unix,
            TimestampFormat::Custom("[hour]:[minute]:[second]".into()),
        ] {
            for format in [LogFormat::Compact, LogFormat::Pretty, LogFormat::Json] {
                let config = LoggerConfig {
                    timestamp_format: timestamp_format.clone(),
                    console: Some(ConsoleConfig {
                        format,
                        ..Default::default()
                    }),
                    journald: None,
                    ..Default::default()
                };
                let manager = LoggerManager::new(config).unwrap();
                assert_eq!(manager.build_layers().unwrap().len(), 1);
            }
        }
    }
}
