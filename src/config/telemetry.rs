//! Device identity, sampling cadence, sensor and display selection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};
use weatherbee_mqtt::EndpointMetadata;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Identifier embedded in every payload.
    #[validate(length(
        min = 1,
        max = 128,
        message = "Device id must be between 1 and 128 characters"
    ))]
    pub device_id: String,

    /// Time between samples, in milliseconds.
    #[validate(range(
        min = 100,
        max = 3_600_000,
        message = "Sample interval must be between 100 ms and 1 hour"
    ))]
    pub sample_interval_ms: u64,

    /// Adds an RFC 3339 `timestamp` field to each payload.
    pub include_timestamp: bool,

    /// Where readings are published; the topic is prefixed with the transport base topic.
    #[validate(nested)]
    pub endpoint: EndpointMetadata,

    #[validate(nested)]
    pub sensor: SensorConfig,

    #[validate(nested)]
    pub display: DisplayConfig,
}

impl TelemetryConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            device_id: "rasp-bi-00".to_string(),
            sample_interval_ms: 500,
            include_timestamp: true,
            endpoint: EndpointMetadata::new("readings", 1, false),
            sensor: SensorConfig::default(),
            display: DisplayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    /// Linux IIO barometric sensor exposed through sysfs.
    #[default]
    Iio,
    /// Deterministic values around a baseline; needs no hardware.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_sensor"))]
pub struct SensorConfig {
    pub kind: SensorKind,

    /// IIO device directory containing `in_temp_input` and `in_pressure_input`.
    pub device_dir: String,

    /// Simulated sensor baseline, degrees Celsius.
    pub baseline_temperature: f64,

    /// Simulated sensor baseline, hectopascals.
    pub baseline_pressure: f64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            kind: SensorKind::Iio,
            device_dir: "/sys/bus/iio/devices/iio:device0".to_string(),
            baseline_temperature: 21.5,
            baseline_pressure: 1013.25,
        }
    }
}

fn validate_sensor(config: &SensorConfig) -> Result<(), ValidationError> {
    match config.kind {
        SensorKind::Iio if config.device_dir.is_empty() => Err(ValidationError::new(
            "missing_device_dir",
        )
        .with_message("IIO sensor requires a device_dir".into())),
        SensorKind::Simulated
            if !config.baseline_temperature.is_finite() || !config.baseline_pressure.is_finite() =>
        {
            Err(ValidationError::new("invalid_baseline")
                .with_message("Simulated sensor baselines must be finite".into()))
        }
        _ => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayKind {
    /// Readings are not rendered anywhere.
    None,
    /// Rendered text goes to the log at info level.
    #[default]
    Log,
    /// Rendered text overwrites `path` on every sample.
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_display"))]
pub struct DisplayConfig {
    pub kind: DisplayKind,

    /// Target file for the `file` display.
    pub path: Option<String>,

    /// Character cells on the display. A decimal point does not take a cell.
    #[validate(range(min = 1, max = 16, message = "Display width must be between 1 and 16"))]
    pub width: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            kind: DisplayKind::Log,
            path: None,
            width: 4,
        }
    }
}

fn validate_display(config: &DisplayConfig) -> Result<(), ValidationError> {
    match (config.kind, config.path.as_deref()) {
        (DisplayKind::File, None | Some("")) => Err(ValidationError::new("missing_display_path")
            .with_message("File display requires a path".into())),
        _ => Ok(()),
    }
}
