//! Temperature and pressure sources.
//!
//! [`IioWeatherSensor`] reads a Linux IIO barometric device (BMP280 and
//! friends) through sysfs. [`SimulatedSensor`] needs no hardware and is used
//! for bench runs and tests.

use std::{
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use thiserror::Error;
use tracing::trace;

use crate::config::telemetry::{SensorConfig, SensorKind};

#[derive(Error, Debug)]
pub enum SensorError {
    #[error("Failed to read {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {quantity} from {location}: {reason}")]
    Parse {
        quantity: &'static str,
        location: String,
        reason: String,
    },

    #[error("Sensor returned a non-finite {quantity}")]
    NonFinite { quantity: &'static str },

    #[error("Sensor unavailable: {0}")]
    Unavailable(String),
}

pub type SensorResult<T> = Result<T, SensorError>;

/// Source of weather measurements. Either read may fail independently.
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Degrees Celsius.
    async fn read_temperature(&self) -> SensorResult<f64>;

    /// Hectopascals.
    async fn read_pressure(&self) -> SensorResult<f64>;
}

/// Builds the sensor selected in configuration.
pub fn from_config(config: &SensorConfig) -> Box<dyn Sensor> {
    match config.kind {
        SensorKind::Iio => Box::new(IioWeatherSensor::new(&config.device_dir)),
        SensorKind::Simulated => Box::new(SimulatedSensor::new(
            config.baseline_temperature,
            config.baseline_pressure,
        )),
    }
}

/// IIO sysfs channel layout.
///
/// Processed values (`*_input`) are preferred. When a driver only exposes
/// `*_raw`, the value is multiplied by `*_scale` (or `1.0` if absent) to get
/// the same processed unit.
struct Channel {
    name: &'static str,
    quantity: &'static str,
    /// Processed unit to output unit.
    factor: f64,
}

/// Millidegrees Celsius to degrees.
const TEMPERATURE: Channel = Channel {
    name: "in_temp",
    quantity: "temperature",
    factor: 0.001,
};

/// Kilopascals to hectopascals.
const PRESSURE: Channel = Channel {
    name: "in_pressure",
    quantity: "pressure",
    factor: 10.0,
};

#[derive(Debug, Clone)]
pub struct IioWeatherSensor {
    device_dir: PathBuf,
}

impl IioWeatherSensor {
    pub fn new(device_dir: impl AsRef<Path>) -> Self {
        Self {
            device_dir: device_dir.as_ref().to_path_buf(),
        }
    }

    pub fn device_dir(&self) -> &Path {
        &self.device_dir
    }

    async fn read_channel(&self, channel: &Channel) -> SensorResult<f64> {
        let input = self.device_dir.join(format!("{}_input", channel.name));
        let processed = match tokio::fs::read_to_string(&input).await {
            Ok(content) => parse_value(&content, channel.quantity, &input)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.read_raw_scaled(channel).await?
            }
            Err(source) => {
                return Err(SensorError::FileRead {
                    path: input.display().to_string(),
                    source,
                })
            }
        };

        let value = processed * channel.factor;
        trace!("{} from {}: {}", channel.quantity, self.device_dir.display(), value);

        if !value.is_finite() {
            return Err(SensorError::NonFinite {
                quantity: channel.quantity,
            });
        }
        Ok(value)
    }

    async fn read_raw_scaled(&self, channel: &Channel) -> SensorResult<f64> {
        let raw_path = self.device_dir.join(format!("{}_raw", channel.name));
        let raw = tokio::fs::read_to_string(&raw_path)
            .await
            .map_err(|source| SensorError::FileRead {
                path: raw_path.display().to_string(),
                source,
            })?;
        let raw = parse_value(&raw, channel.quantity, &raw_path)?;

        let scale_path = self.device_dir.join(format!("{}_scale", channel.name));
        let scale = match tokio::fs::read_to_string(&scale_path).await {
            Ok(content) => parse_value(&content, channel.quantity, &scale_path)?,
            Err(_) => 1.0,
        };

        Ok(raw * scale)
    }
}

fn parse_value(content: &str, quantity: &'static str, path: &Path) -> SensorResult<f64> {
    content
        .trim()
        .parse::<f64>()
        .map_err(|e| SensorError::Parse {
            quantity,
            location: path.display().to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl Sensor for IioWeatherSensor {
    async fn read_temperature(&self) -> SensorResult<f64> {
        self.read_channel(&TEMPERATURE).await
    }

    async fn read_pressure(&self) -> SensorResult<f64> {
        self.read_channel(&PRESSURE).await
    }
}

/// Deterministic slow drift around a baseline.
///
/// Each read advances a shared step counter; values follow a sine of the
/// step, ±0.5 °C and ±1.5 hPa around the baseline.
#[derive(Debug)]
pub struct SimulatedSensor {
    baseline_temperature: f64,
    baseline_pressure: f64,
    step: AtomicU64,
}

impl SimulatedSensor {
    pub fn new(baseline_temperature: f64, baseline_pressure: f64) -> Self {
        Self {
            baseline_temperature,
            baseline_pressure,
            step: AtomicU64::new(0),
        }
    }

    fn next_phase(&self) -> f64 {
        let step = self.step.fetch_add(1, Ordering::Relaxed);
        (step as f64 * 0.05).sin()
    }
}

#[async_trait]
impl Sensor for SimulatedSensor {
    async fn read_temperature(&self) -> SensorResult<f64> {
        Ok(self.baseline_temperature + 0.5 * self.next_phase())
    }

    async fn read_pressure(&self) -> SensorResult<f64> {
        Ok(self.baseline_pressure + 1.5 * self.next_phase())
    }
}
