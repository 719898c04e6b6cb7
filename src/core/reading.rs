use time::OffsetDateTime;

/// One sensor sample. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    device_id: String,
    temperature: f64,
    pressure: f64,
    timestamp: OffsetDateTime,
}

impl Reading {
    /// `temperature` in degrees Celsius, `pressure` in hectopascals.
    pub fn new(
        device_id: impl Into<String>,
        temperature: f64,
        pressure: f64,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            temperature,
            pressure,
            timestamp,
        }
    }

    /// Stamped with the current UTC time.
    pub fn now(device_id: impl Into<String>, temperature: f64, pressure: f64) -> Self {
        Self::new(device_id, temperature, pressure, OffsetDateTime::now_utc())
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn pressure(&self) -> f64 {
        self.pressure
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }
}
