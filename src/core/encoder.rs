//! Canonical wire form of a [`Reading`].
//!
//! A payload is a flat JSON object whose keys are emitted in sorted order:
//!
//! ```json
//! {"device_id":"rasp-bi-00","pressure":1013.2,"temperature":21.5,"timestamp":"2024-05-01T12:00:00Z"}
//! ```
//!
//! The same reading always encodes to the same bytes, so a payload that is
//! retried is byte-identical to the one first attempted.

use std::fmt;

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use super::reading::Reading;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Invalid timestamp '{value}': {reason}")]
    InvalidTimestamp { value: String, reason: String },
}

/// Serialized reading. Cloning shares the underlying buffer.
///
/// Equality compares bytes only; the sequence number is a local tag for
/// log correlation.
#[derive(Clone)]
pub struct Payload {
    bytes: Bytes,
    sequence: u64,
}

impl Payload {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
            sequence: 0,
        }
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    /// Assigned when the payload is submitted for delivery; `0` before that.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Parses the payload back into its fields.
    pub fn decode(&self) -> Result<DecodedReading, PayloadError> {
        let wire: WireReading = serde_json::from_slice(&self.bytes)?;
        let timestamp = wire
            .timestamp
            .map(|value| {
                OffsetDateTime::parse(&value, &Rfc3339).map_err(|e| {
                    PayloadError::InvalidTimestamp {
                        value: value.clone(),
                        reason: e.to_string(),
                    }
                })
            })
            .transpose()?;

        Ok(DecodedReading {
            device_id: wire.device_id,
            temperature: wire.temperature,
            pressure: wire.pressure,
            timestamp,
        })
    }
}

impl PartialEq for Payload {
    fn eq(&self, other: &Self) -> bool {
        self.bytes == other.bytes
    }
}

impl Eq for Payload {}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("sequence", &self.sequence)
            .field("body", &String::from_utf8_lossy(&self.bytes))
            .finish()
    }
}

#[derive(Deserialize)]
struct WireReading {
    device_id: String,
    temperature: f64,
    pressure: f64,
    #[serde(default)]
    timestamp: Option<String>,
}

/// Fields recovered from a [`Payload`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedReading {
    pub device_id: String,
    pub temperature: f64,
    pub pressure: f64,
    pub timestamp: Option<OffsetDateTime>,
}

impl DecodedReading {
    /// Same device, temperature and pressure. The timestamp is ignored.
    pub fn is_equivalent(&self, reading: &Reading) -> bool {
        self.device_id == reading.device_id()
            && self.temperature == reading.temperature()
            && self.pressure == reading.pressure()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PayloadEncoder {
    include_timestamp: bool,
}

impl PayloadEncoder {
    pub fn new(include_timestamp: bool) -> Self {
        Self { include_timestamp }
    }

    pub fn includes_timestamp(&self) -> bool {
        self.include_timestamp
    }

    /// Never fails. Non-finite numbers are written as `null`.
    pub fn encode(&self, reading: &Reading) -> Payload {
        // serde_json's default map is ordered by key
        let mut doc = Map::new();
        doc.insert("device_id".into(), Value::from(reading.device_id()));
        doc.insert("pressure".into(), Value::from(reading.pressure()));
        doc.insert("temperature".into(), Value::from(reading.temperature()));

        if self.include_timestamp {
            if let Ok(ts) = reading.timestamp().format(&Rfc3339) {
                doc.insert("timestamp".into(), Value::from(ts));
            }
        }

        Payload::new(Value::Object(doc).to_string())
    }
}

impl Default for PayloadEncoder {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    fn sample() -> Reading {
        Reading::new("rasp-bi-00", 21.5, 1013.2, datetime!(2024-05-01 12:00 UTC))
    }

    #[test]
    fn test_encode_is_deterministic() {
        let encoder = PayloadEncoder::new(true);
        let reading = sample();
        assert_eq!(
            encoder.encode(&reading).as_bytes(),
            encoder.encode(&reading).as_bytes()
        );
    }

    #[test]
    fn test_keys_are_sorted() {
        let payload = PayloadEncoder::new(true).encode(&sample());
        assert_eq!(
            std::str::from_utf8(payload.as_bytes()).unwrap(),
            r#"{"device_id":"rasp-bi-00","pressure":1013.2,"temperature":21.5,"timestamp":"2024-05-01T12:00:00Z"}"#
        );
    }

    #[test]
    fn test_without_timestamp() {
        let payload = PayloadEncoder::new(false).encode(&sample());
        assert_eq!(
            std::str::from_utf8(payload.as_bytes()).unwrap(),
            r#"{"device_id":"rasp-bi-00","pressure":1013.2,"temperature":21.5}"#
        );
        assert!(payload.decode().unwrap().timestamp.is_none());
    }

    #[test]
    fn test_decode_is_equivalent() {
        let reading = sample();
        let decoded = PayloadEncoder::new(true).encode(&reading).decode().unwrap();

        assert!(decoded.is_equivalent(&reading));
        assert_eq!(decoded.timestamp, Some(reading.timestamp()));
    }

    #[test]
    fn test_timestamp_does_not_affect_equivalence() {
        let earlier = sample();
        let later = Reading::new("rasp-bi-00", 21.5, 1013.2, datetime!(2024-05-01 12:05 UTC));

        let decoded = PayloadEncoder::new(true).encode(&later).decode().unwrap();
        assert!(decoded.is_equivalent(&earlier));

        let other_device = Reading::new("rasp-bi-01", 21.5, 1013.2, earlier.timestamp());
        assert!(!decoded.is_equivalent(&other_device));
    }

    #[test]
    fn test_non_finite_values_encode_as_null() {
        let reading = Reading::new("rasp-bi-00", f64::NAN, 1013.2, datetime!(2024-05-01 12:00 UTC));
        let payload = PayloadEncoder::new(false).encode(&reading);

        let value: Value = serde_json::from_slice(payload.as_bytes()).unwrap();
        assert!(value["temperature"].is_null());
        assert!(payload.decode().is_err());
    }

    #[test]
    fn test_equality_ignores_sequence() {
        let payload = PayloadEncoder::new(false).encode(&sample());
        let tagged = payload.clone().with_sequence(7);

        assert_eq!(payload, tagged);
        assert_eq!(tagged.sequence(), 7);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            Payload::new("not json").decode(),
            Err(PayloadError::Malformed(_))
        ));

        let bad_ts = Payload::new(
            r#"{"device_id":"a","pressure":1.0,"temperature":2.0,"timestamp":"yesterday"}"#,
        );
        assert!(matches!(
            bad_ts.decode(),
            Err(PayloadError::InvalidTimestamp { .. })
        ));
    }
}
