//! weatherbee: samples a weather sensor and publishes readings over MQTT.
//!
//! A [`core::SampleLoop`] reads temperature and pressure at a fixed cadence,
//! shows the temperature on a local display, encodes each reading into a
//! canonical JSON payload and hands it to a [`core::RetryingPublisher`],
//! which delivers it through a [`core::PublishClient`] with bounded,
//! exponentially backed-off retries.
//!
//! ## Modules
//!
//! * `config`: TOML configuration with environment overrides, validated
//!   with the `validator` crate.
//! * `core`: The pipeline: readings, payloads, sensors, displays, delivery,
//!   readiness and the sample loop.
//! * `logger`: `tracing` subscriber setup: console output (compact, pretty,
//!   JSON) and optional systemd journald.
//!
//! The broker transport lives in the `weatherbee_mqtt` workspace crate.

pub mod config;
pub mod core;
pub mod logger;
