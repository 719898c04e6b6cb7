//! Fixed-cadence sampling.
//!
//! Each tick reads the temperature, shows it on the display, reads the
//! pressure, then encodes the reading and hands it to the
//! [`RetryingPublisher`]. Nothing on this path waits for the network; a tick
//! whose sensor read fails is skipped.

use std::{sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    display::Display,
    encoder::PayloadEncoder,
    reading::Reading,
    retrying::{RetryingPublisher, SubmitError},
    sensor::{Sensor, SensorError},
};

/// What a single tick did.
#[derive(Debug)]
pub enum TickOutcome {
    Submitted,
    /// Submitted, but the queue evicted an older payload to make room.
    SubmittedWithDrop,
    SensorFailed(SensorError),
    /// The publisher no longer accepts payloads.
    Closed,
}

/// Totals over the lifetime of [`SampleLoop::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SampleLoopSummary {
    pub ticks: u64,
    pub submitted: u64,
    pub sensor_failures: u64,
    pub display_failures: u64,
    pub queue_drops: u64,
}

pub struct SampleLoop {
    device_id: String,
    interval: Duration,
    sensor: Box<dyn Sensor>,
    display: Box<dyn Display>,
    encoder: PayloadEncoder,
    publisher: Arc<RetryingPublisher>,
    summary: SampleLoopSummary,
}

impl SampleLoop {
    pub fn new(
        device_id: impl Into<String>,
        interval: Duration,
        sensor: Box<dyn Sensor>,
        display: Box<dyn Display>,
        encoder: PayloadEncoder,
        publisher: Arc<RetryingPublisher>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            interval,
            sensor,
            display,
            encoder,
            publisher,
            summary: SampleLoopSummary::default(),
        }
    }

    pub fn summary(&self) -> SampleLoopSummary {
        self.summary
    }

    /// Runs one sample cycle.
    pub async fn tick(&mut self) -> TickOutcome {
        self.summary.ticks += 1;

        let reading = match self.sample().await {
            Ok(reading) => reading,
            Err(e) => {
                self.summary.sensor_failures += 1;
                warn!("Sensor read failed, skipping tick: {}", e);
                return TickOutcome::SensorFailed(e);
            }
        };

        let payload = self.encoder.encode(&reading);
        debug!(
            temperature = reading.temperature(),
            pressure = reading.pressure(),
            "Sampled {} byte payload",
            payload.len()
        );

        match self.publisher.submit(payload) {
            Ok(()) => {
                self.summary.submitted += 1;
                TickOutcome::Submitted
            }
            Err(SubmitError::QueueFull(_)) => {
                self.summary.submitted += 1;
                self.summary.queue_drops += 1;
                TickOutcome::SubmittedWithDrop
            }
            Err(SubmitError::Closed) => TickOutcome::Closed,
        }
    }

    async fn sample(&mut self) -> Result<Reading, SensorError> {
        let temperature = self.sensor.read_temperature().await?;

        if let Err(e) = self.display.show(temperature).await {
            self.summary.display_failures += 1;
            warn!("Display update failed: {}", e);
        }

        let pressure = self.sensor.read_pressure().await?;
        Ok(Reading::now(&self.device_id, temperature, pressure))
    }

    /// Ticks every interval until `cancel` fires or the publisher closes.
    ///
    /// The first tick fires immediately. A tick that overruns delays the
    /// next one instead of bursting to catch up.
    pub async fn run(mut self, cancel: CancellationToken) -> SampleLoopSummary {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Sampling '{}' every {:?}",
            self.device_id, self.interval
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Sample loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if let TickOutcome::Closed = self.tick().await {
                        info!("Publisher closed, stopping sample loop");
                        break;
                    }
                }
            }
        }

        info!(
            "Sample loop stopped after {} tick(s): {} submitted, {} sensor failure(s), {} dropped",
            self.summary.ticks,
            self.summary.submitted,
            self.summary.sensor_failures,
            self.summary.queue_drops
        );
        self.summary
    }
}
