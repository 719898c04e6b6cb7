//! The telemetry pipeline: sensor and display collaborators, payload
//! encoding, the publish seam, bounded-retry delivery and the sample loop.

pub mod client;
pub mod display;
pub mod encoder;
pub mod readiness;
pub mod reading;
pub mod retrying;
pub mod sampler;
pub mod sensor;

pub use client::{MessageId, MqttPublishClient, PublishClient, PublishError};
pub use encoder::{DecodedReading, Payload, PayloadEncoder, PayloadError};
pub use reading::Reading;
pub use retrying::{
    DeliveryOutcome, DeliveryReport, DeliveryState, DeliveryStatsSnapshot, QueueFullError,
    RetryPolicy, RetryingPublisher, SubmitError,
};
pub use sampler::{SampleLoop, SampleLoopSummary, TickOutcome};
