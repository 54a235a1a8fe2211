//! Job queue with delayed delivery.
//!
//! Producers publish [`EnrichmentJob`] envelopes; the worker receives raw
//! [`Delivery`]s and acknowledges each one only after it has been handled.
//! Decoding is left to the consumer so a malformed payload can be logged and
//! acknowledged instead of blocking the queue.

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

use std::time::Duration;

use async_trait::async_trait;

use eatsavvy_core::EnrichmentJob;

pub use in_memory::InMemoryJobQueue;
#[cfg(feature = "redis")]
pub use redis_streams::RedisJobQueue;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("queue operation {operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// A message handed to a consumer, pending acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned id, used to acknowledge.
    pub id: String,
    pub payload: Vec<u8>,
    /// Delay the message was published with (zero for immediate publishes).
    pub delay: Duration,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Make `job` available to consumers immediately.
    async fn publish(&self, job: &EnrichmentJob) -> Result<(), QueueError>;

    /// Make `job` available to consumers once `delay` has elapsed.
    async fn publish_delayed(&self, job: &EnrichmentJob, delay: Duration) -> Result<(), QueueError>;

    /// Wait up to `wait` for the next ready delivery.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Remove a handled delivery from the queue.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> JobQueue for std::sync::Arc<Q>
where
    Q: JobQueue + ?Sized,
{
    async fn publish(&self, job: &EnrichmentJob) -> Result<(), QueueError> {
        (**self).publish(job).await
    }

    async fn publish_delayed(&self, job: &EnrichmentJob, delay: Duration) -> Result<(), QueueError> {
        (**self).publish_delayed(job, delay).await
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>, QueueError> {
        (**self).receive(wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        (**self).ack(delivery).await
    }
}

pub(crate) fn encode_job(job: &EnrichmentJob) -> Result<Vec<u8>, QueueError> {
    job.encode().map_err(|e| QueueError::Serialization(e.to_string()))
}
