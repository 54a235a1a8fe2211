//! Queue message: a versioned snapshot of a restaurant at enqueue time.
//!
//! The worker re-evaluates open hours and places the call from this snapshot alone,
//! so delayed redeliveries never need to re-query the store. Decoding refuses any
//! `schema_version` other than [`JOB_SCHEMA_VERSION`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::JobId;
use crate::restaurant::Restaurant;

pub const JOB_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub schema_version: u32,
    pub job_id: JobId,
    /// Transient-failure retries so far. Closed-restaurant deferrals do not count.
    #[serde(default)]
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    pub restaurant: Restaurant,
}

#[derive(Deserialize)]
struct SchemaHeader {
    schema_version: u32,
}

impl EnrichmentJob {
    pub fn new(restaurant: Restaurant, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            schema_version: JOB_SCHEMA_VERSION,
            job_id: JobId::new(),
            attempt: 0,
            enqueued_at,
            restaurant,
        }
    }

    /// Same job, one retry further along.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DomainError> {
        serde_json::to_vec(self)
            .map_err(|e| DomainError::unsupported_payload(format!("failed to encode job: {e}")))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DomainError> {
        let header: SchemaHeader = serde_json::from_slice(bytes)
            .map_err(|e| DomainError::unsupported_payload(format!("not a job envelope: {e}")))?;
        if header.schema_version != JOB_SCHEMA_VERSION {
            return Err(DomainError::unsupported_payload(format!(
                "unsupported job schema version {} (expected {})",
                header.schema_version, JOB_SCHEMA_VERSION
            )));
        }
        serde_json::from_slice(bytes)
            .map_err(|e| DomainError::unsupported_payload(format!("malformed job envelope: {e}")))
    }
}
