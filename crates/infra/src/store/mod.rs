//! Restaurant and call persistence.
//!
//! The store is the single point of coordination for the pipeline. Every move into
//! `queued` goes through [`RestaurantStore::queue_for_enrichment`], which performs the
//! "lock row, re-check status, upsert" step atomically; every other move is checked
//! against [`EnrichmentStatus::can_transition_to`] under the same lock.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use eatsavvy_core::{Call, EnrichmentStatus, PlaceId, ProviderCallId, Restaurant};

pub use in_memory::InMemoryRestaurantStore;
pub use postgres::PostgresRestaurantStore;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("restaurant not found: {0}")]
    RestaurantNotFound(PlaceId),
    #[error("call not found: {0}")]
    CallNotFound(ProviderCallId),
    #[error("restaurant {place_id} cannot move from {from} to {to}")]
    InvalidTransition {
        place_id: PlaceId,
        from: EnrichmentStatus,
        to: EnrichmentStatus,
    },
    #[error("stored row is malformed: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result of the locked check-and-upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueOutcome {
    /// The row was upserted with status `queued`; the caller must publish a job.
    Queued(Restaurant),
    /// Another request got there first; the locked row is returned untouched.
    AlreadyActive(Restaurant),
}

/// What finalising a call did to its restaurant.
#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Finalisation {
    /// Call row completed and the restaurant moved to its final status.
    Applied,
    /// Call row completed; the restaurant has moved on to a newer call (or out of
    /// `in_progress`) and was left untouched.
    Superseded,
    /// The call was already completed; nothing was written.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFinalised {
    pub place_id: PlaceId,
    pub finalisation: Finalisation,
}

/// Everything the end-of-call report writes, applied in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct CallCompletion {
    pub provider_call_id: ProviderCallId,
    pub transcript: String,
    pub structured_outputs: JsonValue,
    pub summary: String,
    pub success_evaluation: Option<String>,
    pub ended_reason: String,
    pub nutrition_info: JsonValue,
    pub final_status: EnrichmentStatus,
    pub completed_at: DateTime<Utc>,
}

#[async_trait]
pub trait RestaurantStore: Send + Sync {
    async fn get_restaurant(&self, place_id: &PlaceId) -> Result<Option<Restaurant>, StoreError>;

    async fn list_restaurants(&self) -> Result<Vec<Restaurant>, StoreError>;

    /// Lock the row, and unless it is already `queued`/`in_progress`, upsert `fresh`
    /// with status `queued`. An existing phone number is kept over the fresh one.
    async fn queue_for_enrichment(&self, fresh: &Restaurant) -> Result<QueueOutcome, StoreError>;

    /// Move the row to `status`. Rejected with `StoreError::InvalidTransition` when
    /// the lifecycle does not allow it.
    async fn set_status(
        &self,
        place_id: &PlaceId,
        status: EnrichmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Mark `in_progress` (only from `queued`) and append an `initiated` call row,
    /// atomically.
    async fn record_call_started(
        &self,
        place_id: &PlaceId,
        provider_call_id: &ProviderCallId,
        at: DateTime<Utc>,
    ) -> Result<Call, StoreError>;

    /// Finalise a call exactly once. The restaurant only takes the report's status
    /// while it is `in_progress` on this very call (its latest one). Unknown call ids
    /// give `StoreError::CallNotFound` without mutating anything.
    async fn complete_call(&self, completion: &CallCompletion) -> Result<CallFinalised, StoreError>;

    async fn update_phone_number(
        &self,
        place_id: &PlaceId,
        phone_number: &str,
        at: DateTime<Utc>,
    ) -> Result<Restaurant, StoreError>;

    /// Call history for a restaurant, oldest first.
    async fn calls_for(&self, place_id: &PlaceId) -> Result<Vec<Call>, StoreError>;
}

#[async_trait]
impl<S> RestaurantStore for std::sync::Arc<S>
where
    S: RestaurantStore + ?Sized,
{
    async fn get_restaurant(&self, place_id: &PlaceId) -> Result<Option<Restaurant>, StoreError> {
        (**self).get_restaurant(place_id).await
    }

    async fn list_restaurants(&self) -> Result<Vec<Restaurant>, StoreError> {
        (**self).list_restaurants().await
    }

    async fn queue_for_enrichment(&self, fresh: &Restaurant) -> Result<QueueOutcome, StoreError> {
        (**self).queue_for_enrichment(fresh).await
    }

    async fn set_status(
        &self,
        place_id: &PlaceId,
        status: EnrichmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self).set_status(place_id, status, at).await
    }

    async fn record_call_started(
        &self,
        place_id: &PlaceId,
        provider_call_id: &ProviderCallId,
        at: DateTime<Utc>,
    ) -> Result<Call, StoreError> {
        (**self).record_call_started(place_id, provider_call_id, at).await
    }

    async fn complete_call(&self, completion: &CallCompletion) -> Result<CallFinalised, StoreError> {
        (**self).complete_call(completion).await
    }

    async fn update_phone_number(
        &self,
        place_id: &PlaceId,
        phone_number: &str,
        at: DateTime<Utc>,
    ) -> Result<Restaurant, StoreError> {
        (**self).update_phone_number(place_id, phone_number, at).await
    }

    async fn calls_for(&self, place_id: &PlaceId) -> Result<Vec<Call>, StoreError> {
        (**self).calls_for(place_id).await
    }
}
