//! Enrichment requests: dedup, row lock, publish.
//!
//! ## Flow
//!
//! 1. Read the row; if a job is active or the last enrichment is fresh, return it
//! 2. Fetch fresh details from Places
//! 3. Lock-and-upsert through the store (`queued`), or return the locked active row
//! 4. Publish the job; on failure mark the row `failed` and surface the error
//!
//! At most one `queued`/`in_progress` job exists per restaurant because step 3 is
//! the only way into `queued`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, instrument, warn};

use eatsavvy_core::phone::format_phone_number;
use eatsavvy_core::{Clock, EnrichmentJob, EnrichmentStatus, PlaceId, Restaurant};

use crate::external::{PlaceDetails, PlaceLookup, PlacesError};
use crate::queue::{JobQueue, QueueError};
use crate::store::{QueueOutcome, RestaurantStore, StoreError};

/// Upper bound on restaurants enriched by one search.
pub const MAX_SEARCH_AND_ENRICH: usize = 25;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EnrichmentError {
    #[error("restaurant not found: {0}")]
    NotFound(PlaceId),

    #[error("no restaurants match {0:?}")]
    NoMatches(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("places lookup failed: {0}")]
    Places(PlacesError),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("publish failed: {0}")]
    Publish(#[from] QueueError),
}

impl From<StoreError> for EnrichmentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::RestaurantNotFound(id) => EnrichmentError::NotFound(id),
            other => EnrichmentError::Store(other),
        }
    }
}

impl From<PlacesError> for EnrichmentError {
    fn from(e: PlacesError) -> Self {
        match e {
            PlacesError::NotFound(id) => EnrichmentError::NotFound(id),
            other => EnrichmentError::Places(other),
        }
    }
}

#[derive(Clone)]
pub struct EnrichmentGateway {
    store: Arc<dyn RestaurantStore>,
    queue: Arc<dyn JobQueue>,
    places: Arc<dyn PlaceLookup>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for EnrichmentGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrichmentGateway").finish_non_exhaustive()
    }
}

impl EnrichmentGateway {
    pub fn new(
        store: Arc<dyn RestaurantStore>,
        queue: Arc<dyn JobQueue>,
        places: Arc<dyn PlaceLookup>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            queue,
            places,
            clock,
        }
    }

    pub async fn restaurant(&self, place_id: &PlaceId) -> Result<Restaurant, EnrichmentError> {
        self.store
            .get_restaurant(place_id)
            .await?
            .ok_or_else(|| EnrichmentError::NotFound(place_id.clone()))
    }

    pub async fn restaurants(&self) -> Result<Vec<Restaurant>, EnrichmentError> {
        Ok(self.store.list_restaurants().await?)
    }

    /// Queue one restaurant for enrichment, or return it unchanged when a job is
    /// already active or the last enrichment is still fresh.
    #[instrument(skip(self), fields(place_id = %place_id), err)]
    pub async fn request_enrichment(&self, place_id: &PlaceId) -> Result<Restaurant, EnrichmentError> {
        let now = self.clock.now();

        if let Some(existing) = self.store.get_restaurant(place_id).await? {
            if existing.is_enrichment_current(now) {
                info!(status = %existing.enrichment_status, "enrichment current, skipping");
                return Ok(existing);
            }
        }

        let details = self.places.place_details(place_id).await?;
        let fresh = restaurant_from_details(details, now);

        let queued = match self.store.queue_for_enrichment(&fresh).await? {
            QueueOutcome::AlreadyActive(row) => {
                info!(status = %row.enrichment_status, "enrichment already active, skipping");
                return Ok(row);
            }
            QueueOutcome::Queued(row) => row,
        };

        let job = EnrichmentJob::new(queued.clone(), now);
        if let Err(err) = self.queue.publish(&job).await {
            error!(error = %err, "failed to publish enrichment job");
            if let Err(mark_err) = self
                .store
                .set_status(&queued.place_id, EnrichmentStatus::Failed, self.clock.now())
                .await
            {
                error!(error = %mark_err, "failed to mark restaurant failed after publish error");
            }
            return Err(err.into());
        }

        info!(job_id = %job.job_id, "enqueued enrichment job");
        Ok(queued)
    }

    /// Enrich each id in order; stops at the first error.
    pub async fn request_batch(&self, ids: &[PlaceId]) -> Result<Vec<Restaurant>, EnrichmentError> {
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            out.push(self.request_enrichment(id).await?);
        }
        Ok(out)
    }

    /// Text search; known restaurants come back as stored, unknown ones as `pending` stubs.
    #[instrument(skip(self), err)]
    pub async fn search(&self, query: &str) -> Result<Vec<Restaurant>, EnrichmentError> {
        let query = non_empty_query(query)?;
        let now = self.clock.now();

        let mut out = Vec::new();
        for hit in self.places.search_text(query).await? {
            if !hit.is_food_service() {
                continue;
            }
            match self.store.get_restaurant(&hit.place_id).await? {
                Some(stored) => out.push(stored),
                None => out.push(Restaurant::pending_stub(hit.place_id, hit.name, now)),
            }
        }
        Ok(out)
    }

    #[instrument(skip(self), err)]
    pub async fn search_and_enrich(&self, query: &str) -> Result<Vec<Restaurant>, EnrichmentError> {
        let query = non_empty_query(query)?;
        let ids: Vec<PlaceId> = self
            .places
            .search_text(query)
            .await?
            .into_iter()
            .filter(|hit| hit.is_food_service())
            .map(|hit| hit.place_id)
            .collect();

        if ids.is_empty() {
            return Err(EnrichmentError::NoMatches(query.to_string()));
        }
        if ids.len() > MAX_SEARCH_AND_ENRICH {
            return Err(EnrichmentError::Validation(format!(
                "query matched {} restaurants; narrow it to at most {}",
                ids.len(),
                MAX_SEARCH_AND_ENRICH
            )));
        }

        self.request_batch(&ids).await
    }

    /// Store a manually corrected phone number, normalised.
    #[instrument(skip(self, raw), fields(place_id = %place_id), err)]
    pub async fn update_phone_number(&self, place_id: &PlaceId, raw: &str) -> Result<Restaurant, EnrichmentError> {
        let formatted = format_phone_number(raw).map_err(|e| EnrichmentError::Validation(e.to_string()))?;
        Ok(self
            .store
            .update_phone_number(place_id, &formatted, self.clock.now())
            .await?)
    }
}

fn non_empty_query(query: &str) -> Result<&str, EnrichmentError> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(EnrichmentError::Validation("query must not be empty".into()));
    }
    Ok(trimmed)
}

/// Row to upsert from a Places lookup. Status and `created_at` are decided by the store.
fn restaurant_from_details(details: PlaceDetails, now: DateTime<Utc>) -> Restaurant {
    let phone_number = details.national_phone_number.as_deref().and_then(|raw| {
        format_phone_number(raw)
            .inspect_err(|e| warn!(place_id = %details.place_id, error = %e, "dropping unusable phone number"))
            .ok()
    });

    Restaurant {
        place_id: details.place_id,
        name: details.name,
        address: details.address,
        phone_number,
        open_hours: details.open_hours,
        nutrition_info: None,
        enrichment_status: EnrichmentStatus::Queued,
        rating: details.rating,
        created_at: now,
        updated_at: now,
    }
}
