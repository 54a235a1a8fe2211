use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use eatsavvy_core::{Call, CallStatus, EnrichmentStatus, PlaceId, ProviderCallId, Restaurant};

use super::{CallCompletion, CallFinalised, Finalisation, QueueOutcome, RestaurantStore, StoreError};

#[derive(Debug, Default)]
struct State {
    restaurants: BTreeMap<PlaceId, Restaurant>,
    calls: Vec<Call>,
}

/// In-memory restaurant store.
///
/// Intended for tests/dev. Every operation runs under one mutex, which gives the
/// check-and-upsert in `queue_for_enrichment` the same atomicity as the row lock.
#[derive(Debug, Default)]
pub struct InMemoryRestaurantStore {
    state: Mutex<State>,
    fail_call_records: AtomicBool,
}

impl InMemoryRestaurantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row as-is.
    pub fn insert(&self, restaurant: Restaurant) {
        if let Ok(mut state) = self.state.lock() {
            state.restaurants.insert(restaurant.place_id.clone(), restaurant);
        }
    }

    /// Make `record_call_started` fail until switched back off.
    pub fn fail_call_records(&self, fail: bool) {
        self.fail_call_records.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl RestaurantStore for InMemoryRestaurantStore {
    async fn get_restaurant(&self, place_id: &PlaceId) -> Result<Option<Restaurant>, StoreError> {
        Ok(self.lock()?.restaurants.get(place_id).cloned())
    }

    async fn list_restaurants(&self) -> Result<Vec<Restaurant>, StoreError> {
        let mut rows: Vec<Restaurant> = self.lock()?.restaurants.values().cloned().collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.place_id.cmp(&b.place_id)));
        Ok(rows)
    }

    async fn queue_for_enrichment(&self, fresh: &Restaurant) -> Result<QueueOutcome, StoreError> {
        let mut state = self.lock()?;

        let queued = match state.restaurants.get(&fresh.place_id) {
            Some(existing) if existing.enrichment_status.is_active() => {
                return Ok(QueueOutcome::AlreadyActive(existing.clone()));
            }
            Some(existing) => Restaurant {
                place_id: existing.place_id.clone(),
                name: fresh.name.clone(),
                address: fresh.address.clone(),
                phone_number: existing.phone_number.clone().or_else(|| fresh.phone_number.clone()),
                open_hours: fresh.open_hours.clone(),
                nutrition_info: existing.nutrition_info.clone(),
                enrichment_status: EnrichmentStatus::Queued,
                rating: fresh.rating,
                created_at: existing.created_at,
                updated_at: fresh.updated_at,
            },
            None => Restaurant {
                nutrition_info: None,
                enrichment_status: EnrichmentStatus::Queued,
                created_at: fresh.updated_at,
                ..fresh.clone()
            },
        };

        state.restaurants.insert(queued.place_id.clone(), queued.clone());
        Ok(QueueOutcome::Queued(queued))
    }

    async fn set_status(
        &self,
        place_id: &PlaceId,
        status: EnrichmentStatus,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock()?;
        let row = state
            .restaurants
            .get_mut(place_id)
            .ok_or_else(|| StoreError::RestaurantNotFound(place_id.clone()))?;
        check_transition(row, status)?;
        row.enrichment_status = status;
        row.updated_at = at;
        Ok(())
    }

    async fn record_call_started(
        &self,
        place_id: &PlaceId,
        provider_call_id: &ProviderCallId,
        at: DateTime<Utc>,
    ) -> Result<Call, StoreError> {
        if self.fail_call_records.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("injected failure in record_call_started".to_string()));
        }

        let mut state = self.lock()?;
        if state.calls.iter().any(|c| &c.provider_call_id == provider_call_id) {
            return Err(StoreError::Storage(format!("duplicate call id {provider_call_id}")));
        }
        let row = state
            .restaurants
            .get_mut(place_id)
            .ok_or_else(|| StoreError::RestaurantNotFound(place_id.clone()))?;
        check_transition(row, EnrichmentStatus::InProgress)?;
        row.enrichment_status = EnrichmentStatus::InProgress;
        row.updated_at = at;

        let call = Call::initiated(place_id.clone(), provider_call_id.clone(), at);
        state.calls.push(call.clone());
        Ok(call)
    }

    async fn complete_call(&self, completion: &CallCompletion) -> Result<CallFinalised, StoreError> {
        let mut state = self.lock()?;

        let index = state
            .calls
            .iter()
            .position(|c| c.provider_call_id == completion.provider_call_id)
            .ok_or_else(|| StoreError::CallNotFound(completion.provider_call_id.clone()))?;
        let place_id = state.calls[index].place_id.clone();

        if state.calls[index].status == CallStatus::Completed {
            return Ok(CallFinalised {
                place_id,
                finalisation: Finalisation::Duplicate,
            });
        }
        let restaurant = state
            .restaurants
            .get(&place_id)
            .ok_or_else(|| StoreError::RestaurantNotFound(place_id.clone()))?;

        // Calls are appended in start order, so the last one for the place is current.
        let latest = state.calls.iter().rposition(|c| c.place_id == place_id);
        let owns_restaurant = latest == Some(index)
            && restaurant.enrichment_status == EnrichmentStatus::InProgress
            && restaurant.enrichment_status.can_transition_to(completion.final_status);

        let call = &mut state.calls[index];
        call.status = CallStatus::Completed;
        call.transcript = Some(completion.transcript.clone());
        call.structured_outputs = Some(completion.structured_outputs.clone());
        call.summary = Some(completion.summary.clone());
        call.success_evaluation = completion.success_evaluation.clone();
        call.ended_reason = Some(completion.ended_reason.clone());
        call.updated_at = completion.completed_at;

        if !owns_restaurant {
            return Ok(CallFinalised {
                place_id,
                finalisation: Finalisation::Superseded,
            });
        }

        if let Some(row) = state.restaurants.get_mut(&place_id) {
            row.nutrition_info = Some(completion.nutrition_info.clone());
            row.enrichment_status = completion.final_status;
            row.updated_at = completion.completed_at;
        }
        Ok(CallFinalised {
            place_id,
            finalisation: Finalisation::Applied,
        })
    }

    async fn update_phone_number(
        &self,
        place_id: &PlaceId,
        phone_number: &str,
        at: DateTime<Utc>,
    ) -> Result<Restaurant, StoreError> {
        let mut state = self.lock()?;
        let row = state
            .restaurants
            .get_mut(place_id)
            .ok_or_else(|| StoreError::RestaurantNotFound(place_id.clone()))?;
        row.phone_number = Some(phone_number.to_string());
        row.updated_at = at;
        Ok(row.clone())
    }

    async fn calls_for(&self, place_id: &PlaceId) -> Result<Vec<Call>, StoreError> {
        Ok(self
            .lock()?
            .calls
            .iter()
            .filter(|c| &c.place_id == place_id)
            .cloned()
            .collect())
    }
}

fn check_transition(row: &Restaurant, to: EnrichmentStatus) -> Result<(), StoreError> {
    if row.enrichment_status.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition {
            place_id: row.place_id.clone(),
            from: row.enrichment_status,
            to,
        })
    }
}
