//! Deterministic stand-ins for the external services.
//!
//! Intended for tests/dev: `StaticPlaces` answers from a fixed table and
//! `ScriptedCallClient` plays back queued results, then succeeds.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use eatsavvy_core::{PlaceId, ProviderCallId, Restaurant};

use super::places::{PlaceDetails, PlaceLookup, PlaceSummary, PlacesError};
use super::vapi::{CallClient, CallError};

#[derive(Debug, Default)]
pub struct StaticPlaces {
    details: Mutex<HashMap<PlaceId, PlaceDetails>>,
    search_hits: Mutex<HashMap<String, Vec<PlaceSummary>>>,
    lookups: AtomicU64,
}

impl StaticPlaces {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_place(self, details: PlaceDetails) -> Self {
        self.insert(details);
        self
    }

    pub fn insert(&self, details: PlaceDetails) {
        if let Ok(mut map) = self.details.lock() {
            map.insert(details.place_id.clone(), details);
        }
    }

    pub fn with_search(self, query: impl Into<String>, hits: Vec<PlaceSummary>) -> Self {
        if let Ok(mut map) = self.search_hits.lock() {
            map.insert(query.into(), hits);
        }
        self
    }

    /// Number of `place_details` calls served.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PlaceLookup for StaticPlaces {
    async fn place_details(&self, place_id: &PlaceId) -> Result<PlaceDetails, PlacesError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let map = self
            .details
            .lock()
            .map_err(|_| PlacesError::Network("lock poisoned".into()))?;
        map.get(place_id)
            .cloned()
            .ok_or_else(|| PlacesError::NotFound(place_id.clone()))
    }

    async fn search_text(&self, query: &str) -> Result<Vec<PlaceSummary>, PlacesError> {
        let map = self
            .search_hits
            .lock()
            .map_err(|_| PlacesError::Network("lock poisoned".into()))?;
        Ok(map.get(query).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Default)]
pub struct ScriptedCallClient {
    script: Mutex<VecDeque<Result<ProviderCallId, CallError>>>,
    calls: Mutex<Vec<PlaceId>>,
    next_id: AtomicU64,
}

impl ScriptedCallClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the result of the next `create_call`.
    pub fn push(&self, result: Result<ProviderCallId, CallError>) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(result);
        }
    }

    /// Restaurants a call was attempted for, in order.
    pub fn attempts(&self) -> Vec<PlaceId> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CallClient for ScriptedCallClient {
    async fn create_call(&self, restaurant: &Restaurant) -> Result<ProviderCallId, CallError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(restaurant.place_id.clone());
        }

        let scripted = self.script.lock().ok().and_then(|mut s| s.pop_front());
        match scripted {
            Some(result) => result,
            None => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                ProviderCallId::new(format!("call-{n}")).map_err(|e| CallError::MalformedResponse(e.to_string()))
            }
        }
    }
}
