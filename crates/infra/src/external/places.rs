//! Google Places lookups.
//!
//! Opening periods come back in the place's local time as `{day, hour, minute}`
//! triples; they are shifted by `utcOffsetMinutes` into UTC week points here, so the
//! rest of the pipeline only ever sees UTC [`TimeRange`]s.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use eatsavvy_core::hours::MINUTES_PER_WEEK;
use eatsavvy_core::{PlaceId, TimePoint, TimeRange};

use crate::config::PlacesConfig;

const DETAILS_FIELDS: &[&str] = &[
    "id",
    "displayName",
    "currentOpeningHours",
    "regularOpeningHours",
    "nationalPhoneNumber",
    "formattedAddress",
    "utcOffsetMinutes",
    "rating",
];

const SEARCH_FIELDS: &[&str] = &["id", "displayName", "primaryType"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, thiserror::Error)]
pub enum PlacesError {
    #[error("places request failed: {0}")]
    Network(String),
    #[error("places API returned {0}: {1}")]
    Api(u16, String),
    #[error("place not found: {0}")]
    NotFound(PlaceId),
    #[error("malformed places response: {0}")]
    Parse(String),
}

/// What the gateway needs from a place to build a restaurant row.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceDetails {
    pub place_id: PlaceId,
    pub name: String,
    pub address: String,
    /// As returned by the provider, not yet normalised.
    pub national_phone_number: Option<String>,
    pub open_hours: Vec<TimeRange>,
    pub rating: Option<f64>,
}

/// A text-search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceSummary {
    pub place_id: PlaceId,
    pub name: String,
    pub primary_type: Option<String>,
}

impl PlaceSummary {
    /// Whether the hit is somewhere that serves food. Hits without a type are kept.
    pub fn is_food_service(&self) -> bool {
        match self.primary_type.as_deref() {
            None => true,
            Some(t) => {
                t.ends_with("restaurant")
                    || matches!(t, "cafe" | "bakery" | "bar" | "meal_takeaway" | "meal_delivery" | "diner")
            }
        }
    }
}

#[async_trait]
pub trait PlaceLookup: Send + Sync {
    async fn place_details(&self, place_id: &PlaceId) -> Result<PlaceDetails, PlacesError>;

    async fn search_text(&self, query: &str) -> Result<Vec<PlaceSummary>, PlacesError>;
}

#[async_trait]
impl<P> PlaceLookup for std::sync::Arc<P>
where
    P: PlaceLookup + ?Sized,
{
    async fn place_details(&self, place_id: &PlaceId) -> Result<PlaceDetails, PlacesError> {
        (**self).place_details(place_id).await
    }

    async fn search_text(&self, query: &str) -> Result<Vec<PlaceSummary>, PlacesError> {
        (**self).search_text(query).await
    }
}

#[derive(Debug, Clone)]
pub struct GooglePlacesClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GooglePlacesClient {
    pub fn new(config: &PlacesConfig) -> Result<Self, PlacesError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| PlacesError::Network(e.to_string()))?;
        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PlaceLookup for GooglePlacesClient {
    #[instrument(skip(self), fields(place_id = %place_id), err)]
    async fn place_details(&self, place_id: &PlaceId) -> Result<PlaceDetails, PlacesError> {
        let resp = self
            .http
            .get(format!("{}/v1/places/{}", self.base_url, place_id.as_str()))
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", DETAILS_FIELDS.join(","))
            .send()
            .await
            .map_err(|e| PlacesError::Network(e.to_string()))?;

        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(PlacesError::NotFound(place_id.clone()));
        }
        if !status.is_success() {
            return Err(PlacesError::Api(status.as_u16(), resp.text().await.unwrap_or_default()));
        }

        let place: RawPlace = resp.json().await.map_err(|e| PlacesError::Parse(e.to_string()))?;
        place.into_details()
    }

    #[instrument(skip(self), err)]
    async fn search_text(&self, query: &str) -> Result<Vec<PlaceSummary>, PlacesError> {
        let resp = self
            .http
            .post(format!("{}/v1/places:searchText", self.base_url))
            .header("X-Goog-Api-Key", &self.api_key)
            .header("X-Goog-FieldMask", field_mask(SEARCH_FIELDS))
            .json(&SearchTextRequest { text_query: query })
            .send()
            .await
            .map_err(|e| PlacesError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PlacesError::Api(status.as_u16(), resp.text().await.unwrap_or_default()));
        }

        let body: SearchTextResponse = resp.json().await.map_err(|e| PlacesError::Parse(e.to_string()))?;
        body.places
            .into_iter()
            .map(|p| {
                Ok(PlaceSummary {
                    place_id: PlaceId::new(p.id).map_err(|e| PlacesError::Parse(e.to_string()))?,
                    name: p.display_name.map(|d| d.text).unwrap_or_default(),
                    primary_type: p.primary_type,
                })
            })
            .collect()
    }
}

/// Text search wants every field qualified with `places.`.
fn field_mask(fields: &[&str]) -> String {
    fields
        .iter()
        .map(|f| {
            if f.starts_with("places.") {
                f.to_string()
            } else {
                format!("places.{f}")
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchTextRequest<'a> {
    text_query: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct SearchTextResponse {
    #[serde(default)]
    places: Vec<RawPlace>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlace {
    id: String,
    display_name: Option<DisplayName>,
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    national_phone_number: Option<String>,
    #[serde(default)]
    current_opening_hours: Option<OpeningHours>,
    #[serde(default)]
    regular_opening_hours: Option<OpeningHours>,
    #[serde(default)]
    utc_offset_minutes: i32,
    #[serde(default)]
    rating: Option<f64>,
    #[serde(default)]
    primary_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DisplayName {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct OpeningHours {
    #[serde(default)]
    periods: Vec<Period>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Period {
    pub open: Slot,
    #[serde(default)]
    pub close: Option<Slot>,
}

/// Local-time week point as Places encodes it.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Slot {
    pub day: i64,
    #[serde(default)]
    pub hour: i64,
    #[serde(default)]
    pub minute: i64,
}

impl RawPlace {
    fn into_details(self) -> Result<PlaceDetails, PlacesError> {
        let periods = match (self.current_opening_hours, self.regular_opening_hours) {
            (Some(current), _) if !current.periods.is_empty() => current.periods,
            (_, Some(regular)) => regular.periods,
            _ => Vec::new(),
        };

        Ok(PlaceDetails {
            place_id: PlaceId::new(self.id).map_err(|e| PlacesError::Parse(e.to_string()))?,
            name: self.display_name.map(|d| d.text).unwrap_or_default(),
            address: self.formatted_address.unwrap_or_default(),
            national_phone_number: self.national_phone_number.filter(|p| !p.trim().is_empty()),
            open_hours: periods_to_ranges(&periods, self.utc_offset_minutes)?,
            rating: self.rating,
        })
    }
}

/// Convert local opening periods to UTC week ranges.
///
/// A period without a close is open around the clock and becomes a range whose open
/// equals its close.
pub fn periods_to_ranges(periods: &[Period], utc_offset_minutes: i32) -> Result<Vec<TimeRange>, PlacesError> {
    periods
        .iter()
        .map(|period| {
            let open = to_utc(period.open, utc_offset_minutes)?;
            let close = match period.close {
                Some(close) => to_utc(close, utc_offset_minutes)?,
                None => open,
            };
            Ok(TimeRange::new(open, close))
        })
        .collect()
}

fn to_utc(slot: Slot, utc_offset_minutes: i32) -> Result<TimePoint, PlacesError> {
    // Validate the local triple before shifting it.
    let local = TimePoint::new(
        u8::try_from(slot.day).map_err(|_| PlacesError::Parse(format!("day out of range: {}", slot.day)))?,
        u8::try_from(slot.hour).map_err(|_| PlacesError::Parse(format!("hour out of range: {}", slot.hour)))?,
        u8::try_from(slot.minute).map_err(|_| PlacesError::Parse(format!("minute out of range: {}", slot.minute)))?,
    )
    .map_err(|e| PlacesError::Parse(e.to_string()))?;

    let week = i64::from(MINUTES_PER_WEEK);
    let shifted = (i64::from(local.minutes_since_week_start()) - i64::from(utc_offset_minutes)).rem_euclid(week);
    Ok(TimePoint::from_week_minutes(shifted as u32))
}
