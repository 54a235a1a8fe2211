//! Restaurant and call records plus the enrichment state machine.

use core::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::DomainError;
use crate::hours::TimeRange;
use crate::id::{PlaceId, ProviderCallId};

/// How long a completed enrichment stays fresh before it may be redone.
pub const DEDUP_WINDOW_DAYS: i64 = 30;

pub fn dedup_window() -> ChronoDuration {
    ChronoDuration::days(DEDUP_WINDOW_DAYS)
}

/// Enrichment lifecycle of a restaurant.
///
/// ```text
/// pending ──▶ queued ──▶ in_progress ──▶ completed
///               ▲   │          │              │ (older than the dedup window)
///               │   ▼          ▼              │
///               └── failed ◀───┘              │
///               └─────────────────────────────┘
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
}

impl EnrichmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentStatus::Pending => "pending",
            EnrichmentStatus::Queued => "queued",
            EnrichmentStatus::InProgress => "in_progress",
            EnrichmentStatus::Completed => "completed",
            EnrichmentStatus::Failed => "failed",
        }
    }

    /// A job exists (or is about to) for this restaurant.
    pub fn is_active(&self) -> bool {
        matches!(self, EnrichmentStatus::Queued | EnrichmentStatus::InProgress)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `completed → queued` is allowed here; the dedup window is checked separately
    /// because it depends on the row's timestamp.
    pub fn can_transition_to(&self, next: EnrichmentStatus) -> bool {
        use EnrichmentStatus::*;
        match (self, next) {
            (Pending | Failed | Completed, Queued) => true,
            (Queued, InProgress | Failed) => true,
            (InProgress, Completed | Failed) => true,
            _ => false,
        }
    }
}

impl core::fmt::Display for EnrichmentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EnrichmentStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EnrichmentStatus::Pending),
            "queued" => Ok(EnrichmentStatus::Queued),
            "in_progress" => Ok(EnrichmentStatus::InProgress),
            "completed" => Ok(EnrichmentStatus::Completed),
            "failed" => Ok(EnrichmentStatus::Failed),
            other => Err(DomainError::validation(format!("unknown enrichment status: {other}"))),
        }
    }
}

/// A restaurant row as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Restaurant {
    #[serde(rename = "id")]
    pub place_id: PlaceId,
    pub name: String,
    #[serde(default)]
    pub address: String,
    /// Canonical `(XXX) XXX-XXXX` when present.
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub open_hours: Vec<TimeRange>,
    /// `{ slot name → extracted value }` once enriched.
    #[serde(default)]
    pub nutrition_info: Option<JsonValue>,
    pub enrichment_status: EnrichmentStatus,
    #[serde(default)]
    pub rating: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Restaurant {
    /// A search hit that has never been stored.
    pub fn pending_stub(place_id: PlaceId, name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            place_id,
            name: name.into(),
            address: String::new(),
            phone_number: None,
            open_hours: Vec::new(),
            nutrition_info: None,
            enrichment_status: EnrichmentStatus::Pending,
            rating: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// True when a new enrichment request must be a no-op: a job is already queued
    /// or running, or the last successful enrichment is inside the dedup window.
    pub fn is_enrichment_current(&self, now: DateTime<Utc>) -> bool {
        match self.enrichment_status {
            EnrichmentStatus::Queued | EnrichmentStatus::InProgress => true,
            EnrichmentStatus::Completed => self.updated_at > now - dedup_window(),
            EnrichmentStatus::Pending | EnrichmentStatus::Failed => false,
        }
    }
}

/// Lifecycle of a single outbound call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Completed,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Initiated => "initiated",
            CallStatus::Completed => "completed",
        }
    }
}

impl FromStr for CallStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(CallStatus::Initiated),
            "completed" => Ok(CallStatus::Completed),
            other => Err(DomainError::validation(format!("unknown call status: {other}"))),
        }
    }
}

/// One call placed for a restaurant. Restaurants accumulate a history of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Call {
    pub place_id: PlaceId,
    pub provider_call_id: ProviderCallId,
    pub status: CallStatus,
    pub transcript: Option<String>,
    pub structured_outputs: Option<JsonValue>,
    pub summary: Option<String>,
    pub success_evaluation: Option<String>,
    pub ended_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Call {
    pub fn initiated(place_id: PlaceId, provider_call_id: ProviderCallId, now: DateTime<Utc>) -> Self {
        Self {
            place_id,
            provider_call_id,
            status: CallStatus::Initiated,
            transcript: None,
            structured_outputs: None,
            summary: None,
            success_evaluation: None,
            ended_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}
