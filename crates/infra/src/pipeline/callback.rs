//! End-of-call report handling.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use eatsavvy_core::{Clock, DomainError, EndOfCallReport, EnrichmentStatus, PlaceId, ProviderCallId};

use crate::store::{CallCompletion, Finalisation, RestaurantStore, StoreError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CallbackError {
    #[error("invalid end-of-call report: {0}")]
    Invalid(String),

    #[error("unknown call: {0}")]
    CallNotFound(ProviderCallId),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<DomainError> for CallbackError {
    fn from(e: DomainError) -> Self {
        CallbackError::Invalid(e.to_string())
    }
}

impl From<StoreError> for CallbackError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::CallNotFound(id) => CallbackError::CallNotFound(id),
            other => CallbackError::Store(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub place_id: PlaceId,
    pub call_id: ProviderCallId,
    /// Verdict of the report itself.
    pub status: EnrichmentStatus,
    pub finalisation: Finalisation,
}

#[derive(Clone)]
pub struct CallbackProcessor {
    store: Arc<dyn RestaurantStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for CallbackProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackProcessor").finish_non_exhaustive()
    }
}

impl CallbackProcessor {
    pub fn new(store: Arc<dyn RestaurantStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Parse a raw webhook body.
    pub fn parse(body: serde_json::Value) -> Result<EndOfCallReport, CallbackError> {
        serde_json::from_value(body).map_err(|e| CallbackError::Invalid(e.to_string()))
    }

    /// Finalise the call and its restaurant from a report.
    ///
    /// The restaurant ends `completed` only when the call was judged successful and
    /// the restaurant hung up normally; anything else ends `failed`. The call row and
    /// the restaurant are written together or not at all. A replayed report is
    /// accepted but writes nothing, and a report for a call that is no longer the
    /// restaurant's running call only completes the call row.
    #[instrument(skip(self, report), fields(call_id = %report.message.call.id), err)]
    pub async fn process_report(&self, report: &EndOfCallReport) -> Result<CallbackOutcome, CallbackError> {
        let call_id = report.call_id()?;
        let status = report.final_status();

        let completion = CallCompletion {
            provider_call_id: call_id.clone(),
            transcript: report.message.artifact.transcript.clone(),
            structured_outputs: report.structured_outputs_json(),
            summary: report.message.analysis.summary.clone(),
            success_evaluation: report.success_evaluation_text(),
            ended_reason: report.message.ended_reason.clone(),
            nutrition_info: report.nutrition_info(),
            final_status: status,
            completed_at: self.clock.now(),
        };

        let finalised = self.store.complete_call(&completion).await?;
        match finalised.finalisation {
            Finalisation::Applied => info!(place_id = %finalised.place_id, status = %status, "call finalised"),
            Finalisation::Superseded => {
                warn!(place_id = %finalised.place_id, "late report for a superseded call; restaurant untouched")
            }
            Finalisation::Duplicate => info!(place_id = %finalised.place_id, "report already processed"),
        }

        Ok(CallbackOutcome {
            place_id: finalised.place_id,
            call_id,
            status,
            finalisation: finalised.finalisation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use eatsavvy_core::{CallStatus, ManualClock, Restaurant};
    use serde_json::json;

    use crate::store::InMemoryRestaurantStore;

    async fn setup() -> (Arc<InMemoryRestaurantStore>, CallbackProcessor) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 12, 0, 0).unwrap()));
        let store = Arc::new(InMemoryRestaurantStore::new());
        let place = PlaceId::new("p1").unwrap();
        let mut r = Restaurant::pending_stub(place.clone(), "Diner", clock.now());
        r.enrichment_status = EnrichmentStatus::Queued;
        store.insert(r);
        store
            .record_call_started(&place, &ProviderCallId::new("call-1").unwrap(), clock.now())
            .await
            .unwrap();
        let processor = CallbackProcessor::new(store.clone(), clock);
        (store, processor)
    }

    fn body(call_id: &str, success: serde_json::Value, ended: &str) -> serde_json::Value {
        json!({
            "message": {
                "call": {"id": call_id},
                "endedReason": ended,
                "analysis": {"summary": "Friendly chat", "successEvaluation": success},
                "artifact": {
                    "transcript": "AI: Hi\nUser: Hello",
                    "structuredOutputs": {
                        "slot-1": {"name": "cookingOils", "result": "canola"},
                        "slot-2": {"name": "nutAllergies", "result": "no nuts"}
                    }
                }
            }
        })
    }

    #[tokio::test]
    async fn successful_report_completes_with_collapsed_nutrition() {
        let (store, processor) = setup().await;
        let report = CallbackProcessor::parse(body("call-1", json!("true"), "customer-ended-call")).unwrap();

        let outcome = processor.process_report(&report).await.unwrap();
        assert_eq!(outcome.status, EnrichmentStatus::Completed);
        assert_eq!(outcome.finalisation, Finalisation::Applied);

        let row = store.get_restaurant(&outcome.place_id).await.unwrap().unwrap();
        assert_eq!(row.enrichment_status, EnrichmentStatus::Completed);
        assert_eq!(
            row.nutrition_info,
            Some(json!({"cookingOils": "canola", "nutAllergies": "no nuts"}))
        );
        let calls = store.calls_for(&outcome.place_id).await.unwrap();
        assert_eq!(calls[0].summary.as_deref(), Some("Friendly chat"));
        assert_eq!(calls[0].success_evaluation.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn unsuccessful_or_abnormal_report_fails() {
        let (_, processor) = setup().await;
        let report = CallbackProcessor::parse(body("call-1", json!(true), "silence-timed-out")).unwrap();
        assert_eq!(
            processor.process_report(&report).await.unwrap().status,
            EnrichmentStatus::Failed
        );

        let (_, processor) = setup().await;
        let report = CallbackProcessor::parse(body("call-1", json!("false"), "customer-ended-call")).unwrap();
        assert_eq!(
            processor.process_report(&report).await.unwrap().status,
            EnrichmentStatus::Failed
        );
    }

    #[tokio::test]
    async fn unknown_or_empty_call_id_is_rejected() {
        let (store, processor) = setup().await;

        let unknown = CallbackProcessor::parse(body("call-9", json!(true), "customer-ended-call")).unwrap();
        assert!(matches!(
            processor.process_report(&unknown).await,
            Err(CallbackError::CallNotFound(_))
        ));

        let empty = CallbackProcessor::parse(body("  ", json!(true), "customer-ended-call")).unwrap();
        assert!(matches!(
            processor.process_report(&empty).await,
            Err(CallbackError::Invalid(_))
        ));

        let row = store.get_restaurant(&PlaceId::new("p1").unwrap()).await.unwrap().unwrap();
        assert_eq!(row.enrichment_status, EnrichmentStatus::InProgress);
        assert!(CallbackProcessor::parse(json!({"message": {}})).is_err());
    }

    #[tokio::test]
    async fn replayed_report_does_not_touch_the_newer_call() {
        let (store, processor) = setup().await;
        let place = PlaceId::new("p1").unwrap();

        let first = CallbackProcessor::parse(body("call-1", json!(true), "customer-ended-call")).unwrap();
        processor.process_report(&first).await.unwrap();

        // Re-enriched later: call-2 is now running.
        let fresh = store.get_restaurant(&place).await.unwrap().unwrap();
        store.queue_for_enrichment(&fresh).await.unwrap();
        let now = Utc.with_ymd_and_hms(2025, 4, 7, 12, 0, 0).unwrap();
        store
            .record_call_started(&place, &ProviderCallId::new("call-2").unwrap(), now)
            .await
            .unwrap();

        let replay = CallbackProcessor::parse(body("call-1", json!("false"), "silence-timed-out")).unwrap();
        let outcome = processor.process_report(&replay).await.unwrap();
        assert_eq!(outcome.finalisation, Finalisation::Duplicate);

        let row = store.get_restaurant(&place).await.unwrap().unwrap();
        assert_eq!(row.enrichment_status, EnrichmentStatus::InProgress);
        assert_eq!(
            row.nutrition_info,
            Some(json!({"cookingOils": "canola", "nutAllergies": "no nuts"}))
        );
        let calls = store.calls_for(&place).await.unwrap();
        assert_eq!(calls[0].ended_reason.as_deref(), Some("customer-ended-call"));
        assert_eq!(calls[1].status, CallStatus::Initiated);
    }

    #[tokio::test]
    async fn late_report_for_superseded_call_only_completes_the_call_row() {
        let (store, processor) = setup().await;
        let place = PlaceId::new("p1").unwrap();
        let now = Utc.with_ymd_and_hms(2025, 3, 3, 13, 0, 0).unwrap();

        // call-1 never reported back; the restaurant was failed and re-queued.
        store.set_status(&place, EnrichmentStatus::Failed, now).await.unwrap();
        let row = store.get_restaurant(&place).await.unwrap().unwrap();
        store.queue_for_enrichment(&row).await.unwrap();
        store
            .record_call_started(&place, &ProviderCallId::new("call-2").unwrap(), now)
            .await
            .unwrap();

        let late = CallbackProcessor::parse(body("call-1", json!(true), "customer-ended-call")).unwrap();
        let outcome = processor.process_report(&late).await.unwrap();
        assert_eq!(outcome.finalisation, Finalisation::Superseded);

        let row = store.get_restaurant(&place).await.unwrap().unwrap();
        assert_eq!(row.enrichment_status, EnrichmentStatus::InProgress);
        assert_eq!(row.nutrition_info, None);
        let calls = store.calls_for(&place).await.unwrap();
        assert_eq!(calls[0].status, CallStatus::Completed);

        // call-2's own report still lands.
        let current = CallbackProcessor::parse(body("call-2", json!(true), "customer-ended-call")).unwrap();
        let outcome = processor.process_report(&current).await.unwrap();
        assert_eq!(outcome.finalisation, Finalisation::Applied);
        let row = store.get_restaurant(&place).await.unwrap().unwrap();
        assert_eq!(row.enrichment_status, EnrichmentStatus::Completed);
    }
}
