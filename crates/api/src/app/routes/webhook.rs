use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use eatsavvy_infra::pipeline::CallbackProcessor;

use crate::app::errors;
use crate::app::services::AppServices;

/// Inbound end-of-call report from the voice provider.
pub async fn process_end_of_call_report(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    let report = match CallbackProcessor::parse(body) {
        Ok(r) => r,
        Err(e) => return errors::callback_error_to_response(e),
    };

    match services.callbacks.process_report(&report).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "restaurantId": outcome.place_id,
                "enrichmentStatus": outcome.status,
                "finalisation": outcome.finalisation,
            })),
        )
            .into_response(),
        Err(e) => errors::callback_error_to_response(e),
    }
}
