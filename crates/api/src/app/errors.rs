use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use eatsavvy_infra::pipeline::{CallbackError, EnrichmentError};

pub fn enrichment_error_to_response(err: EnrichmentError) -> axum::response::Response {
    match err {
        EnrichmentError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        e @ EnrichmentError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", e.to_string()),
        e @ EnrichmentError::NoMatches(_) => json_error(StatusCode::NOT_FOUND, "no_matches", e.to_string()),
        e @ EnrichmentError::Places(_) => json_error(StatusCode::BAD_GATEWAY, "places_error", e.to_string()),
        e @ EnrichmentError::Publish(_) => json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string()),
        e @ EnrichmentError::Store(_) => {
            tracing::error!(error = %e, "store failure while serving request");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn callback_error_to_response(err: CallbackError) -> axum::response::Response {
    match err {
        CallbackError::Invalid(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_report", msg),
        e @ CallbackError::CallNotFound(_) => json_error(StatusCode::NOT_FOUND, "call_not_found", e.to_string()),
        e @ CallbackError::Store(_) => {
            tracing::error!(error = %e, "store failure while processing end-of-call report");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

/// Malformed or mistyped JSON bodies become the same `{error, message}` shape.
pub fn rejection_to_response(rejection: JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_body", rejection.body_text())
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
