use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use eatsavvy_core::PlaceId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

fn parse_place_id(raw: &str) -> Result<PlaceId, axum::response::Response> {
    PlaceId::new(raw).map_err(|e| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()))
}

pub async fn list_restaurants(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.gateway.restaurants().await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => errors::enrichment_error_to_response(e),
    }
}

pub async fn get_restaurant(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let place_id = match parse_place_id(&id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match services.gateway.restaurant(&place_id).await {
        Ok(row) => (StatusCode::OK, Json(row)).into_response(),
        Err(e) => errors::enrichment_error_to_response(e),
    }
}

pub async fn update_phone_number(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Result<Json<dto::UpdatePhoneRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };
    let place_id = match parse_place_id(&id) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    match services.gateway.update_phone_number(&place_id, &body.phone_number).await {
        Ok(row) => (StatusCode::OK, Json(row)).into_response(),
        Err(e) => errors::enrichment_error_to_response(e),
    }
}

pub async fn search(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::SearchRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    match services.gateway.search(&body.query).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => errors::enrichment_error_to_response(e),
    }
}

pub async fn enrich(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::EnrichRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };
    if body.ids.is_empty() {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "ids must not be empty");
    }

    let mut ids = Vec::with_capacity(body.ids.len());
    for raw in &body.ids {
        match parse_place_id(raw) {
            Ok(id) => ids.push(id),
            Err(resp) => return resp,
        }
    }

    match services.gateway.request_batch(&ids).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => errors::enrichment_error_to_response(e),
    }
}

pub async fn search_and_enrich(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::SearchRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::rejection_to_response(rejection),
    };

    match services.gateway.search_and_enrich(&body.query).await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => errors::enrichment_error_to_response(e),
    }
}
