use axum::{
    routing::{get, post},
    Router,
};

pub mod restaurants;
pub mod system;
pub mod webhook;

/// Router for all authenticated endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/restaurant", get(restaurants::list_restaurants))
        .route(
            "/restaurant/:id",
            get(restaurants::get_restaurant).patch(restaurants::update_phone_number),
        )
        .route("/search", post(restaurants::search))
        .route("/enrich", post(restaurants::enrich))
        .route("/search-and-enrich", post(restaurants::search_and_enrich))
        .route("/process-eocr", post(webhook::process_end_of_call_report))
}
