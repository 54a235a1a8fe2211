//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: the enrichment gateway and callback processor handlers share
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Extension, Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Browser origins allowed to call the API.
pub const ALLOWED_ORIGINS: [&str; 2] = ["https://eatsavvy.org", "http://localhost:5173"];

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(ALLOWED_ORIGINS.map(HeaderValue::from_static)))
        .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
}

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: Arc<services::AppServices>, api_key: impl Into<String>) -> Router {
    let auth_state = middleware::AuthState::new(api_key);

    // Protected routes: require the static bearer key.
    let protected = routes::router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            auth_state,
            middleware::auth_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        // Outside auth so preflight requests are answered without a key.
        .layer(ServiceBuilder::new().layer(cors()))
}
