use std::sync::Arc;

use chrono::{TimeZone, Utc};
use reqwest::StatusCode;
use serde_json::json;

use eatsavvy_api::app::services::AppServices;
use eatsavvy_core::{ManualClock, PlaceId, TimePoint, TimeRange};
use eatsavvy_infra::{
    external::{PlaceDetails, PlaceSummary, ScriptedCallClient, StaticPlaces},
    pipeline::{EnrichmentWorker, JobOutcome},
    queue::InMemoryJobQueue,
    store::InMemoryRestaurantStore,
};

const API_KEY: &str = "test-key";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    queue: Arc<InMemoryJobQueue>,
    worker: EnrichmentWorker,
}

impl TestServer {
    async fn spawn() -> Self {
        // Monday 18:00 UTC, inside the restaurant's hours.
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 3, 18, 0, 0).unwrap()));
        let store = Arc::new(InMemoryRestaurantStore::new());
        let queue = Arc::new(InMemoryJobQueue::new(clock.clone()));
        let places = Arc::new(
            StaticPlaces::new()
                .with_place(taqueria())
                .with_search(
                    "tacos seattle",
                    vec![
                        PlaceSummary {
                            place_id: place_id(),
                            name: "Taqueria Uno".into(),
                            primary_type: Some("mexican_restaurant".into()),
                        },
                        PlaceSummary {
                            place_id: PlaceId::new("ChIJ-hardware").unwrap(),
                            name: "Bolt Depot".into(),
                            primary_type: Some("hardware_store".into()),
                        },
                    ],
                ),
        );
        let calls = Arc::new(ScriptedCallClient::new());

        let services = Arc::new(AppServices::new(store.clone(), queue.clone(), places, clock.clone()));
        let worker = EnrichmentWorker::new(store, queue.clone(), calls, clock);

        // Build app (same router as prod), but bind to an ephemeral port.
        let app = eatsavvy_api::app::build_app(services, API_KEY);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            queue,
            worker,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn place_id() -> PlaceId {
    PlaceId::new("ChIJ-taqueria").unwrap()
}

fn taqueria() -> PlaceDetails {
    PlaceDetails {
        place_id: place_id(),
        name: "Taqueria Uno".into(),
        address: "1 Pike St, Seattle".into(),
        national_phone_number: Some("(206) 555-0100".into()),
        open_hours: (0..7)
            .map(|d| TimeRange::new(TimePoint::new(d, 11, 0).unwrap(), TimePoint::new(d, 23, 0).unwrap()))
            .collect(),
        rating: Some(4.6),
    }
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn browser_origins_are_allowed() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // Preflight carries no key and must not be rejected by auth.
    let res = client
        .request(reqwest::Method::OPTIONS, format!("{}/restaurant", srv.base_url))
        .header("origin", "http://localhost:5173")
        .header("access-control-request-method", "GET")
        .header("access-control-request-headers", "authorization")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "http://localhost:5173");

    let res = client
        .get(format!("{}/restaurant", srv.base_url))
        .header("origin", "https://eatsavvy.org")
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["access-control-allow-origin"], "https://eatsavvy.org");

    let res = client
        .get(format!("{}/health", srv.base_url))
        .header("origin", "https://evil.example")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/restaurant", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .post(format!("{}/process-eocr", srv.base_url))
        .bearer_auth("wrong-key")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/restaurant", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn request_errors_use_json_shape() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/restaurant/ChIJ-unknown", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "not_found");

    let res = client
        .post(format!("{}/enrich", srv.base_url))
        .bearer_auth(API_KEY)
        .json(&json!({ "ids": [] }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let res = client
        .post(format!("{}/search", srv.base_url))
        .bearer_auth(API_KEY)
        .json(&json!({ "q": "missing field" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "invalid_body");

    let res = client
        .post(format!("{}/process-eocr", srv.base_url))
        .bearer_auth(API_KEY)
        .json(&json!({ "message": { "call": { "id": "call-404" }, "endedReason": "customer-ended-call" } }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn search_filters_non_food_hits_and_returns_pending_stubs() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/search", srv.base_url))
        .bearer_auth(API_KEY)
        .json(&json!({ "query": "tacos seattle" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    let rows = body.as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], "ChIJ-taqueria");
    assert_eq!(rows[0]["enrichmentStatus"], "pending");
    assert!(srv.queue.published().is_empty());
}

#[tokio::test]
async fn enrich_then_webhook_completes_restaurant() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    // Enrich (twice: the second request must not enqueue another job)
    for _ in 0..2 {
        let res = client
            .post(format!("{}/enrich", srv.base_url))
            .bearer_auth(API_KEY)
            .json(&json!({ "ids": ["ChIJ-taqueria"] }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let body: serde_json::Value = res.json().await.unwrap();
        assert_eq!(body[0]["enrichmentStatus"], "queued");
        assert_eq!(body[0]["phoneNumber"], "(206) 555-0100");
    }
    assert_eq!(srv.queue.published().len(), 1);

    // Worker places the call
    let outcome = srv.worker.run_once().await.unwrap().unwrap();
    let JobOutcome::CallPlaced(call_id) = outcome else {
        panic!("expected a placed call, got {outcome:?}");
    };

    // Manual phone correction while the call is running
    let res = client
        .patch(format!("{}/restaurant/ChIJ-taqueria", srv.base_url))
        .bearer_auth(API_KEY)
        .json(&json!({ "phoneNumber": "1-206-555-0111" }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["phoneNumber"], "(206) 555-0111");
    assert_eq!(body["enrichmentStatus"], "in_progress");

    // Webhook
    let res = client
        .post(format!("{}/process-eocr", srv.base_url))
        .bearer_auth(API_KEY)
        .json(&json!({
            "message": {
                "call": { "id": call_id.as_str() },
                "endedReason": "customer-ended-call",
                "analysis": { "summary": "They fry in peanut oil", "successEvaluation": "true" },
                "artifact": {
                    "transcript": "AI: Hello\nUser: Hi",
                    "structuredOutputs": {
                        "slot-a": { "name": "cookingOils", "result": "peanut" },
                        "slot-b": { "name": "glutenFree", "result": false }
                    }
                }
            }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["enrichmentStatus"], "completed");
    assert_eq!(body["finalisation"], "applied");

    // Query
    let res = client
        .get(format!("{}/restaurant/ChIJ-taqueria", srv.base_url))
        .bearer_auth(API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["enrichmentStatus"], "completed");
    assert_eq!(body["nutritionInfo"], json!({ "cookingOils": "peanut", "glutenFree": false }));
    assert_eq!(body["phoneNumber"], "(206) 555-0111");

    // Nothing left in flight
    assert!(srv.worker.run_once().await.unwrap().is_none());
    assert_eq!(srv.queue.unacked_len(), 0);
}
