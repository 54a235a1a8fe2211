use std::sync::Arc;

use anyhow::Context;

use eatsavvy_core::{Clock, SystemClock};
use eatsavvy_infra::{
    config::AppConfig,
    external::{GooglePlacesClient, PlaceLookup},
    pipeline::{CallbackProcessor, EnrichmentGateway},
    queue::{JobQueue, RedisJobQueue},
    store::{PostgresRestaurantStore, RestaurantStore},
};

/// Everything the handlers need, shared behind one `Arc`.
#[derive(Debug, Clone)]
pub struct AppServices {
    pub gateway: EnrichmentGateway,
    pub callbacks: CallbackProcessor,
}

impl AppServices {
    /// Wire the services over explicit components (tests use in-memory ones).
    pub fn new(
        store: Arc<dyn RestaurantStore>,
        queue: Arc<dyn JobQueue>,
        places: Arc<dyn PlaceLookup>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            gateway: EnrichmentGateway::new(store.clone(), queue, places, clock.clone()),
            callbacks: CallbackProcessor::new(store, clock),
        }
    }

    /// Production wiring: Postgres rows, Redis queue, Google Places.
    pub async fn connect(config: &AppConfig) -> anyhow::Result<Self> {
        let store = PostgresRestaurantStore::connect(&config.database_url)
            .await
            .context("connecting to postgres")?;
        let queue = RedisJobQueue::connect(&config.redis_url, &config.queue)
            .await
            .context("connecting to redis")?;
        let places = GooglePlacesClient::new(&config.places).context("building places client")?;

        tracing::info!(queue = %config.queue.name, "services connected");

        Ok(Self::new(
            Arc::new(store),
            Arc::new(queue),
            Arc::new(places),
            Arc::new(SystemClock),
        ))
    }
}
