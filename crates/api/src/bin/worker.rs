//! Enrichment worker: consumes jobs, places calls when restaurants are open.

use std::sync::Arc;

use anyhow::Context;

use eatsavvy_core::SystemClock;
use eatsavvy_infra::{
    config::AppConfig,
    external::VapiClient,
    pipeline::EnrichmentWorker,
    queue::RedisJobQueue,
    retry::RetryPolicy,
    store::PostgresRestaurantStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eatsavvy_observability::init();

    let config = AppConfig::from_env().context("loading configuration")?;

    let store = PostgresRestaurantStore::connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    let queue = RedisJobQueue::connect(&config.redis_url, &config.queue)
        .await
        .context("connecting to redis")?;
    let calls = VapiClient::new(&config.vapi).context("building call client")?;

    let worker = EnrichmentWorker::new(
        Arc::new(store),
        Arc::new(queue),
        Arc::new(calls),
        Arc::new(SystemClock),
    )
    .with_retry_policy(RetryPolicy::default().with_max_attempts(config.worker.max_attempts))
    .with_poll_interval(config.worker.poll_interval);

    let handle = worker.spawn("enrichment-worker");
    tracing::info!(queue = %config.queue.name, "worker started");

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received; draining current job");
    handle.shutdown().await;

    Ok(())
}
