use std::sync::Arc;

use anyhow::Context;

use eatsavvy_infra::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    eatsavvy_observability::init();

    let config = AppConfig::from_env().context("loading configuration")?;
    let services = Arc::new(eatsavvy_api::app::services::AppServices::connect(&config).await?);

    let app = eatsavvy_api::app::build_app(services, config.api.api_key.clone());

    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.api.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
