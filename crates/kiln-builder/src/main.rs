// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kiln Builder - Build Task Worker
//!
//! Consumes build tasks from a Redis list and runs them:
//! - Source-code builds (Dockerfile images or compiled slugs)
//! - Image and market-slug builds
//! - Plugin image and Dockerfile builds
//! - Service checks and app shares

use std::sync::Arc;

use kiln_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use tracing::{info, warn};

use kiln_builder::callback::HttpUpgradeClient;
use kiln_builder::config::Config;
use kiln_builder::queue::QueueConsumerConfig;
use kiln_builder::runtime::BuilderRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kiln_builder=info,kiln_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        queue = %config.task_queue,
        api_url = %config.api_url,
        registry = %config.build.registry_domain,
        max_concurrent_tasks = config.build.max_concurrent_tasks,
        "Starting Kiln Builder"
    );

    // Connect to the build store
    let persistence: Arc<dyn Persistence> = if config.database_url.starts_with("sqlite:") {
        Arc::new(SqlitePersistence::connect(&config.database_url, 5).await?)
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await?;
        kiln_core::migrations::run_postgres(&pool).await?;
        Arc::new(PostgresPersistence::new(pool))
    };

    info!("Connected to build store");

    let callback = Arc::new(HttpUpgradeClient::new(&config.api_url, config.api_token.clone())?);

    // Start the runtime
    let runtime = BuilderRuntime::builder()
        .persistence(persistence)
        .callback(callback)
        .settings(config.build)
        .queue(QueueConsumerConfig {
            redis_url: config.redis_url,
            queue_key: config.task_queue,
            ..Default::default()
        })
        .build()?
        .start()
        .await?;

    info!("Kiln Builder ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Kiln Builder shut down");

    Ok(())
}
