// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Skein Master - workflow control node
//!
//! Runs the workflow engines, the cron scheduler, the master lease keeper and
//! failover for this node against a SQLite repository.

use std::sync::Arc;
use tracing::{info, warn};

use skein_core::dispatcher::{Dispatcher, MockDispatcher};
use skein_core::persistence::{Repository, SqliteRepository};
use skein_master::config::Config;
use skein_master::runtime::MasterRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "skein_master=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        node_id = %config.node_id,
        exec_threads = config.engine.exec_threads,
        "Starting Skein Master"
    );

    let repository = Arc::new(SqliteRepository::from_url(&config.database_url).await?);
    if !repository.health_check().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database schema verified");

    // Worker transport is pluggable; the binary ships with the in-process mock.
    let dispatcher = Arc::new(MockDispatcher::new());
    warn!(
        dispatcher = dispatcher.dispatcher_type(),
        "Using the mock dispatcher, tasks are not executed by real workers"
    );

    let runtime = MasterRuntime::builder()
        .config(&config)
        .repository(repository)
        .dispatcher(dispatcher)
        .build()?
        .start()
        .await?;

    info!(node_id = %runtime.node_id(), "Skein Master ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Skein Master shut down");

    Ok(())
}
