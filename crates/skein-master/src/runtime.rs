// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable master runtime.
//!
//! [`MasterRuntime`] wires the repository and dispatcher into the engine
//! context and starts the background workers: the callback pump, the failover
//! coordinator, the lease keeper and the cron scheduler.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use skein_core::dispatcher::MockDispatcher;
//! use skein_core::persistence::SqliteRepository;
//! use skein_master::runtime::MasterRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let repository = Arc::new(SqliteRepository::from_path("skein.db").await?);
//!
//!     let runtime = MasterRuntime::builder()
//!         .repository(repository)
//!         .dispatcher(Arc::new(MockDispatcher::new()))
//!         .node_id("master-1")
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let instance_id = runtime
//!         .commands()
//!         .manual_trigger(1, 1, Default::default())
//!         .await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use skein_core::dispatcher::{Dispatcher, callback_channel};
use skein_core::persistence::Repository;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::commands::CommandService;
use crate::config::{Config, EngineConfig};
use crate::engine::EngineContext;
use crate::event::EventBus;
use crate::failover::FailoverCoordinator;
use crate::lease::{LeaseConfig, LeaseKeeper};
use crate::registry::RuntimeRegistry;
use crate::scheduler::CronScheduler;

/// Builder for creating a [`MasterRuntime`].
pub struct MasterRuntimeBuilder {
    repository: Option<Arc<dyn Repository>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    node_id: Option<String>,
    engine: EngineConfig,
    lease: LeaseConfig,
    scheduler_poll_interval: Duration,
}

impl Default for MasterRuntimeBuilder {
    fn default() -> Self {
        Self {
            repository: None,
            dispatcher: None,
            node_id: None,
            engine: EngineConfig::default(),
            lease: LeaseConfig::default(),
            scheduler_poll_interval: Duration::from_secs(5),
        }
    }
}

impl MasterRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take node id, engine tuning and intervals from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.node_id = Some(config.node_id.clone());
        self.engine = config.engine.clone();
        self.lease = LeaseConfig {
            heartbeat_interval: config.heartbeat_interval,
            lease_timeout: config.lease_timeout,
        };
        self.scheduler_poll_interval = config.scheduler_poll_interval;
        self
    }

    /// Set the repository (required).
    pub fn repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Set the dispatcher (required).
    pub fn dispatcher(mut self, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Set the node identity (required).
    pub fn node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    /// Set the engine tuning.
    pub fn engine_config(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Set lease renewal interval and expiry.
    ///
    /// Default: 10 seconds / 60 seconds
    pub fn lease_config(mut self, lease: LeaseConfig) -> Self {
        self.lease = lease;
        self
    }

    /// Set the cron scheduler poll interval.
    ///
    /// Default: 5 seconds
    pub fn scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<MasterRuntimeConfig> {
        let repository = self
            .repository
            .ok_or_else(|| anyhow::anyhow!("repository is required"))?;
        let dispatcher = self
            .dispatcher
            .ok_or_else(|| anyhow::anyhow!("dispatcher is required"))?;
        let node_id = self
            .node_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("node_id is required"))?;
        if self.lease.lease_timeout <= self.lease.heartbeat_interval {
            anyhow::bail!("lease timeout must be greater than the heartbeat interval");
        }

        Ok(MasterRuntimeConfig {
            repository,
            dispatcher,
            node_id,
            engine: self.engine,
            lease: self.lease,
            scheduler_poll_interval: self.scheduler_poll_interval,
        })
    }
}

/// Configuration for a [`MasterRuntime`].
pub struct MasterRuntimeConfig {
    repository: Arc<dyn Repository>,
    dispatcher: Arc<dyn Dispatcher>,
    node_id: String,
    engine: EngineConfig,
    lease: LeaseConfig,
    scheduler_poll_interval: Duration,
}

impl MasterRuntimeConfig {
    /// Start the runtime: background workers first, then adoption of this
    /// node's unfinished instances.
    pub async fn start(self) -> Result<MasterRuntime> {
        let shutdown = CancellationToken::new();
        let registry = Arc::new(RuntimeRegistry::new());
        let bus = Arc::new(EventBus::new(registry.clone()));

        let ctx = EngineContext::new(
            self.repository.clone(),
            self.dispatcher.clone(),
            bus.clone(),
            registry,
            self.engine,
            self.node_id.clone(),
            shutdown.clone(),
        );
        let commands = CommandService::new(ctx.clone());
        let failover = Arc::new(FailoverCoordinator::new(ctx.clone()));

        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        // Worker callbacks
        let (sink, callbacks) = callback_channel();
        self.dispatcher.set_callback_sink(sink);
        handles.push(tokio::spawn(
            bus.clone().pump_callbacks(callbacks, shutdown.clone()),
        ));

        // Failover requests, subscribed before the lease keeper can publish any
        handles.push(tokio::spawn(
            failover.clone().run(bus.subscribe(), shutdown.clone()),
        ));

        match failover.on_startup().await {
            Ok(adopted) if !adopted.is_empty() => {
                info!(adopted = adopted.len(), "Resumed unfinished instances")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to resume unfinished instances"),
        }

        let lease_keeper = LeaseKeeper::new(
            self.repository.clone(),
            bus.clone(),
            ctx.registry().clone(),
            self.node_id.clone(),
            self.lease,
        );
        let lease_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            lease_keeper.run(lease_shutdown).await;
        }));

        let scheduler = CronScheduler::new(
            self.repository.clone(),
            commands.clone(),
            self.scheduler_poll_interval,
        );
        let scheduler_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            scheduler.run(scheduler_shutdown).await;
        }));

        info!(
            node_id = %self.node_id,
            dispatcher = self.dispatcher.dispatcher_type(),
            "MasterRuntime started"
        );

        Ok(MasterRuntime {
            ctx,
            commands,
            failover,
            handles,
            shutdown,
        })
    }
}

/// A running master that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct MasterRuntime {
    ctx: Arc<EngineContext>,
    commands: CommandService,
    failover: Arc<FailoverCoordinator>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl MasterRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> MasterRuntimeBuilder {
        MasterRuntimeBuilder::new()
    }

    /// Triggers and control commands.
    pub fn commands(&self) -> &CommandService {
        &self.commands
    }

    pub fn failover(&self) -> &Arc<FailoverCoordinator> {
        &self.failover
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        self.ctx.bus()
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        self.ctx.registry()
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        self.ctx.repository()
    }

    pub fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Engines stop between events; their persisted state is resumed by the
    /// next start of this node or by another master's failover.
    pub async fn shutdown(self) -> Result<()> {
        info!("MasterRuntime shutting down...");
        self.shutdown.cancel();

        for handle in self.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background worker ended abnormally");
            }
        }
        self.ctx.registry().clear();

        info!("MasterRuntime shutdown complete");
        Ok(())
    }
}
