// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Master lease keeper.
//!
//! Every heartbeat round renews this node's lease in the repository and looks
//! for other masters whose last heartbeat is older than the lease timeout.
//! Dead masters are announced with [`SystemEvent::GlobalMasterFailover`]; the
//! failover coordinator removes a dead lease once all its instances are
//! adopted, so an incomplete failover is retried on the next round.
//!
//! When this node itself cannot renew for longer than the lease timeout,
//! other masters may already be adopting its instances. The keeper then
//! stands down every local engine and announces [`SystemEvent::LeaseLapsed`];
//! the first successful renewal after that announces
//! [`SystemEvent::LeaseRestored`] so the instances still owned here resume.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use skein_core::model::NodeLease;
use skein_core::persistence::Repository;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::WorkflowEvent;
use crate::error::{Error, Result};
use crate::event::{EventBus, SystemEvent};
use crate::registry::RuntimeRegistry;

/// Lease keeper configuration.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// How often the lease is renewed.
    pub heartbeat_interval: Duration,
    /// Age of the last heartbeat after which a master is dead.
    pub lease_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            lease_timeout: Duration::from_secs(60),
        }
    }
}

/// Nodes other than `own_node` whose lease expired at `now`, sorted.
pub fn expired_nodes(
    leases: &[NodeLease],
    now: DateTime<Utc>,
    timeout: chrono::Duration,
    own_node: &str,
) -> Vec<String> {
    let mut dead: Vec<String> = leases
        .iter()
        .filter(|lease| lease.node_id != own_node && lease.is_expired(now, timeout))
        .map(|lease| lease.node_id.clone())
        .collect();
    dead.sort();
    dead
}

/// Background worker that keeps this master's lease alive.
pub struct LeaseKeeper {
    repository: Arc<dyn Repository>,
    bus: Arc<EventBus>,
    registry: Arc<RuntimeRegistry>,
    node_id: String,
    config: LeaseConfig,
    /// Time of the last successful renewal, in epoch milliseconds.
    last_renewed: AtomicI64,
    stood_down: AtomicBool,
}

impl LeaseKeeper {
    pub fn new(
        repository: Arc<dyn Repository>,
        bus: Arc<EventBus>,
        registry: Arc<RuntimeRegistry>,
        node_id: impl Into<String>,
        config: LeaseConfig,
    ) -> Self {
        Self {
            repository,
            bus,
            registry,
            node_id: node_id.into(),
            config,
            last_renewed: AtomicI64::new(Utc::now().timestamp_millis()),
            stood_down: AtomicBool::new(false),
        }
    }

    /// Whether local engines are stood down after a lapsed lease.
    pub fn is_stood_down(&self) -> bool {
        self.stood_down.load(Ordering::Acquire)
    }

    /// Heartbeat until `shutdown` fires. The first round runs immediately.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            node_id = %self.node_id,
            heartbeat_interval_secs = self.config.heartbeat_interval.as_secs(),
            lease_timeout_secs = self.config.lease_timeout.as_secs(),
            "Lease keeper started"
        );

        loop {
            if let Err(e) = self.tick(Utc::now()).await {
                error!(error = %e, "Lease heartbeat round failed");
            }

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Lease keeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }
        }

        info!("Lease keeper stopped");
    }

    /// One heartbeat round. Returns the dead masters found.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        if let Err(e) = self.repository.heartbeat_node(&self.node_id, now).await {
            self.check_lapsed(now);
            return Err(e.into());
        }
        self.last_renewed
            .store(now.timestamp_millis(), Ordering::Release);
        if self.stood_down.swap(false, Ordering::AcqRel) {
            info!(node_id = %self.node_id, "Lease renewed after lapsing, resuming owned instances");
            self.bus.publish(SystemEvent::LeaseRestored {
                node_id: self.node_id.clone(),
            });
        }

        let timeout = chrono::Duration::from_std(self.config.lease_timeout)
            .map_err(|e| Error::Other(format!("Invalid lease timeout: {}", e)))?;
        let leases = self.repository.list_node_leases().await?;
        let dead = expired_nodes(&leases, now, timeout, &self.node_id);

        if dead.is_empty() {
            debug!(live_masters = leases.len(), "All master leases current");
            return Ok(dead);
        }

        warn!(dead_hosts = ?dead, "Master leases expired, requesting failover");
        self.bus.publish(SystemEvent::GlobalMasterFailover {
            dead_hosts: dead.clone(),
        });
        Ok(dead)
    }

    /// Stand down every local engine once the last renewal is older than the
    /// lease timeout.
    fn check_lapsed(&self, now: DateTime<Utc>) {
        let since_renewal = now.timestamp_millis() - self.last_renewed.load(Ordering::Acquire);
        let timeout = i64::try_from(self.config.lease_timeout.as_millis()).unwrap_or(i64::MAX);
        if since_renewal < timeout || self.stood_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let engines = self.registry.instance_ids();
        error!(
            node_id = %self.node_id,
            since_renewal_ms = since_renewal,
            engines = engines.len(),
            "Own lease lapsed, standing down local engines"
        );
        for instance_id in engines {
            self.registry.send(instance_id, WorkflowEvent::StandDown);
        }
        self.bus.publish(SystemEvent::LeaseLapsed {
            node_id: self.node_id.clone(),
        });
    }
}
