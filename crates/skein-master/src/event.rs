// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! System event bus.
//!
//! Two delivery paths share one publisher:
//!
//! - **routed**: events for a specific workflow instance go into that
//!   engine's FIFO queue, looked up in the [`RuntimeRegistry`]. Worker
//!   callbacks are routed through the registry's task route table; child
//!   workflow state changes are routed to the parent engine.
//! - **broadcast**: every [`SystemEvent`] is also fanned out to observers
//!   (failover coordinator, alerting hooks, tests) through a
//!   `tokio::sync::broadcast` channel.

use std::sync::Arc;

use serde::Serialize;
use skein_core::dispatcher::{TaskStateChange, TaskStateReceiver};
use skein_core::model::{ParentLink, TaskExecutionStatus, WorkflowExecutionStatus};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::engine::WorkflowEvent;
use crate::registry::RuntimeRegistry;

const OBSERVER_CAPACITY: usize = 1024;

/// Lifecycle events visible to observers.
///
/// Serializes with a `type` tag so alerting hooks can forward events as JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SystemEvent {
    /// A task attempt changed state.
    TaskStateChanged {
        workflow_instance_id: i64,
        task_instance_id: i64,
        task_code: i64,
        state: TaskExecutionStatus,
    },
    /// A workflow instance changed state. Terminal states are the outward
    /// completion notifications.
    WorkflowStateChanged {
        instance_id: i64,
        state: WorkflowExecutionStatus,
        parent: Option<ParentLink>,
    },
    /// Masters whose lease expired; their instances need failover.
    GlobalMasterFailover { dead_hosts: Vec<String> },
    /// A task exceeded its timeout.
    TaskTimeout {
        workflow_instance_id: i64,
        task_instance_id: i64,
        task_code: i64,
    },
    /// A workflow instance exceeded its warning timeout.
    WorkflowTimeout { instance_id: i64 },
    /// An engine gave up after persistence retries were exhausted.
    WorkflowDegraded { instance_id: i64, reason: String },
    /// This node could not renew its lease in time and stopped its engines.
    LeaseLapsed { node_id: String },
    /// This node renewed its lease again after it lapsed.
    LeaseRestored { node_id: String },
}

/// In-process publish/subscribe channel.
pub struct EventBus {
    registry: Arc<RuntimeRegistry>,
    observers: broadcast::Sender<SystemEvent>,
}

impl EventBus {
    pub fn new(registry: Arc<RuntimeRegistry>) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self {
            registry,
            observers,
        }
    }

    /// Subscribe to every published [`SystemEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<SystemEvent> {
        self.observers.subscribe()
    }

    /// Publish an event to observers and to the engine it concerns.
    pub fn publish(&self, event: SystemEvent) {
        if let SystemEvent::WorkflowStateChanged {
            instance_id,
            state,
            parent: Some(parent),
        } = &event
        {
            let routed = self.registry.send(
                parent.workflow_instance_id,
                WorkflowEvent::SubWorkflowStateChanged {
                    child_instance_id: *instance_id,
                    task_instance_id: parent.task_instance_id,
                    state: *state,
                },
            );
            if !routed {
                debug!(
                    instance_id,
                    parent_instance_id = parent.workflow_instance_id,
                    "Parent engine not running locally, child state change not routed"
                );
            }
        }

        // No subscribers is fine.
        let _ = self.observers.send(event);
    }

    /// Post an event into the queue of `instance_id`.
    pub fn post(&self, instance_id: i64, event: WorkflowEvent) -> bool {
        self.registry.send(instance_id, event)
    }

    /// Deliver a worker callback to the owning engine.
    ///
    /// Returns `false` when no local engine owns the task attempt.
    pub fn deliver_callback(&self, change: TaskStateChange) -> bool {
        let task_instance_id = change.task_instance_id;
        match self.registry.workflow_for_task(task_instance_id) {
            Some(instance_id) => self.post(instance_id, WorkflowEvent::TaskStateChanged(change)),
            None => {
                debug!(
                    task_instance_id,
                    state = %change.state,
                    "Discarding callback for task instance without a local engine"
                );
                false
            }
        }
    }

    /// Forward dispatcher callbacks until shutdown or until the channel closes.
    pub async fn pump_callbacks(
        self: Arc<Self>,
        mut callbacks: TaskStateReceiver,
        shutdown: CancellationToken,
    ) {
        info!("Callback pump started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                change = callbacks.recv() => match change {
                    Some(change) => {
                        self.deliver_callback(change);
                    }
                    None => break,
                },
            }
        }
        info!("Callback pump stopped");
    }
}
