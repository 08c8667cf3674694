// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime registry: workflow instance id -> live engine.
//!
//! An instance is registered when its engine is constructed and removed when
//! it reaches a terminal state (or degrades). Registration is insert-if-absent,
//! which is what keeps a second engine for the same instance from starting on
//! this node. Cross-node exclusivity comes from the repository's
//! `claim_instance`.
//!
//! The registry also keeps the task instance -> workflow instance route table
//! used to deliver worker callbacks. Entries never hold a lock across an await.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use crate::engine::WorkflowEvent;

/// Sending side of an engine's event queue.
#[derive(Debug, Clone)]
pub struct WorkflowHandle {
    sender: mpsc::UnboundedSender<WorkflowEvent>,
}

impl WorkflowHandle {
    pub(crate) fn new(sender: mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        Self { sender }
    }

    /// Enqueue an event. Fails if the engine loop is gone.
    pub fn send(&self, event: WorkflowEvent) -> Result<(), WorkflowEvent> {
        self.sender.send(event).map_err(|e| e.0)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Process-wide map of running engines.
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    engines: DashMap<i64, WorkflowHandle>,
    task_routes: DashMap<i64, i64>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an engine unless one is already registered for `instance_id`.
    ///
    /// A stale entry whose loop has exited is replaced.
    pub fn register(&self, instance_id: i64, handle: WorkflowHandle) -> bool {
        match self.engines.entry(instance_id) {
            Entry::Occupied(mut existing) => {
                if existing.get().is_closed() {
                    existing.insert(handle);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(handle);
                true
            }
        }
    }

    /// Remove the engine and every task route pointing at it.
    pub fn deregister(&self, instance_id: i64) {
        self.engines.remove(&instance_id);
        self.task_routes
            .retain(|_, workflow_instance_id| *workflow_instance_id != instance_id);
    }

    pub fn get(&self, instance_id: i64) -> Option<WorkflowHandle> {
        self.engines
            .get(&instance_id)
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, instance_id: i64) -> bool {
        self.engines.contains_key(&instance_id)
    }

    /// Ids of all registered instances, ascending.
    pub fn instance_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.engines.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    /// Send `event` to the engine of `instance_id`, if any.
    pub fn send(&self, instance_id: i64, event: WorkflowEvent) -> bool {
        match self.get(instance_id) {
            Some(handle) => handle.send(event).is_ok(),
            None => false,
        }
    }

    /// Route callbacks of `task_instance_id` to `workflow_instance_id`.
    pub fn route_task(&self, task_instance_id: i64, workflow_instance_id: i64) {
        self.task_routes
            .insert(task_instance_id, workflow_instance_id);
    }

    pub fn unroute_task(&self, task_instance_id: i64) {
        self.task_routes.remove(&task_instance_id);
    }

    pub fn workflow_for_task(&self, task_instance_id: i64) -> Option<i64> {
        self.task_routes
            .get(&task_instance_id)
            .map(|entry| *entry.value())
    }

    /// Drop all engines (runtime shutdown).
    pub fn clear(&self) {
        self.engines.clear();
        self.task_routes.clear();
    }
}
