// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository port and backends.
//!
//! The engine reads definitions and reads/writes runtime records only through
//! [`Repository`]. Two backends ship with the crate:
//!
//! - [`InMemoryRepository`] for tests and embedded use
//! - [`SqliteRepository`] for the master binary

pub mod memory;
pub mod sqlite;

pub use self::memory::InMemoryRepository;
pub use self::sqlite::SqliteRepository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::model::{NodeLease, Schedule, TaskInstance, WorkflowDefinition, WorkflowInstance};

/// Storage used by the master.
///
/// Every method is a single atomic write or read. Implementations must be
/// safe to share between engines.
///
/// Writes to a live instance are fenced: they take the node id of the writer
/// as `owner` and fail with [`CoreError::NotLocallyOwned`] once the stored
/// host of the workflow instance is a different node.
#[async_trait]
pub trait Repository: Send + Sync {
    // ---- definitions ----

    /// Load a workflow definition by code and version.
    async fn load_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, CoreError>;

    /// Store (or replace) a workflow definition.
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError>;

    // ---- workflow instances ----

    /// Insert a new workflow instance and return its id.
    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<i64, CoreError>;

    /// Overwrite an existing workflow instance owned by `owner`.
    async fn save_instance(&self, instance: &WorkflowInstance, owner: &str) -> Result<(), CoreError>;

    async fn load_instance(&self, id: i64) -> Result<Option<WorkflowInstance>, CoreError>;

    /// Instances whose owning host is `host`, any state.
    async fn list_instances_by_host(&self, host: &str) -> Result<Vec<WorkflowInstance>, CoreError>;

    /// Change the owner of `id` from `expected_host` to `new_host`.
    ///
    /// Returns `false` (and changes nothing) when the current owner is not
    /// `expected_host`.
    async fn claim_instance(
        &self,
        id: i64,
        expected_host: &str,
        new_host: &str,
    ) -> Result<bool, CoreError>;

    // ---- task instances ----

    /// Insert a new task instance of a workflow instance owned by `owner` and
    /// return its id.
    async fn insert_task_instance(&self, task: &TaskInstance, owner: &str) -> Result<i64, CoreError>;

    /// Overwrite an existing task instance of a workflow instance owned by `owner`.
    async fn save_task_instance(&self, task: &TaskInstance, owner: &str) -> Result<(), CoreError>;

    /// Insert the child instance started by `parent_task` and save
    /// `parent_task` pointing at it, in one transaction. Returns the child id.
    async fn insert_sub_workflow(
        &self,
        child: &WorkflowInstance,
        parent_task: &TaskInstance,
        owner: &str,
    ) -> Result<i64, CoreError>;

    async fn load_task_instance(&self, id: i64) -> Result<Option<TaskInstance>, CoreError>;

    /// All attempts of a workflow instance, ordered by id.
    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, CoreError>;

    // ---- schedules ----

    async fn save_schedule(&self, schedule: &Schedule) -> Result<(), CoreError>;

    async fn load_schedule(&self, id: i64) -> Result<Option<Schedule>, CoreError>;

    async fn list_schedules(&self) -> Result<Vec<Schedule>, CoreError>;

    // ---- master leases ----

    /// Create or renew the lease of `node_id`.
    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<(), CoreError>;

    async fn list_node_leases(&self) -> Result<Vec<NodeLease>, CoreError>;

    async fn remove_node_lease(&self, node_id: &str) -> Result<(), CoreError>;

    /// Check database connectivity.
    async fn health_check(&self) -> Result<bool, CoreError>;
}
