// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dispatcher port - hands tasks to the worker fleet.
//!
//! The master calls [`Dispatcher::dispatch`] and [`Dispatcher::cancel`];
//! workers answer asynchronously through the callback sink installed with
//! [`Dispatcher::set_callback_sink`].

pub mod mock;

pub use mock::{MockDispatcher, MockOutcome};

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::model::{Priority, TaskExecutionStatus, TaskInstance, VarPool};

/// Everything a worker needs to run one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatchRequest {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub task_code: i64,
    pub task_name: String,
    pub task_type: String,
    /// Parameters with pool references already resolved.
    pub params: BTreeMap<String, Value>,
    pub var_pool: VarPool,
    pub worker_group: String,
    pub priority: Priority,
    pub retry_times: u32,
}

/// Positive answer to a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchAck {
    /// Worker that accepted the task.
    pub host: String,
}

/// Why a dispatch or cancel did not go through.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// A worker refused the task.
    #[error("dispatch rejected: {0}")]
    Rejected(String),

    /// No worker could be reached.
    #[error("no worker available: {0}")]
    Unavailable(String),
}

/// Asynchronous state report from a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskStateChange {
    pub task_instance_id: i64,
    /// RUNNING_EXECUTION, SUCCESS, FAILURE or KILL.
    pub state: TaskExecutionStatus,
    pub host: Option<String>,
    pub log_path: Option<String>,
    /// Outputs reported with a terminal state.
    pub var_pool_delta: VarPool,
}

impl TaskStateChange {
    pub fn new(task_instance_id: i64, state: TaskExecutionStatus) -> Self {
        Self {
            task_instance_id,
            state,
            host: None,
            log_path: None,
            var_pool_delta: VarPool::new(),
        }
    }
}

/// Sending half of the callback channel.
pub type TaskStateSender = mpsc::UnboundedSender<TaskStateChange>;

/// Receiving half of the callback channel.
pub type TaskStateReceiver = mpsc::UnboundedReceiver<TaskStateChange>;

/// Create a callback channel.
pub fn callback_channel() -> (TaskStateSender, TaskStateReceiver) {
    mpsc::unbounded_channel()
}

/// Worker fleet as seen from the master.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Dispatcher type identifier (e.g., "mock").
    fn dispatcher_type(&self) -> &'static str;

    /// Install the sink that receives worker callbacks.
    fn set_callback_sink(&self, sink: TaskStateSender);

    /// Hand a task attempt to a worker.
    async fn dispatch(&self, request: &TaskDispatchRequest) -> Result<DispatchAck, DispatchError>;

    /// Ask the worker to kill a task attempt. The outcome arrives as a KILL
    /// callback.
    async fn cancel(&self, task_instance_id: i64) -> Result<(), DispatchError>;

    /// Whether a worker still reports the attempt as running.
    async fn is_alive(&self, _task: &TaskInstance) -> bool {
        false
    }
}
