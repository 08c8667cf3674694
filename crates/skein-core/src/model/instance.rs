// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime records: workflow instances and task instances.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::command::CommandType;
use super::definition::{FailureStrategy, Priority, TaskDefinition, WorkflowDefinition};
use super::status::{TaskExecutionStatus, TaskFlag, WorkflowExecutionStatus};

/// Variable pool shared by the tasks of one workflow instance.
pub type VarPool = BTreeMap<String, Value>;

/// Parent link of a sub-workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub workflow_instance_id: i64,
    pub task_instance_id: i64,
}

/// One execution of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Assigned by the repository on insert; 0 before that.
    pub id: i64,
    pub definition_code: i64,
    pub definition_version: i32,
    pub name: String,
    pub state: WorkflowExecutionStatus,
    pub command_type: CommandType,
    /// Raw command parameters, kept for provenance.
    pub command_params: VarPool,
    pub schedule_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub run_times: u32,
    /// Node id of the owning master.
    pub host: String,
    pub parent: Option<ParentLink>,
    pub var_pool: VarPool,
    /// Restricts execution to these codes and their descendants. Empty means all.
    pub start_nodes: Vec<i64>,
    pub failure_strategy: FailureStrategy,
}

impl WorkflowInstance {
    /// A fresh SUBMITTED instance of `definition`, owned by `host`.
    pub fn submitted(
        definition: &WorkflowDefinition,
        command_type: CommandType,
        host: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            definition_code: definition.code,
            definition_version: definition.version,
            name: definition.name.clone(),
            state: WorkflowExecutionStatus::Submitted,
            command_type,
            command_params: VarPool::new(),
            schedule_time: None,
            start_time: None,
            end_time: None,
            run_times: 1,
            host: host.into(),
            parent: None,
            var_pool: VarPool::new(),
            start_nodes: Vec::new(),
            failure_strategy: definition.failure_strategy,
        }
    }

    pub fn is_sub_workflow(&self) -> bool {
        self.parent.is_some()
    }
}

/// One attempt of a task node inside a workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Assigned by the repository on insert; 0 before that.
    pub id: i64,
    pub name: String,
    pub task_code: i64,
    pub task_version: i32,
    pub workflow_instance_id: i64,
    pub task_type: String,
    pub state: TaskExecutionStatus,
    pub flag: TaskFlag,
    pub retry_times: u32,
    /// Submit time of the first attempt in the retry chain.
    pub first_submit_time: DateTime<Utc>,
    /// Submit time of this attempt.
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub host: Option<String>,
    pub log_path: Option<String>,
    /// Outputs reported by the worker.
    pub var_pool: VarPool,
    pub priority: Priority,
    pub worker_group: String,
    /// Child instance for sub-workflow tasks.
    pub sub_workflow_instance_id: Option<i64>,
}

impl TaskInstance {
    /// First attempt of `task` in workflow instance `workflow_instance_id`.
    pub fn first_attempt(
        task: &TaskDefinition,
        workflow_instance_id: i64,
        state: TaskExecutionStatus,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            name: task.name.clone(),
            task_code: task.code,
            task_version: task.version,
            workflow_instance_id,
            task_type: task.task_type.label().to_string(),
            state,
            flag: TaskFlag::Active,
            retry_times: 0,
            first_submit_time: now,
            submit_time: now,
            start_time: None,
            end_time: None,
            host: None,
            log_path: None,
            var_pool: VarPool::new(),
            priority: task.priority,
            worker_group: task.worker_group.clone(),
            sub_workflow_instance_id: None,
        }
    }

    /// Next attempt in the retry chain.
    ///
    /// Keeps `first_submit_time` and forces `submit_time` past the previous
    /// attempt's, even when the clock has not moved.
    pub fn next_attempt(
        &self,
        state: TaskExecutionStatus,
        retry_times: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let floor = self.submit_time + chrono::Duration::microseconds(1);
        Self {
            id: 0,
            state,
            flag: TaskFlag::Active,
            retry_times,
            submit_time: now.max(floor),
            start_time: None,
            end_time: None,
            host: None,
            log_path: None,
            var_pool: VarPool::new(),
            sub_workflow_instance_id: None,
            ..self.clone()
        }
    }

    pub fn is_active_flag(&self) -> bool {
        self.flag == TaskFlag::Active
    }
}
