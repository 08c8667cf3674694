// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow and task definitions.
//!
//! Definitions are immutable templates. The engine only reads them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How the workflow reacts to a task that failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    /// Keep running independent branches; fail once no progress is possible.
    #[default]
    Continue,
    /// Fail the workflow immediately and kill everything still running.
    End,
}

impl FailureStrategy {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Continue => "CONTINUE",
            Self::End => "END",
        }
    }
}

/// Task priority, highest first when several tasks become runnable together.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Highest,
    High,
    #[default]
    Medium,
    Low,
    Lowest,
}

/// What executes a task node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskType {
    /// Executed by a worker. `kind` is opaque to the engine (e.g. "SHELL").
    Normal { kind: String },
    /// Runs another workflow definition as a child instance.
    SubWorkflow {
        definition_code: i64,
        definition_version: i32,
    },
}

impl TaskType {
    /// Label stored on task instances.
    pub fn label(&self) -> &str {
        match self {
            Self::Normal { kind } => kind,
            Self::SubWorkflow { .. } => "SUB_PROCESS",
        }
    }

    pub fn is_sub_workflow(&self) -> bool {
        matches!(self, Self::SubWorkflow { .. })
    }
}

/// What happens when a task exceeds its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutStrategy {
    /// Log and publish a timeout event.
    #[default]
    Warn,
    /// Kill the task; it ends FAILURE and may be retried.
    Failed,
    /// Both.
    WarnFailed,
}

impl TimeoutStrategy {
    pub fn warns(self) -> bool {
        matches!(self, Self::Warn | Self::WarnFailed)
    }

    pub fn fails(self) -> bool {
        matches!(self, Self::Failed | Self::WarnFailed)
    }
}

/// Per-task timeout policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskTimeout {
    pub enabled: bool,
    pub strategy: TimeoutStrategy,
    /// Timeout in seconds.
    pub duration_secs: u64,
}

impl TaskTimeout {
    /// Effective timeout, if enabled.
    pub fn duration(&self) -> Option<Duration> {
        (self.enabled && self.duration_secs > 0).then(|| Duration::from_secs(self.duration_secs))
    }
}

/// A node of the workflow DAG.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// Unique within the workflow definition.
    pub code: i64,
    pub version: i32,
    pub name: String,
    pub task_type: TaskType,
    /// Parameters handed to the worker. String values may contain `${name}`.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub max_retry_times: u32,
    /// Wait between a failure and the next attempt, in seconds.
    #[serde(default)]
    pub retry_interval_secs: u64,
    #[serde(default)]
    pub timeout: TaskTimeout,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
    /// Keys of the task's var-pool delta that may enter the workflow pool.
    #[serde(default)]
    pub output_params: Vec<String>,
}

fn default_worker_group() -> String {
    "default".to_string()
}

impl TaskDefinition {
    /// A normal worker task with default policies.
    pub fn new(code: i64, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            code,
            version: 1,
            name: name.into(),
            task_type: TaskType::Normal { kind: kind.into() },
            params: BTreeMap::new(),
            max_retry_times: 0,
            retry_interval_secs: 0,
            timeout: TaskTimeout::default(),
            priority: Priority::default(),
            worker_group: default_worker_group(),
            output_params: Vec::new(),
        }
    }

    /// A task that runs another workflow as a child.
    pub fn sub_workflow(
        code: i64,
        name: impl Into<String>,
        definition_code: i64,
        definition_version: i32,
    ) -> Self {
        Self {
            task_type: TaskType::SubWorkflow {
                definition_code,
                definition_version,
            },
            ..Self::new(code, name, "SUB_PROCESS")
        }
    }

    pub fn with_retries(mut self, max_retry_times: u32, retry_interval_secs: u64) -> Self {
        self.max_retry_times = max_retry_times;
        self.retry_interval_secs = retry_interval_secs;
        self
    }

    pub fn with_timeout(mut self, strategy: TimeoutStrategy, duration_secs: u64) -> Self {
        self.timeout = TaskTimeout {
            enabled: true,
            strategy,
            duration_secs,
        };
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    pub fn with_outputs<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_params = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// A directed edge `pre -> post` between task codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRelation {
    pub pre: i64,
    pub post: i64,
}

impl TaskRelation {
    pub fn new(pre: i64, post: i64) -> Self {
        Self { pre, post }
    }
}

/// A global parameter declared on the workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamDecl {
    pub name: String,
    pub value: Value,
}

/// The immutable workflow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub code: i64,
    pub version: i32,
    pub name: String,
    /// Task nodes in declaration order.
    pub tasks: Vec<TaskDefinition>,
    pub relations: Vec<TaskRelation>,
    #[serde(default)]
    pub global_params: Vec<ParamDecl>,
    #[serde(default = "default_tenant")]
    pub tenant: String,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    /// Warning timeout for the whole instance, in minutes. Zero disables it.
    #[serde(default)]
    pub timeout_minutes: u64,
}

fn default_tenant() -> String {
    "default".to_string()
}

impl WorkflowDefinition {
    pub fn new(code: i64, version: i32, name: impl Into<String>) -> Self {
        Self {
            code,
            version,
            name: name.into(),
            tasks: Vec::new(),
            relations: Vec::new(),
            global_params: Vec::new(),
            tenant: default_tenant(),
            failure_strategy: FailureStrategy::default(),
            timeout_minutes: 0,
        }
    }

    pub fn with_task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_relation(mut self, pre: i64, post: i64) -> Self {
        self.relations.push(TaskRelation::new(pre, post));
        self
    }

    pub fn with_global_param(mut self, name: impl Into<String>, value: Value) -> Self {
        self.global_params.push(ParamDecl {
            name: name.into(),
            value,
        });
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u64) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn task(&self, code: i64) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.code == code)
    }

    pub fn warning_timeout(&self) -> Option<Duration> {
        (self.timeout_minutes > 0).then(|| Duration::from_secs(self.timeout_minutes * 60))
    }
}
