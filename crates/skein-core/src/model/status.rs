// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow and task state machines.
//!
//! Every legal transition lives in exactly one `match` table:
//! [`WorkflowExecutionStatus::apply`] and [`TaskExecutionStatus::apply`].
//! Anything not listed there is rejected with
//! [`CoreError::InvalidTransition`], so callers can never write a state the
//! table does not know about.
//!
//! ```text
//!   SUBMITTED ──start──► RUNNING_EXECUTION ──succeed/fail──► SUCCESS | FAILURE
//!                          │            │
//!                     pause│            │stop
//!                          ▼            ▼
//!                    READY_PAUSE ──► READY_STOP ──settled──► STOP
//!                          │settled
//!                          ▼
//!                        PAUSE ──recover──► RUNNING_EXECUTION
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// State of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowExecutionStatus {
    /// Created by a trigger, engine not started yet.
    Submitted,
    /// Engine is walking the DAG.
    RunningExecution,
    /// Pause requested; waiting for active tasks to finish.
    ReadyPause,
    /// Suspended; resumable through recover.
    Pause,
    /// Stop requested; waiting for kills to be acknowledged.
    ReadyStop,
    /// Stopped by a user (terminal).
    Stop,
    /// Finished with at least one failed task (terminal).
    Failure,
    /// Every executed task succeeded (terminal).
    Success,
}

/// Inputs to the workflow state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowTransition {
    /// The engine takes the instance.
    Start,
    /// Pause command accepted.
    Pause,
    /// Stop command accepted.
    Stop,
    /// No task is active any more after a pause.
    PauseSettled,
    /// Every kill was acknowledged or timed out.
    StopSettled,
    /// Recover command on a paused instance.
    Recover,
    /// DAG finished without failures.
    Succeed,
    /// DAG finished (or ended early) with a failure.
    Fail,
    /// Repeat-run command on a terminal instance.
    RepeatRun,
}

impl WorkflowExecutionStatus {
    /// All states, for table-driven tests and parsing.
    pub const ALL: [WorkflowExecutionStatus; 8] = [
        Self::Submitted,
        Self::RunningExecution,
        Self::ReadyPause,
        Self::Pause,
        Self::ReadyStop,
        Self::Stop,
        Self::Failure,
        Self::Success,
    ];

    /// Apply a transition, returning the next state.
    pub fn apply(self, transition: WorkflowTransition) -> Result<Self, CoreError> {
        use WorkflowExecutionStatus as S;
        use WorkflowTransition as T;

        let next = match (self, transition) {
            (S::Submitted, T::Start) => S::RunningExecution,
            (S::Submitted, T::Stop) => S::Stop,
            (S::Submitted, T::Fail) => S::Failure,

            (S::RunningExecution, T::Pause) => S::ReadyPause,
            (S::RunningExecution, T::Stop) => S::ReadyStop,
            (S::RunningExecution, T::Succeed) => S::Success,
            (S::RunningExecution, T::Fail) => S::Failure,

            (S::ReadyPause, T::PauseSettled) => S::Pause,
            (S::ReadyPause, T::Stop) => S::ReadyStop,
            (S::ReadyPause, T::Succeed) => S::Success,
            (S::ReadyPause, T::Fail) => S::Failure,

            (S::ReadyStop, T::StopSettled) => S::Stop,

            (S::Pause, T::Recover) => S::RunningExecution,
            (S::Pause, T::Stop) => S::Stop,

            (S::Success | S::Failure | S::Stop, T::RepeatRun) => S::RunningExecution,

            (from, trigger) => {
                return Err(CoreError::InvalidTransition {
                    entity: "workflow",
                    from: from.to_string(),
                    trigger: format!("{:?}", trigger),
                });
            }
        };
        Ok(next)
    }

    /// SUCCESS, FAILURE and STOP.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Stop)
    }

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::RunningExecution => "RUNNING_EXECUTION",
            Self::ReadyPause => "READY_PAUSE",
            Self::Pause => "PAUSE",
            Self::ReadyStop => "READY_STOP",
            Self::Stop => "STOP",
            Self::Failure => "FAILURE",
            Self::Success => "SUCCESS",
        }
    }
}

impl fmt::Display for WorkflowExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CoreError::ValidationError {
                field: "workflow_state".to_string(),
                message: format!("unknown workflow state '{}'", s),
            })
    }
}

/// State of a single task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    /// Created and persisted, not yet handed to a worker.
    Submitted,
    /// Accepted by the dispatcher.
    Dispatched,
    /// Worker reported the task as started.
    RunningExecution,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
    /// Killed on behalf of a stop.
    Kill,
    /// Held back or interrupted on behalf of a pause.
    Pause,
    /// Attempt abandoned by failover; a fresh attempt replaces it.
    NeedFaultTolerance,
}

/// Inputs to the task state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskTransition {
    /// Dispatcher accepted the request.
    Dispatched,
    /// Worker started executing.
    Started,
    /// Worker reported success.
    Succeeded,
    /// Worker reported failure, or dispatch failed.
    Failed,
    /// Cancelled because the workflow is stopping.
    Killed,
    /// Cancelled or held back because the workflow is pausing.
    Paused,
    /// Failover could not confirm the attempt.
    FaultTolerance,
}

impl TaskExecutionStatus {
    /// All states, for table-driven tests and parsing.
    pub const ALL: [TaskExecutionStatus; 8] = [
        Self::Submitted,
        Self::Dispatched,
        Self::RunningExecution,
        Self::Success,
        Self::Failure,
        Self::Kill,
        Self::Pause,
        Self::NeedFaultTolerance,
    ];

    /// Apply a transition, returning the next state.
    pub fn apply(self, transition: TaskTransition) -> Result<Self, CoreError> {
        use TaskExecutionStatus as S;
        use TaskTransition as T;

        let next = match (self, transition) {
            (S::Submitted, T::Dispatched) => S::Dispatched,
            (S::Submitted | S::Dispatched | S::RunningExecution, T::Failed) => S::Failure,
            (S::Submitted | S::Dispatched | S::RunningExecution, T::Killed) => S::Kill,
            (S::Submitted | S::Dispatched | S::RunningExecution, T::Paused) => S::Pause,
            (S::Submitted | S::Dispatched | S::RunningExecution, T::FaultTolerance) => {
                S::NeedFaultTolerance
            }
            (S::Dispatched, T::Started) => S::RunningExecution,
            (S::Dispatched | S::RunningExecution, T::Succeeded) => S::Success,

            (from, trigger) => {
                return Err(CoreError::InvalidTransition {
                    entity: "task",
                    from: from.to_string(),
                    trigger: format!("{:?}", trigger),
                });
            }
        };
        Ok(next)
    }

    /// The attempt is over (no further transitions possible).
    pub fn is_finished(self) -> bool {
        !self.is_active()
    }

    /// SUBMITTED, DISPATCHED or RUNNING_EXECUTION.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Submitted | Self::Dispatched | Self::RunningExecution
        )
    }

    /// A finished outcome successors can build on (SUCCESS, FAILURE or KILL).
    pub fn is_completion(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Kill)
    }

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Dispatched => "DISPATCHED",
            Self::RunningExecution => "RUNNING_EXECUTION",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::Kill => "KILL",
            Self::Pause => "PAUSE",
            Self::NeedFaultTolerance => "NEED_FAULT_TOLERANCE",
        }
    }
}

impl fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskExecutionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| CoreError::ValidationError {
                field: "task_state".to_string(),
                message: format!("unknown task state '{}'", s),
            })
    }
}

/// Marks the current attempt of a task code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskFlag {
    /// The current attempt (`YES`).
    Active,
    /// A superseded attempt kept as history (`NO`).
    Historical,
}

impl TaskFlag {
    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "YES",
            Self::Historical => "NO",
        }
    }
}

impl FromStr for TaskFlag {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "YES" => Ok(Self::Active),
            "NO" => Ok(Self::Historical),
            other => Err(CoreError::ValidationError {
                field: "flag".to_string(),
                message: format!("unknown task flag '{}'", other),
            }),
        }
    }
}
