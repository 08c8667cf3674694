// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Events processed by a workflow engine, one at a time, in queue order.

use skein_core::CoreError;
use skein_core::dispatcher::TaskStateChange;
use skein_core::model::WorkflowExecutionStatus;
use tokio::sync::oneshot;

/// Control signals from the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Stop,
    Recover,
}

impl ControlCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Stop => "stop",
            Self::Recover => "recover",
        }
    }
}

/// Reply channel of a control command: accepted, or rejected with the reason.
pub type ControlReply = oneshot::Sender<Result<(), CoreError>>;

/// Input to a workflow engine.
#[derive(Debug)]
pub enum WorkflowEvent {
    /// Take the instance: fresh start, repeat run, or resume after failover.
    Start { repeat_run: bool },
    /// Worker callback for one of this instance's task attempts.
    TaskStateChanged(TaskStateChange),
    /// Result of a dispatch call issued off the loop.
    DispatchOutcome {
        task_instance_id: i64,
        result: Result<String, String>,
    },
    /// Retry interval of a waiting attempt elapsed.
    RetryDue { task_instance_id: i64 },
    /// Task timeout elapsed.
    TaskTimeout { task_instance_id: i64 },
    /// A cancel was not acknowledged in time.
    KillTimeout { task_instance_id: i64 },
    /// Warning timeout of the whole instance elapsed.
    WorkflowTimeout,
    /// Pause, stop or recover.
    Control {
        command: ControlCommand,
        reply: ControlReply,
    },
    /// State change of a child instance started by one of our tasks.
    SubWorkflowStateChanged {
        child_instance_id: i64,
        task_instance_id: i64,
        state: WorkflowExecutionStatus,
    },
    /// This node lost its lease; stop without writing anything more.
    StandDown,
}

impl WorkflowEvent {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::TaskStateChanged(_) => "task_state_changed",
            Self::DispatchOutcome { .. } => "dispatch_outcome",
            Self::RetryDue { .. } => "retry_due",
            Self::TaskTimeout { .. } => "task_timeout",
            Self::KillTimeout { .. } => "kill_timeout",
            Self::WorkflowTimeout => "workflow_timeout",
            Self::Control { .. } => "control",
            Self::SubWorkflowStateChanged { .. } => "sub_workflow_state_changed",
            Self::StandDown => "stand_down",
        }
    }
}
