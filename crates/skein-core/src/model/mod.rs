// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model: definitions, runtime records, commands and state machines.

mod command;
mod definition;
mod instance;
mod schedule;
mod status;

pub use command::{
    BackfillParams, BackfillTimes, Command, CommandType, MAX_BACKFILL_RUNS, RunParams,
};
pub use definition::{
    FailureStrategy, ParamDecl, Priority, TaskDefinition, TaskRelation, TaskTimeout, TaskType,
    TimeoutStrategy, WorkflowDefinition,
};
pub use instance::{ParentLink, TaskInstance, VarPool, WorkflowInstance};
pub use schedule::{
    MAX_CATCH_UP, NodeLease, Schedule, fire_times_between, normalize_cron, parse_cron,
};
pub use status::{
    TaskExecutionStatus, TaskFlag, TaskTransition, WorkflowExecutionStatus, WorkflowTransition,
};
