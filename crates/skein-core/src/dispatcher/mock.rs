// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock dispatcher for testing.
//!
//! Simulates a worker fleet: every accepted task reports RUNNING_EXECUTION
//! after the execution delay, then the scripted outcome after another delay.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    DispatchAck, DispatchError, Dispatcher, TaskDispatchRequest, TaskStateChange, TaskStateSender,
};
use crate::model::{TaskExecutionStatus, TaskInstance, VarPool};

/// Scripted result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum MockOutcome {
    /// Run, then succeed with the given outputs.
    Succeed(VarPool),
    /// Run, then fail.
    Fail,
    /// Run and never finish until [`MockDispatcher::complete`] or a cancel.
    Hang,
    /// Refuse the dispatch.
    Reject,
}

#[derive(Default)]
struct Shared {
    scripts: HashMap<i64, VecDeque<MockOutcome>>,
    dispatched: Vec<TaskDispatchRequest>,
    cancelled: Vec<i64>,
    running: HashSet<i64>,
    alive: HashSet<i64>,
    sink: Option<TaskStateSender>,
}

fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Mock dispatcher for testing.
pub struct MockDispatcher {
    shared: Arc<Mutex<Shared>>,
    /// Delay before each simulated callback.
    pub execution_delay: Duration,
    /// Outcome for task codes without a script.
    pub default_outcome: MockOutcome,
    /// Host name reported for accepted tasks.
    pub host: String,
}

impl Default for MockDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDispatcher {
    /// Every task succeeds after a short delay.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::default())),
            execution_delay: Duration::from_millis(10),
            default_outcome: MockOutcome::Succeed(VarPool::new()),
            host: "mock-worker".to_string(),
        }
    }

    /// Tasks start and then wait for [`complete`](Self::complete).
    pub fn hanging() -> Self {
        Self {
            default_outcome: MockOutcome::Hang,
            ..Self::new()
        }
    }

    /// Queue outcomes for successive dispatches of `task_code`.
    pub fn script<I>(&self, task_code: i64, outcomes: I)
    where
        I: IntoIterator<Item = MockOutcome>,
    {
        lock(&self.shared)
            .scripts
            .entry(task_code)
            .or_default()
            .extend(outcomes);
    }

    /// Finish a hanging task with `state` and outputs.
    pub fn complete(&self, task_instance_id: i64, state: TaskExecutionStatus, var_pool: VarPool) {
        let mut shared = lock(&self.shared);
        if !shared.running.remove(&task_instance_id) {
            return;
        }
        shared.alive.remove(&task_instance_id);
        if let Some(sink) = &shared.sink {
            let mut change = TaskStateChange::new(task_instance_id, state);
            change.host = Some(self.host.clone());
            change.var_pool_delta = var_pool;
            let _ = sink.send(change);
        }
    }

    /// Report an arbitrary callback, as a worker replaying state would.
    pub fn send_callback(&self, change: TaskStateChange) {
        if let Some(sink) = &lock(&self.shared).sink {
            let _ = sink.send(change);
        }
    }

    /// Make [`Dispatcher::is_alive`] report the attempt as running.
    pub fn mark_alive(&self, task_instance_id: i64) {
        lock(&self.shared).alive.insert(task_instance_id);
    }

    /// Requests dispatched so far, in order.
    pub fn dispatched(&self) -> Vec<TaskDispatchRequest> {
        lock(&self.shared).dispatched.clone()
    }

    /// Task codes dispatched so far, in order.
    pub fn dispatched_codes(&self) -> Vec<i64> {
        lock(&self.shared)
            .dispatched
            .iter()
            .map(|r| r.task_code)
            .collect()
    }

    /// Task instance ids cancelled so far.
    pub fn cancelled(&self) -> Vec<i64> {
        lock(&self.shared).cancelled.clone()
    }

    /// Task instance ids currently running.
    pub fn running(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = lock(&self.shared).running.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn next_outcome(&self, task_code: i64) -> MockOutcome {
        lock(&self.shared)
            .scripts
            .get_mut(&task_code)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default_outcome.clone())
    }
}

#[async_trait]
impl Dispatcher for MockDispatcher {
    fn dispatcher_type(&self) -> &'static str {
        "mock"
    }

    fn set_callback_sink(&self, sink: TaskStateSender) {
        lock(&self.shared).sink = Some(sink);
    }

    async fn dispatch(&self, request: &TaskDispatchRequest) -> Result<DispatchAck, DispatchError> {
        let outcome = self.next_outcome(request.task_code);
        let task_instance_id = request.task_instance_id;

        {
            let mut shared = lock(&self.shared);
            shared.dispatched.push(request.clone());
            if outcome == MockOutcome::Reject {
                return Err(DispatchError::Rejected(format!(
                    "mock worker refused task instance {}",
                    task_instance_id
                )));
            }
            shared.running.insert(task_instance_id);
            shared.alive.insert(task_instance_id);
        }

        let shared = self.shared.clone();
        let delay = self.execution_delay;
        let host = self.host.clone();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let guard = lock(&shared);
                if !guard.running.contains(&task_instance_id) {
                    return;
                }
                if let Some(sink) = &guard.sink {
                    let mut change =
                        TaskStateChange::new(task_instance_id, TaskExecutionStatus::RunningExecution);
                    change.host = Some(host.clone());
                    change.log_path = Some(format!("/var/log/skein/{}.log", task_instance_id));
                    let _ = sink.send(change);
                }
            }

            let (state, var_pool) = match outcome {
                MockOutcome::Succeed(vars) => (TaskExecutionStatus::Success, vars),
                MockOutcome::Fail => (TaskExecutionStatus::Failure, VarPool::new()),
                MockOutcome::Hang | MockOutcome::Reject => return,
            };

            tokio::time::sleep(delay).await;
            let mut guard = lock(&shared);
            if !guard.running.remove(&task_instance_id) {
                return;
            }
            guard.alive.remove(&task_instance_id);
            if let Some(sink) = &guard.sink {
                let mut change = TaskStateChange::new(task_instance_id, state);
                change.host = Some(host);
                change.var_pool_delta = var_pool;
                let _ = sink.send(change);
            }
        });

        Ok(DispatchAck {
            host: self.host.clone(),
        })
    }

    async fn cancel(&self, task_instance_id: i64) -> Result<(), DispatchError> {
        let mut shared = lock(&self.shared);
        shared.cancelled.push(task_instance_id);
        if shared.running.remove(&task_instance_id) {
            shared.alive.remove(&task_instance_id);
            if let Some(sink) = &shared.sink {
                let mut change = TaskStateChange::new(task_instance_id, TaskExecutionStatus::Kill);
                change.host = Some(self.host.clone());
                let _ = sink.send(change);
            }
        }
        Ok(())
    }

    async fn is_alive(&self, task: &TaskInstance) -> bool {
        lock(&self.shared).alive.contains(&task.id)
    }
}
