// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task attempt handling: creation, dispatch, worker callbacks, retry,
//! timeouts and cancellation.

use std::time::Duration;

use chrono::Utc;
use skein_core::CoreError;
use skein_core::dispatcher::{TaskDispatchRequest, TaskStateChange};
use skein_core::model::{
    FailureStrategy, TaskExecutionStatus, TaskFlag, TaskInstance, TaskTransition, TaskType,
    VarPool, WorkflowExecutionStatus,
};
use skein_core::params::{merge_outputs, resolve_task_params};
use tracing::{debug, info, warn};

use super::{ControlCommand, Halt, Step, WorkflowEngine, WorkflowEvent};
use crate::event::SystemEvent;

/// Transition that moves an active attempt into `target`.
fn settle_transition(target: TaskExecutionStatus) -> Option<TaskTransition> {
    match target {
        TaskExecutionStatus::Kill => Some(TaskTransition::Killed),
        TaskExecutionStatus::Pause => Some(TaskTransition::Paused),
        TaskExecutionStatus::Failure => Some(TaskTransition::Failed),
        TaskExecutionStatus::NeedFaultTolerance => Some(TaskTransition::FaultTolerance),
        _ => None,
    }
}

impl WorkflowEngine {
    // ---- attempts ----

    /// First attempt of task `code`.
    pub(super) async fn create_attempt(
        &mut self,
        code: i64,
        state: TaskExecutionStatus,
    ) -> Result<i64, Halt> {
        let Some(task) = self.definition.task(code) else {
            return Err(Halt::Degraded(CoreError::InvalidDag {
                reason: format!("task {} missing from definition {}", code, self.definition.code),
            }));
        };
        let attempt = TaskInstance::first_attempt(task, self.instance.id, state, Utc::now());
        let id = self.insert_attempt(attempt).await?;
        debug!(
            instance_id = self.instance.id,
            task_instance_id = id,
            task_code = code,
            %state,
            "Task attempt created"
        );
        Ok(id)
    }

    /// Retire `old` and insert the next attempt of its retry chain.
    pub(super) async fn replace_attempt(
        &mut self,
        old: &TaskInstance,
        state: TaskExecutionStatus,
        retry_times: u32,
    ) -> Result<i64, Halt> {
        let mut retired = old.clone();
        retired.flag = TaskFlag::Historical;
        self.commit_task(retired).await?;
        self.ctx.registry.unroute_task(old.id);
        self.cancelling.remove(&old.id);

        let fresh = old.next_attempt(state, retry_times, Utc::now());
        self.insert_attempt(fresh).await
    }

    /// Apply a task transition, persist it and notify observers.
    ///
    /// An illegal transition is logged and skipped; the result tells whether
    /// the attempt moved.
    async fn transition_task<F>(
        &mut self,
        id: i64,
        transition: TaskTransition,
        update: F,
    ) -> Result<bool, Halt>
    where
        F: FnOnce(&mut TaskInstance) + Send,
    {
        let Some(current) = self.tasks.get(&id) else {
            return Ok(false);
        };
        let state = match current.state.apply(transition) {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    instance_id = self.instance.id,
                    task_instance_id = id,
                    error = %err,
                    "Ignoring task transition"
                );
                return Ok(false);
            }
        };

        let now = Utc::now();
        let mut next = current.clone();
        next.state = state;
        if state == TaskExecutionStatus::RunningExecution && next.start_time.is_none() {
            next.start_time = Some(now);
        }
        if state.is_finished() {
            next.end_time = Some(now);
        }
        update(&mut next);
        self.commit_task(next).await?;

        if state.is_finished() {
            self.ctx.registry.unroute_task(id);
            self.cancelling.remove(&id);
        }
        if let Some(attempt) = self.tasks.get(&id) {
            self.publish_task_state(attempt);
        }
        Ok(true)
    }

    pub(super) fn publish_task_state(&self, attempt: &TaskInstance) {
        self.ctx.bus.publish(SystemEvent::TaskStateChanged {
            workflow_instance_id: self.instance.id,
            task_instance_id: attempt.id,
            task_code: attempt.task_code,
            state: attempt.state,
        });
    }

    /// Move an active attempt straight into `target`.
    pub(super) async fn settle_task(&mut self, id: i64, target: TaskExecutionStatus) -> Step {
        let Some(transition) = settle_transition(target) else {
            return Ok(());
        };
        self.cancelling.remove(&id);
        let moved = self.transition_task(id, transition, |_| {}).await?;
        if moved && self.dispatching.contains(&id) {
            self.settled_in_flight.insert(id);
        }
        Ok(())
    }

    /// Settle a cancelled attempt; a cancel caused by a failing timeout goes
    /// through retry handling.
    async fn settle_cancelled(&mut self, id: i64, target: TaskExecutionStatus) -> Step {
        self.settle_task(id, target).await?;
        if target == TaskExecutionStatus::Failure {
            self.on_task_failed(id).await?;
        }
        Ok(())
    }

    async fn fail_task(&mut self, id: i64, host: Option<String>, log_path: Option<String>) -> Step {
        let moved = self
            .transition_task(id, TaskTransition::Failed, move |t| {
                if host.is_some() {
                    t.host = host;
                }
                if log_path.is_some() {
                    t.log_path = log_path;
                }
            })
            .await?;
        if moved {
            self.on_task_failed(id).await?;
        }
        Ok(())
    }

    async fn succeed_task(
        &mut self,
        id: i64,
        host: Option<String>,
        log_path: Option<String>,
        delta: VarPool,
    ) -> Step {
        let reported = delta.clone();
        let moved = self
            .transition_task(id, TaskTransition::Succeeded, move |t| {
                if host.is_some() {
                    t.host = host;
                }
                if log_path.is_some() {
                    t.log_path = log_path;
                }
                t.var_pool = reported;
            })
            .await?;
        if !moved {
            return Ok(());
        }

        let Some(code) = self.tasks.get(&id).map(|t| t.task_code) else {
            return Ok(());
        };
        let Some(task) = self.definition.task(code) else {
            return Ok(());
        };
        let mut next = self.instance.clone();
        let written = merge_outputs(&mut next.var_pool, task, &delta);
        if written > 0 {
            debug!(
                instance_id = self.instance.id,
                task_instance_id = id,
                written,
                "Task outputs merged into variable pool"
            );
            self.commit_instance(next).await?;
        }
        Ok(())
    }

    // ---- dispatch ----

    /// Hand a SUBMITTED attempt to a worker, or start its child instance.
    pub(super) async fn dispatch_task(&mut self, id: i64) -> Step {
        let Some(attempt) = self.tasks.get(&id).cloned() else {
            return Ok(());
        };
        let Some(task) = self.definition.task(attempt.task_code).cloned() else {
            return Ok(());
        };

        if let TaskType::SubWorkflow {
            definition_code,
            definition_version,
        } = task.task_type
        {
            return self
                .start_sub_workflow(&attempt, definition_code, definition_version)
                .await;
        }

        let request = TaskDispatchRequest {
            task_instance_id: id,
            workflow_instance_id: self.instance.id,
            task_code: attempt.task_code,
            task_name: attempt.name.clone(),
            task_type: attempt.task_type.clone(),
            params: resolve_task_params(&task, &self.instance.var_pool),
            var_pool: self.instance.var_pool.clone(),
            worker_group: attempt.worker_group.clone(),
            priority: attempt.priority,
            retry_times: attempt.retry_times,
        };

        self.dispatching.insert(id);
        let dispatcher = self.ctx.dispatcher.clone();
        let sender = self.sender.clone();
        let timeout = self.ctx.config.dispatch_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(timeout, dispatcher.dispatch(&request)).await {
                Ok(Ok(ack)) => Ok(ack.host),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err(format!("dispatch timed out after {:?}", timeout)),
            };
            let _ = sender.send(WorkflowEvent::DispatchOutcome {
                task_instance_id: id,
                result,
            });
        });

        debug!(
            instance_id = self.instance.id,
            task_instance_id = id,
            task_code = attempt.task_code,
            retry_times = attempt.retry_times,
            "Task dispatch issued"
        );
        Ok(())
    }

    /// Create the child instance and move the attempt to DISPATCHED pointing
    /// at it in one write, then launch the child.
    async fn start_sub_workflow(
        &mut self,
        attempt: &TaskInstance,
        definition_code: i64,
        definition_version: i32,
    ) -> Step {
        let id = attempt.id;
        let child = match self
            .ctx
            .prepare_child(&self.instance, attempt, definition_code, definition_version)
            .await
        {
            Ok(child) => child,
            Err(err) => {
                warn!(
                    instance_id = self.instance.id,
                    task_instance_id = id,
                    error = %err,
                    "Could not create sub-workflow instance"
                );
                return self.fail_task(id, None, None).await;
            }
        };

        let state = match attempt.state.apply(TaskTransition::Dispatched) {
            Ok(state) => state,
            Err(err) => {
                warn!(
                    instance_id = self.instance.id,
                    task_instance_id = id,
                    error = %err,
                    "Ignoring task transition"
                );
                return Ok(());
            }
        };
        let mut next = attempt.clone();
        next.state = state;
        next.host = Some(self.ctx.node_id.clone());

        let ctx = self.ctx.clone();
        let child_id = ctx
            .persist(self.instance.id, "insert_sub_workflow", || {
                ctx.repository.insert_sub_workflow(&child, &next, &ctx.node_id)
            })
            .await?;
        next.sub_workflow_instance_id = Some(child_id);
        self.publish_task_state(&next);
        self.tasks.insert(id, next);
        debug!(
            instance_id = self.instance.id,
            child_instance_id = child_id,
            task_instance_id = id,
            "Sub-workflow instance created"
        );

        if let Err(err) = self.ctx.launch(child_id, false).await {
            warn!(
                instance_id = self.instance.id,
                child_instance_id = child_id,
                error = %err,
                "Could not launch sub-workflow engine"
            );
            return self.fail_task(id, None, None).await;
        }
        info!(
            instance_id = self.instance.id,
            task_instance_id = id,
            child_instance_id = child_id,
            "Sub-workflow started"
        );
        Ok(())
    }

    /// Point a fresh attempt at an existing paused child and resume it.
    pub(super) async fn resume_sub_workflow(&mut self, id: i64, child: i64) -> Step {
        let host = self.ctx.node_id.clone();
        self.transition_task(id, TaskTransition::Dispatched, move |t| {
            t.sub_workflow_instance_id = Some(child);
            t.host = Some(host);
        })
        .await?;

        if !self.ctx.registry.contains(child)
            && let Err(err) = self.ctx.launch(child, false).await
        {
            warn!(
                instance_id = self.instance.id,
                child_instance_id = child,
                error = %err,
                "Could not launch paused sub-workflow"
            );
            return self.fail_task(id, None, None).await;
        }
        self.ctx.signal(child, ControlCommand::Recover);
        Ok(())
    }

    async fn mark_dispatched(&mut self, id: i64, host: String) -> Step {
        let moved = self
            .transition_task(id, TaskTransition::Dispatched, move |t| t.host = Some(host))
            .await?;
        if !moved {
            return Ok(());
        }

        let timeout = self
            .tasks
            .get(&id)
            .and_then(|t| self.definition.task(t.task_code))
            .and_then(|task| task.timeout.duration());
        if let Some(timeout) = timeout {
            self.schedule(timeout, WorkflowEvent::TaskTimeout { task_instance_id: id });
        }
        Ok(())
    }

    /// Arm the timeouts of attempts that were already on a worker when this
    /// engine was rebuilt, counting from their submit time.
    pub(super) fn rearm_task_timeouts(&self) {
        let now = Utc::now();
        for attempt in self.active_attempts() {
            let on_worker = matches!(
                attempt.state,
                TaskExecutionStatus::Dispatched | TaskExecutionStatus::RunningExecution
            );
            if !on_worker || attempt.sub_workflow_instance_id.is_some() {
                continue;
            }
            let Some(timeout) = self
                .definition
                .task(attempt.task_code)
                .and_then(|task| task.timeout.duration())
            else {
                continue;
            };

            let elapsed = (now - attempt.submit_time).to_std().unwrap_or_default();
            let remaining = timeout.saturating_sub(elapsed);
            debug!(
                instance_id = self.instance.id,
                task_instance_id = attempt.id,
                remaining_ms = remaining.as_millis() as u64,
                "Task timeout re-armed"
            );
            self.schedule(
                remaining,
                WorkflowEvent::TaskTimeout {
                    task_instance_id: attempt.id,
                },
            );
        }
    }

    pub(super) async fn on_dispatch_outcome(&mut self, id: i64, result: Result<String, String>) -> Step {
        self.dispatching.remove(&id);
        if self.settled_in_flight.remove(&id) {
            // Settled while the dispatch was in flight; the worker may have it now.
            if result.is_ok() {
                self.send_cancel(id);
            }
            return Ok(());
        }
        let Some(attempt) = self.tasks.get(&id) else {
            return Ok(());
        };
        if !attempt.is_active_flag() || attempt.state.is_finished() {
            debug!(task_instance_id = id, "Dispatch outcome for settled attempt ignored");
            return Ok(());
        }
        let state = attempt.state;

        match result {
            Ok(host) => {
                if state == TaskExecutionStatus::Submitted {
                    self.mark_dispatched(id, host).await?;
                }
                // A cancel requested while the dispatch was in flight.
                if self.cancelling.contains_key(&id) {
                    self.issue_cancel(id);
                }
            }
            Err(reason) => match self.cancelling.get(&id).copied() {
                Some(target) => self.settle_cancelled(id, target).await?,
                None => {
                    warn!(
                        instance_id = self.instance.id,
                        task_instance_id = id,
                        reason = %reason,
                        "Task dispatch failed"
                    );
                    self.fail_task(id, None, None).await?;
                }
            },
        }

        self.advance().await
    }

    // ---- callbacks ----

    pub(super) async fn on_task_state_change(&mut self, change: TaskStateChange) -> Step {
        let id = change.task_instance_id;
        let Some(attempt) = self.tasks.get(&id) else {
            debug!(task_instance_id = id, "Callback for unknown task attempt discarded");
            return Ok(());
        };
        if !attempt.is_active_flag() || attempt.state.is_finished() {
            debug!(
                task_instance_id = id,
                state = %change.state,
                current = %attempt.state,
                "Duplicate or stale callback discarded"
            );
            return Ok(());
        }

        if attempt.state == TaskExecutionStatus::Submitted {
            let host = change.host.clone().unwrap_or_default();
            self.mark_dispatched(id, host).await?;
        }

        match change.state {
            TaskExecutionStatus::RunningExecution => {
                if self.tasks.get(&id).map(|t| t.state) == Some(TaskExecutionStatus::Dispatched) {
                    let TaskStateChange { host, log_path, .. } = change;
                    self.transition_task(id, TaskTransition::Started, move |t| {
                        if host.is_some() {
                            t.host = host;
                        }
                        t.log_path = log_path;
                    })
                    .await?;
                }
            }
            TaskExecutionStatus::Success => {
                self.succeed_task(id, change.host, change.log_path, change.var_pool_delta)
                    .await?
            }
            TaskExecutionStatus::Failure => self.fail_task(id, change.host, change.log_path).await?,
            TaskExecutionStatus::Kill => {
                let target = self
                    .cancelling
                    .get(&id)
                    .copied()
                    .unwrap_or(TaskExecutionStatus::Kill);
                self.settle_cancelled(id, target).await?;
            }
            other => {
                warn!(task_instance_id = id, state = %other, "Unexpected callback state ignored");
                return Ok(());
            }
        }

        self.advance().await
    }

    // ---- failure and retry ----

    /// Decide what a FAILURE attempt leads to: a retry, the END of the
    /// workflow, or nothing (CONTINUE).
    pub(super) async fn on_task_failed(&mut self, id: i64) -> Step {
        let Some(attempt) = self.tasks.get(&id).cloned() else {
            return Ok(());
        };
        if attempt.state != TaskExecutionStatus::Failure || !attempt.is_active_flag() {
            return Ok(());
        }
        let Some((max_retry_times, retry_interval)) = self
            .definition
            .task(attempt.task_code)
            .map(|t| (t.max_retry_times, t.retry_interval_secs))
        else {
            return Ok(());
        };

        let workflow_state = self.instance.state;
        let live = matches!(
            workflow_state,
            WorkflowExecutionStatus::RunningExecution | WorkflowExecutionStatus::ReadyPause
        );

        if live && attempt.retry_times < max_retry_times {
            let state = if workflow_state == WorkflowExecutionStatus::RunningExecution {
                TaskExecutionStatus::Submitted
            } else {
                TaskExecutionStatus::Pause
            };
            let fresh = self
                .replace_attempt(&attempt, state, attempt.retry_times + 1)
                .await?;
            info!(
                instance_id = self.instance.id,
                task_code = attempt.task_code,
                failed_attempt = id,
                task_instance_id = fresh,
                retry_times = attempt.retry_times + 1,
                max_retry_times,
                "Task failed, retry scheduled"
            );
            if state == TaskExecutionStatus::Submitted {
                self.schedule(
                    Duration::from_secs(retry_interval),
                    WorkflowEvent::RetryDue {
                        task_instance_id: fresh,
                    },
                );
            }
            return Ok(());
        }

        if live && self.instance.failure_strategy == FailureStrategy::End {
            return self.end_on_failure().await;
        }
        Ok(())
    }

    pub(super) async fn on_retry_due(&mut self, id: i64) -> Step {
        let due = self.instance.state == WorkflowExecutionStatus::RunningExecution
            && !self.dispatching.contains(&id)
            && self
                .tasks
                .get(&id)
                .is_some_and(|t| t.is_active_flag() && t.state == TaskExecutionStatus::Submitted);
        if !due {
            return Ok(());
        }
        self.dispatch_task(id).await?;
        self.advance().await
    }

    // ---- timeouts and cancellation ----

    pub(super) async fn on_task_timeout(&mut self, id: i64) -> Step {
        let Some(attempt) = self.tasks.get(&id) else {
            return Ok(());
        };
        if !attempt.is_active_flag() || !attempt.state.is_active() {
            return Ok(());
        }
        let Some(task) = self.definition.task(attempt.task_code) else {
            return Ok(());
        };
        let strategy = task.timeout.strategy;
        let task_code = attempt.task_code;

        if strategy.warns() {
            warn!(
                instance_id = self.instance.id,
                task_instance_id = id,
                task_code,
                timeout_secs = task.timeout.duration_secs,
                "Task exceeded its timeout"
            );
            self.ctx.bus.publish(SystemEvent::TaskTimeout {
                workflow_instance_id: self.instance.id,
                task_instance_id: id,
                task_code,
            });
        }
        if strategy.fails() {
            self.request_cancel(id, TaskExecutionStatus::Failure);
        }
        Ok(())
    }

    pub(super) async fn on_kill_timeout(&mut self, id: i64) -> Step {
        let Some(target) = self.cancelling.get(&id).copied() else {
            return Ok(());
        };
        if !self.tasks.get(&id).is_some_and(|t| t.state.is_active()) {
            self.cancelling.remove(&id);
            return Ok(());
        }

        warn!(
            instance_id = self.instance.id,
            task_instance_id = id,
            target = %target,
            "Cancel not acknowledged in time, forcing task state"
        );
        self.settle_cancelled(id, target).await?;
        self.advance().await
    }

    /// Settle an attempt that never reached a worker, cancel it otherwise.
    pub(super) async fn cancel_or_kill(&mut self, id: i64, target: TaskExecutionStatus) -> Step {
        let undispatched = !self.dispatching.contains(&id)
            && self
                .tasks
                .get(&id)
                .is_some_and(|t| t.state == TaskExecutionStatus::Submitted);
        if undispatched {
            self.settle_task(id, target).await
        } else {
            self.request_cancel(id, target);
            Ok(())
        }
    }

    /// Ask for an attempt to be cancelled; it settles in `target` once the
    /// worker acknowledges or the kill timeout fires.
    fn request_cancel(&mut self, id: i64, target: TaskExecutionStatus) {
        let first = self.cancelling.insert(id, target).is_none();
        if first {
            self.issue_cancel(id);
            self.schedule(
                self.ctx.config.kill_timeout,
                WorkflowEvent::KillTimeout { task_instance_id: id },
            );
        }
    }

    pub(super) fn issue_cancel(&self, id: i64) {
        let Some(attempt) = self.tasks.get(&id) else {
            return;
        };

        if let Some(child) = attempt.sub_workflow_instance_id {
            let command = match self.cancelling.get(&id) {
                Some(TaskExecutionStatus::Pause) => ControlCommand::Pause,
                _ => ControlCommand::Stop,
            };
            self.ctx.signal(child, command);
            return;
        }

        // Sent once the in-flight dispatch returns.
        if self.dispatching.contains(&id) {
            return;
        }
        self.send_cancel(id);
    }

    /// Ask the dispatcher to cancel attempt `id` on its worker.
    pub(super) fn send_cancel(&self, id: i64) {
        let dispatcher = self.ctx.dispatcher.clone();
        let timeout = self.ctx.config.kill_timeout;
        let instance_id = self.instance.id;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, dispatcher.cancel(id)).await {
                Ok(Ok(())) => debug!(instance_id, task_instance_id = id, "Task cancel sent"),
                Ok(Err(err)) => {
                    warn!(instance_id, task_instance_id = id, error = %err, "Task cancel failed")
                }
                Err(_) => warn!(instance_id, task_instance_id = id, "Task cancel timed out"),
            }
        });
    }

    // ---- sub-workflows ----

    pub(super) async fn on_sub_workflow_state(
        &mut self,
        child: i64,
        _task_instance_id: i64,
        state: WorkflowExecutionStatus,
    ) -> Step {
        let Some((id, current)) = self
            .active_attempts()
            .find(|t| t.sub_workflow_instance_id == Some(child) && t.state.is_active())
            .map(|t| (t.id, t.state))
        else {
            debug!(
                instance_id = self.instance.id,
                child_instance_id = child,
                %state,
                "Child state change without an active attempt ignored"
            );
            return Ok(());
        };

        match state {
            WorkflowExecutionStatus::RunningExecution => {
                if current == TaskExecutionStatus::Dispatched {
                    self.transition_task(id, TaskTransition::Started, |_| {}).await?;
                }
                return Ok(());
            }
            WorkflowExecutionStatus::Success => {
                let outputs = match self.ctx.repository.load_instance(child).await {
                    Ok(Some(instance)) => instance.var_pool,
                    Ok(None) => VarPool::new(),
                    Err(err) => {
                        warn!(child_instance_id = child, error = %err, "Could not load child outputs");
                        VarPool::new()
                    }
                };
                self.succeed_task(id, None, None, outputs).await?;
            }
            WorkflowExecutionStatus::Failure => self.fail_task(id, None, None).await?,
            WorkflowExecutionStatus::Stop => {
                let target = self
                    .cancelling
                    .get(&id)
                    .copied()
                    .unwrap_or(TaskExecutionStatus::Kill);
                self.settle_cancelled(id, target).await?;
            }
            WorkflowExecutionStatus::Pause => {
                self.settle_task(id, TaskExecutionStatus::Pause).await?
            }
            _ => return Ok(()),
        }

        self.advance().await
    }
}
