// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! DAG execution engine.
//!
//! One [`WorkflowEngine`] owns one workflow instance. It runs as its own tokio
//! task and processes [`WorkflowEvent`]s strictly one at a time from an
//! unbounded FIFO queue, so its in-memory state needs no locking. A shared
//! semaphore (`exec_threads`) bounds how many engines process an event at
//! the same moment.
//!
//! Every state change follows the same order: compute the next record on a
//! clone, persist it (retrying transient failures), and only then replace
//! the in-memory copy. If persistence keeps failing the engine degrades: it
//! stops processing, publishes [`SystemEvent::WorkflowDegraded`] and leaves
//! the registry, leaving the persisted state for failover to pick up.
//!
//! Writes are fenced by ownership. Once another master has claimed the
//! instance, or this node's lease lapsed, the engine is disowned: it leaves
//! the registry without writing anything more.
//!
//! Task attempt handling (dispatch, callbacks, retry, timeout, cancel) lives
//! in `task.rs`.

mod context;
mod event;
mod task;

pub use context::EngineContext;
pub use event::{ControlCommand, ControlReply, WorkflowEvent};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skein_core::CoreError;
use skein_core::dag::Dag;
use skein_core::model::{
    CommandType, TaskExecutionStatus, TaskFlag, TaskInstance, WorkflowDefinition,
    WorkflowExecutionStatus, WorkflowInstance, WorkflowTransition,
};
use skein_core::params::initial_var_pool;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::event::SystemEvent;

/// Why an engine loop stops.
#[derive(Debug)]
pub(crate) enum Halt {
    /// The instance reached a terminal state.
    Finished,
    /// Persistence retries were exhausted.
    Degraded(CoreError),
    /// Another node owns the instance now.
    Disowned(String),
}

impl From<CoreError> for Halt {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotLocallyOwned { .. } => Halt::Disowned(err.to_string()),
            err => Halt::Degraded(err),
        }
    }
}

pub(crate) type Step = Result<(), Halt>;

/// Runtime state of one workflow instance.
pub(crate) struct WorkflowEngine {
    ctx: Arc<EngineContext>,
    definition: Arc<WorkflowDefinition>,
    dag: Dag,
    instance: WorkflowInstance,
    /// Every attempt of this instance, by id.
    tasks: BTreeMap<i64, TaskInstance>,
    /// Task code -> id of its ACTIVE attempt.
    active: HashMap<i64, i64>,
    /// Attempts with a dispatch call in flight.
    dispatching: HashSet<i64>,
    /// Attempts being cancelled -> state they settle in once the kill lands.
    cancelling: HashMap<i64, TaskExecutionStatus>,
    /// Attempts settled while their dispatch call was in flight; cancelled
    /// on the worker once the dispatch lands.
    settled_in_flight: HashSet<i64>,
    sender: mpsc::UnboundedSender<WorkflowEvent>,
    receiver: mpsc::UnboundedReceiver<WorkflowEvent>,
}

impl WorkflowEngine {
    pub(crate) fn new(
        ctx: Arc<EngineContext>,
        definition: Arc<WorkflowDefinition>,
        dag: Dag,
        instance: WorkflowInstance,
        attempts: Vec<TaskInstance>,
        sender: mpsc::UnboundedSender<WorkflowEvent>,
        receiver: mpsc::UnboundedReceiver<WorkflowEvent>,
    ) -> Self {
        let mut tasks = BTreeMap::new();
        let mut active = HashMap::new();
        for attempt in attempts {
            if attempt.flag == TaskFlag::Active {
                active.insert(attempt.task_code, attempt.id);
                if attempt.state.is_active() {
                    ctx.registry.route_task(attempt.id, instance.id);
                }
            }
            tasks.insert(attempt.id, attempt);
        }

        Self {
            ctx,
            definition,
            dag,
            instance,
            tasks,
            active,
            dispatching: HashSet::new(),
            cancelling: HashMap::new(),
            settled_in_flight: HashSet::new(),
            sender,
            receiver,
        }
    }

    /// The event loop. Boxed so engines can launch child engines.
    pub(crate) fn run(mut self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let instance_id = self.instance.id;
            let shutdown = self.ctx.shutdown.clone();

            loop {
                let event = tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        debug!(instance_id, "Engine stopping on shutdown");
                        break;
                    }

                    event = self.receiver.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };

                let Ok(permit) = self.ctx.permits.clone().acquire_owned().await else {
                    break;
                };
                let outcome = self.handle(event).await;
                drop(permit);

                match outcome {
                    Ok(()) => {}
                    Err(Halt::Finished) => {
                        debug!(instance_id, state = %self.instance.state, "Engine finished");
                        self.drain_dispatches().await;
                        break;
                    }
                    Err(Halt::Degraded(err)) => {
                        self.degrade(err);
                        break;
                    }
                    Err(Halt::Disowned(reason)) => {
                        self.disown(&reason);
                        break;
                    }
                }
            }
        })
    }

    /// After the instance finished, wait for dispatch calls still in flight
    /// and cancel the attempts they put on a worker.
    async fn drain_dispatches(&mut self) {
        if self.dispatching.is_empty() {
            return;
        }
        debug!(
            instance_id = self.instance.id,
            in_flight = self.dispatching.len(),
            "Waiting for in-flight dispatches"
        );
        let shutdown = self.ctx.shutdown.clone();

        while !self.dispatching.is_empty() {
            let event = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                event = self.receiver.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let WorkflowEvent::DispatchOutcome {
                task_instance_id,
                result,
            } = event
            {
                self.dispatching.remove(&task_instance_id);
                if self.settled_in_flight.remove(&task_instance_id) && result.is_ok() {
                    self.send_cancel(task_instance_id);
                }
            }
        }
    }

    async fn handle(&mut self, event: WorkflowEvent) -> Step {
        debug!(
            instance_id = self.instance.id,
            event = event.kind(),
            state = %self.instance.state,
            "Processing workflow event"
        );
        match event {
            WorkflowEvent::Start { repeat_run } => self.on_start(repeat_run).await,
            WorkflowEvent::TaskStateChanged(change) => self.on_task_state_change(change).await,
            WorkflowEvent::DispatchOutcome {
                task_instance_id,
                result,
            } => self.on_dispatch_outcome(task_instance_id, result).await,
            WorkflowEvent::RetryDue { task_instance_id } => self.on_retry_due(task_instance_id).await,
            WorkflowEvent::TaskTimeout { task_instance_id } => {
                self.on_task_timeout(task_instance_id).await
            }
            WorkflowEvent::KillTimeout { task_instance_id } => {
                self.on_kill_timeout(task_instance_id).await
            }
            WorkflowEvent::WorkflowTimeout => {
                self.on_workflow_timeout();
                Ok(())
            }
            WorkflowEvent::Control { command, reply } => self.on_control(command, reply).await,
            WorkflowEvent::SubWorkflowStateChanged {
                child_instance_id,
                task_instance_id,
                state,
            } => {
                self.on_sub_workflow_state(child_instance_id, task_instance_id, state)
                    .await
            }
            WorkflowEvent::StandDown => Err(Halt::Disowned("lease lapsed".to_string())),
        }
    }

    fn degrade(&mut self, err: CoreError) {
        error!(
            instance_id = self.instance.id,
            state = %self.instance.state,
            error = %err,
            "Workflow engine degraded, leaving instance for recovery"
        );
        self.ctx.registry.deregister(self.instance.id);
        self.ctx.bus.publish(SystemEvent::WorkflowDegraded {
            instance_id: self.instance.id,
            reason: err.to_string(),
        });
    }

    fn disown(&mut self, reason: &str) {
        warn!(
            instance_id = self.instance.id,
            state = %self.instance.state,
            reason,
            "Workflow engine disowned, stopping without further writes"
        );
        self.ctx.registry.deregister(self.instance.id);
    }

    // ---- start / resume ----

    async fn on_start(&mut self, repeat_run: bool) -> Step {
        let state = self.instance.state;

        if repeat_run {
            if !state.is_terminal() {
                warn!(instance_id = self.instance.id, %state, "Repeat run of a live instance ignored");
                return Ok(());
            }
            self.begin_repeat_run().await?;
        } else if state == WorkflowExecutionStatus::Submitted {
            self.transition_workflow(WorkflowTransition::Start).await?;
        } else if state.is_terminal() {
            debug!(instance_id = self.instance.id, %state, "Instance already finished");
            self.ctx.registry.deregister(self.instance.id);
            return Err(Halt::Finished);
        } else {
            info!(instance_id = self.instance.id, %state, "Resuming workflow instance");
            self.rearm_task_timeouts();
        }

        if let Some(timeout) = self.definition.warning_timeout()
            && self.instance.state != WorkflowExecutionStatus::Pause
        {
            let elapsed = self
                .instance
                .start_time
                .map(|t| (Utc::now() - t).to_std().unwrap_or_default())
                .unwrap_or_default();
            self.schedule(timeout.saturating_sub(elapsed), WorkflowEvent::WorkflowTimeout);
        }

        match self.instance.state {
            WorkflowExecutionStatus::RunningExecution => {
                for id in self.undispatched_attempts() {
                    self.dispatch_task(id).await?;
                }
            }
            WorkflowExecutionStatus::ReadyPause => {
                for id in self.undispatched_attempts() {
                    self.settle_task(id, TaskExecutionStatus::Pause).await?;
                }
            }
            WorkflowExecutionStatus::ReadyStop => {
                for id in self.active_attempt_ids() {
                    self.cancel_or_kill(id, TaskExecutionStatus::Kill).await?;
                }
            }
            _ => {}
        }

        self.advance().await
    }

    async fn begin_repeat_run(&mut self) -> Step {
        // The previous pass becomes history.
        let previous: Vec<i64> = self.active.values().copied().collect();
        for id in previous {
            if let Some(attempt) = self.tasks.get(&id) {
                let mut next = attempt.clone();
                next.flag = TaskFlag::Historical;
                self.commit_task(next).await?;
                self.ctx.registry.unroute_task(id);
            }
        }
        self.active.clear();

        let now = Utc::now();
        let mut next = self.instance.clone();
        next.state = self.apply_workflow(WorkflowTransition::RepeatRun)?;
        next.run_times += 1;
        next.command_type = CommandType::RepeatRun;
        next.start_time = Some(now);
        next.end_time = None;
        next.host = self.ctx.node_id.clone();
        next.var_pool = initial_var_pool(&self.definition, &next.command_params);
        self.commit_instance(next).await?;

        info!(
            instance_id = self.instance.id,
            run_times = self.instance.run_times,
            "Repeat run started"
        );
        self.publish_workflow_state();
        Ok(())
    }

    // ---- DAG progress ----

    /// Create attempts for newly runnable tasks, then check whether the
    /// instance settles.
    async fn advance(&mut self) -> Step {
        let initial = match self.instance.state {
            WorkflowExecutionStatus::RunningExecution => TaskExecutionStatus::Submitted,
            WorkflowExecutionStatus::ReadyPause => TaskExecutionStatus::Pause,
            _ => return self.check_settled().await,
        };

        let ready = {
            let tasks = &self.tasks;
            let active = &self.active;
            self.dag.ready_tasks(
                &self.definition,
                self.instance.failure_strategy,
                |code| active.get(&code).and_then(|id| tasks.get(id)).map(|t| t.state),
            )
        };

        for code in ready {
            let id = self.create_attempt(code, initial).await?;
            if initial == TaskExecutionStatus::Submitted {
                self.dispatch_task(id).await?;
            }
        }

        self.check_settled().await
    }

    /// Move the workflow out of RUNNING_EXECUTION / READY_* once no attempt
    /// is active any more.
    async fn check_settled(&mut self) -> Step {
        if self.has_active_tasks() {
            return Ok(());
        }

        match self.instance.state {
            WorkflowExecutionStatus::RunningExecution => {
                let outcome = self.outcome_transition();
                self.finish(outcome).await
            }
            WorkflowExecutionStatus::ReadyPause => {
                if self.any_active_in(TaskExecutionStatus::Pause) {
                    self.transition_workflow(WorkflowTransition::PauseSettled)
                        .await?;
                    info!(instance_id = self.instance.id, "Workflow instance paused");
                    Ok(())
                } else {
                    let outcome = self.outcome_transition();
                    self.finish(outcome).await
                }
            }
            WorkflowExecutionStatus::ReadyStop => {
                self.finish(WorkflowTransition::StopSettled).await
            }
            _ => Ok(()),
        }
    }

    fn outcome_transition(&self) -> WorkflowTransition {
        let failed = self
            .active_attempts()
            .any(|t| matches!(t.state, TaskExecutionStatus::Failure | TaskExecutionStatus::Kill));
        if failed {
            WorkflowTransition::Fail
        } else {
            WorkflowTransition::Succeed
        }
    }

    /// Persist a terminal state, notify, and leave the registry.
    async fn finish(&mut self, transition: WorkflowTransition) -> Step {
        self.transition_workflow(transition).await?;
        info!(
            instance_id = self.instance.id,
            state = %self.instance.state,
            run_times = self.instance.run_times,
            "Workflow instance finished"
        );
        self.ctx.registry.deregister(self.instance.id);
        Err(Halt::Finished)
    }

    /// FAILURE under the END strategy: persist the failure first, then kill
    /// everything still active.
    async fn end_on_failure(&mut self) -> Step {
        self.transition_workflow(WorkflowTransition::Fail).await?;
        warn!(
            instance_id = self.instance.id,
            "Task failed under END strategy, killing remaining tasks"
        );

        for id in self.active_attempt_ids() {
            self.issue_cancel(id);
            self.cancelling.remove(&id);
            self.settle_task(id, TaskExecutionStatus::Kill).await?;
        }

        self.ctx.registry.deregister(self.instance.id);
        Err(Halt::Finished)
    }

    // ---- control commands ----

    async fn on_control(&mut self, command: ControlCommand, reply: ControlReply) -> Step {
        if let Err(rejection) = self.validate_control(command) {
            debug!(
                instance_id = self.instance.id,
                command = command.as_str(),
                error = %rejection,
                "Control command rejected"
            );
            let _ = reply.send(Err(rejection));
            return Ok(());
        }

        let outcome = match command {
            ControlCommand::Pause => self.pause().await,
            ControlCommand::Stop => self.stop().await,
            ControlCommand::Recover => self.recover().await,
        };

        let _ = reply.send(match &outcome {
            Err(Halt::Degraded(err)) => Err(err.clone()),
            Err(Halt::Disowned(_)) => Err(CoreError::EngineUnavailable {
                instance_id: self.instance.id,
            }),
            _ => Ok(()),
        });
        outcome
    }

    fn validate_control(&self, command: ControlCommand) -> Result<(), CoreError> {
        use WorkflowExecutionStatus as S;

        let state = self.instance.state;
        let (allowed, expected) = match command {
            ControlCommand::Pause => (state == S::RunningExecution, "RUNNING_EXECUTION"),
            ControlCommand::Stop => (
                matches!(
                    state,
                    S::Submitted | S::RunningExecution | S::ReadyPause | S::Pause
                ),
                "SUBMITTED, RUNNING_EXECUTION, READY_PAUSE or PAUSE",
            ),
            ControlCommand::Recover => (state == S::Pause, "PAUSE"),
        };

        if allowed {
            Ok(())
        } else {
            Err(CoreError::InvalidInstanceState {
                instance_id: self.instance.id,
                expected: expected.to_string(),
                actual: state.to_string(),
            })
        }
    }

    async fn pause(&mut self) -> Step {
        self.transition_workflow(WorkflowTransition::Pause).await?;
        info!(instance_id = self.instance.id, "Pause requested");

        for id in self.active_attempt_ids() {
            let Some(attempt) = self.tasks.get(&id) else {
                continue;
            };
            if attempt.state == TaskExecutionStatus::Submitted && !self.dispatching.contains(&id) {
                self.settle_task(id, TaskExecutionStatus::Pause).await?;
            } else if let Some(child) = attempt.sub_workflow_instance_id {
                self.ctx.signal(child, ControlCommand::Pause);
            }
        }

        self.advance().await
    }

    async fn stop(&mut self) -> Step {
        info!(instance_id = self.instance.id, state = %self.instance.state, "Stop requested");

        if matches!(
            self.instance.state,
            WorkflowExecutionStatus::Pause | WorkflowExecutionStatus::Submitted
        ) {
            for id in self.active_attempt_ids() {
                self.settle_task(id, TaskExecutionStatus::Kill).await?;
            }
            return self.finish(WorkflowTransition::Stop).await;
        }

        self.transition_workflow(WorkflowTransition::Stop).await?;
        for id in self.active_attempt_ids() {
            self.cancel_or_kill(id, TaskExecutionStatus::Kill).await?;
        }
        self.advance().await
    }

    async fn recover(&mut self) -> Step {
        self.transition_workflow(WorkflowTransition::Recover).await?;
        info!(instance_id = self.instance.id, "Recovering paused workflow instance");

        let paused: Vec<i64> = self
            .active_attempts()
            .filter(|t| t.state == TaskExecutionStatus::Pause)
            .map(|t| t.id)
            .collect();

        for id in paused {
            let Some(old) = self.tasks.get(&id).cloned() else {
                continue;
            };
            let fresh_id = self
                .replace_attempt(&old, TaskExecutionStatus::Submitted, old.retry_times)
                .await?;

            match old.sub_workflow_instance_id {
                // The paused child is resumed, not recreated.
                Some(child) => self.resume_sub_workflow(fresh_id, child).await?,
                None => self.dispatch_task(fresh_id).await?,
            }
        }

        self.advance().await
    }

    fn on_workflow_timeout(&self) {
        if self.instance.state.is_terminal() {
            return;
        }
        warn!(
            instance_id = self.instance.id,
            timeout_minutes = self.definition.timeout_minutes,
            state = %self.instance.state,
            "Workflow instance exceeded its timeout"
        );
        self.ctx.bus.publish(SystemEvent::WorkflowTimeout {
            instance_id: self.instance.id,
        });
    }

    // ---- persistence ----

    fn apply_workflow(&self, transition: WorkflowTransition) -> Result<WorkflowExecutionStatus, Halt> {
        self.instance.state.apply(transition).map_err(|err| {
            // The callers only apply transitions they checked; reaching this is a bug.
            error!(instance_id = self.instance.id, error = %err, "Illegal workflow transition");
            Halt::Degraded(err)
        })
    }

    /// Apply a workflow transition, persist it and notify observers.
    async fn transition_workflow(&mut self, transition: WorkflowTransition) -> Step {
        let now = Utc::now();
        let mut next = self.instance.clone();
        next.state = self.apply_workflow(transition)?;
        if next.state == WorkflowExecutionStatus::RunningExecution && next.start_time.is_none() {
            next.start_time = Some(now);
        }
        if next.state.is_terminal() {
            next.end_time = Some(now);
        }
        self.commit_instance(next).await?;
        self.publish_workflow_state();
        Ok(())
    }

    fn publish_workflow_state(&self) {
        self.ctx.bus.publish(SystemEvent::WorkflowStateChanged {
            instance_id: self.instance.id,
            state: self.instance.state,
            parent: self.instance.parent,
        });
    }

    async fn commit_instance(&mut self, next: WorkflowInstance) -> Step {
        let ctx = self.ctx.clone();
        ctx.persist(next.id, "save_instance", || {
            ctx.repository.save_instance(&next, &ctx.node_id)
        })
        .await?;
        self.instance = next;
        Ok(())
    }

    async fn commit_task(&mut self, next: TaskInstance) -> Step {
        let ctx = self.ctx.clone();
        ctx.persist(self.instance.id, "save_task_instance", || {
            ctx.repository.save_task_instance(&next, &ctx.node_id)
        })
        .await?;
        self.tasks.insert(next.id, next);
        Ok(())
    }

    /// Persist a new ACTIVE attempt and make it current for its task code.
    async fn insert_attempt(&mut self, mut attempt: TaskInstance) -> Result<i64, Halt> {
        let ctx = self.ctx.clone();
        let id = ctx
            .persist(self.instance.id, "insert_task_instance", || {
                ctx.repository.insert_task_instance(&attempt, &ctx.node_id)
            })
            .await?;
        attempt.id = id;

        if attempt.state.is_active() {
            self.ctx.registry.route_task(id, self.instance.id);
        }
        self.active.insert(attempt.task_code, id);
        self.publish_task_state(&attempt);
        self.tasks.insert(id, attempt);
        Ok(id)
    }

    // ---- helpers ----

    fn active_attempts(&self) -> impl Iterator<Item = &TaskInstance> + '_ {
        self.active.values().filter_map(|id| self.tasks.get(id))
    }

    /// Ids of ACTIVE attempts in SUBMITTED, DISPATCHED or RUNNING_EXECUTION.
    fn active_attempt_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .active_attempts()
            .filter(|t| t.state.is_active())
            .map(|t| t.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// ACTIVE SUBMITTED attempts with no dispatch in flight.
    fn undispatched_attempts(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .active_attempts()
            .filter(|t| t.state == TaskExecutionStatus::Submitted)
            .map(|t| t.id)
            .filter(|id| !self.dispatching.contains(id))
            .collect();
        ids.sort_unstable();
        ids
    }

    fn has_active_tasks(&self) -> bool {
        self.active_attempts().any(|t| t.state.is_active())
    }

    fn any_active_in(&self, state: TaskExecutionStatus) -> bool {
        self.active_attempts().any(|t| t.state == state)
    }

    /// Post `event` to this engine after `delay`.
    fn schedule(&self, delay: Duration, event: WorkflowEvent) {
        let sender = self.sender.clone();
        let shutdown = self.ctx.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = sender.send(event);
                }
            }
        });
    }
}
