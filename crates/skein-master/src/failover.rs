// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failover coordinator.
//!
//! Adopts the live instances of dead masters (and, at startup, this node's
//! own leftovers): claim ownership with a compare-and-set on the host column,
//! reconcile the task attempts the dead node left behind, then rebuild and
//! register the engine from persisted state.
//!
//! Attempt reconciliation:
//!
//! | persisted attempt                  | outcome                                   |
//! |------------------------------------|-------------------------------------------|
//! | SUBMITTED                          | NEED_FAULT_TOLERANCE + fresh attempt      |
//! | DISPATCHED / RUNNING, worker alive | adopted as is                             |
//! | DISPATCHED / RUNNING, no worker    | NEED_FAULT_TOLERANCE + fresh attempt      |
//! | sub-workflow, child live           | adopted (the child is recovered itself)   |
//! | sub-workflow, child finished       | settled from the child's final state      |
//!
//! Fresh attempts start SUBMITTED, or directly KILL / PAUSE when the workflow
//! was READY_STOP / READY_PAUSE.
//!
//! Once a batch of instances is running again, parents and children are
//! synchronized: a child that finished or paused unobserved is reported to
//! its parent, and a pending pause or stop of the parent is re-sent to its
//! children. Parents are adopted before their children, so this runs after
//! the whole batch.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashSet;
use skein_core::CoreError;
use skein_core::model::{
    CommandType, TaskExecutionStatus, TaskFlag, TaskInstance, TaskTransition,
    WorkflowExecutionStatus, WorkflowInstance,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::{ControlCommand, EngineContext, WorkflowEvent};
use crate::error::Result;
use crate::event::SystemEvent;

/// Re-adopts orphaned workflow instances.
pub struct FailoverCoordinator {
    ctx: Arc<EngineContext>,
    /// Instances being adopted right now.
    adopting: DashSet<i64>,
}

/// Releases an `adopting` entry when dropped.
struct AdoptionGuard<'a> {
    adopting: &'a DashSet<i64>,
    instance_id: i64,
}

impl Drop for AdoptionGuard<'_> {
    fn drop(&mut self) {
        self.adopting.remove(&self.instance_id);
    }
}

impl FailoverCoordinator {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            adopting: DashSet::new(),
        }
    }

    /// Adopt every live instance owned by one of `dead_hosts`.
    ///
    /// Returns the ids of the instances this node took over.
    #[instrument(skip(self))]
    pub async fn failover_dead_hosts(&self, dead_hosts: &[String]) -> Result<Vec<i64>> {
        let mut adopted = Vec::new();
        for host in dead_hosts {
            if host == self.ctx.node_id() {
                continue;
            }
            let instances = self.ctx.repository().list_instances_by_host(host).await?;
            let (taken, failed) = self.adopt_all(instances).await;
            adopted.extend(taken);

            // The lease stays until every instance is handled, so the next
            // heartbeat round retries.
            if failed == 0 {
                self.ctx.repository().remove_node_lease(host).await?;
            } else {
                warn!(host = %host, failed, "Failover incomplete, lease kept");
            }
        }

        info!(
            dead_hosts = dead_hosts.len(),
            adopted = adopted.len(),
            "Master failover finished"
        );
        Ok(adopted)
    }

    /// Adopt this node's own live instances left over from a previous run.
    #[instrument(skip(self))]
    pub async fn on_startup(&self) -> Result<Vec<i64>> {
        let instances = self
            .ctx
            .repository()
            .list_instances_by_host(self.ctx.node_id())
            .await?;
        let (adopted, _) = self.adopt_all(instances).await;
        if !adopted.is_empty() {
            info!(adopted = adopted.len(), "Resumed instances from a previous run");
        }
        Ok(adopted)
    }

    /// Re-adopt one instance owned by this node that has no engine, such as
    /// an instance whose engine degraded.
    ///
    /// Returns `false` when there was nothing to do.
    #[instrument(skip(self))]
    pub async fn recover_instance(&self, instance_id: i64) -> Result<bool> {
        let instance = self
            .ctx
            .repository()
            .load_instance(instance_id)
            .await?
            .ok_or(CoreError::InstanceNotFound { instance_id })?;
        if instance.host != self.ctx.node_id() {
            return Err(CoreError::NotLocallyOwned {
                instance_id,
                owner: instance.host,
            }
            .into());
        }
        let adopted = self.adopt(instance).await?;
        if adopted {
            self.sync_children(instance_id).await?;
        }
        Ok(adopted)
    }

    /// Serve failover requests published on the bus until shutdown.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<SystemEvent>,
        shutdown: CancellationToken,
    ) {
        info!("Failover coordinator started");
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                event = events.recv() => match event {
                    Ok(SystemEvent::GlobalMasterFailover { dead_hosts }) => {
                        if let Err(e) = self.failover_dead_hosts(&dead_hosts).await {
                            error!(error = %e, "Master failover failed");
                        }
                    }
                    Ok(SystemEvent::LeaseRestored { node_id }) if node_id == self.ctx.node_id() => {
                        if let Err(e) = self.on_startup().await {
                            error!(error = %e, "Resuming instances after lease renewal failed");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Failover coordinator lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("Failover coordinator stopped");
    }

    /// Adopt each live instance; returns the adopted ids and the failure count.
    async fn adopt_all(&self, instances: Vec<WorkflowInstance>) -> (Vec<i64>, usize) {
        let mut adopted = Vec::new();
        let mut failed = 0;
        for instance in instances {
            if instance.state.is_terminal() {
                continue;
            }
            let instance_id = instance.id;
            match self.adopt(instance).await {
                Ok(true) => adopted.push(instance_id),
                Ok(false) => {}
                Err(e) => {
                    failed += 1;
                    error!(instance_id, error = %e, "Failed to adopt workflow instance");
                }
            }
        }

        for &instance_id in &adopted {
            if let Err(e) = self.sync_children(instance_id).await {
                failed += 1;
                error!(instance_id, error = %e, "Failed to synchronize sub-workflows");
            }
        }
        (adopted, failed)
    }

    /// Claim, reconcile and relaunch one instance. Idempotent.
    async fn adopt(&self, instance: WorkflowInstance) -> Result<bool> {
        let instance_id = instance.id;
        if !self.adopting.insert(instance_id) {
            debug!(instance_id, "Instance adoption already in progress");
            return Ok(false);
        }
        let _guard = AdoptionGuard {
            adopting: &self.adopting,
            instance_id,
        };

        // Re-read under the guard; the caller's copy may predate another adoption.
        let Some(mut instance) = self.ctx.repository().load_instance(instance_id).await? else {
            return Ok(false);
        };
        if instance.state.is_terminal() || self.ctx.registry().contains(instance_id) {
            debug!(instance_id, "Instance needs no failover");
            return Ok(false);
        }

        let node_id = self.ctx.node_id().to_string();
        if instance.host != node_id {
            let claimed = self
                .ctx
                .repository()
                .claim_instance(instance_id, &instance.host, &node_id)
                .await?;
            if !claimed {
                debug!(instance_id, "Instance already claimed by another node");
                return Ok(false);
            }
            info!(
                instance_id,
                previous_host = %instance.host,
                state = %instance.state,
                "Claimed workflow instance"
            );
            instance.host = node_id;
            instance.command_type = CommandType::Failover;
            let ctx = self.ctx.clone();
            ctx.persist(instance_id, "save_instance", || {
                ctx.repository().save_instance(&instance, ctx.node_id())
            })
            .await?;
        }

        self.reconcile_tasks(&instance).await?;
        Ok(self.ctx.launch(instance_id, false).await?)
    }

    /// Bring the children of an adopted instance in line with it.
    async fn sync_children(&self, instance_id: i64) -> Result<()> {
        let repository = self.ctx.repository();
        let Some(parent) = repository.load_instance(instance_id).await? else {
            return Ok(());
        };
        let stopping = parent.state.is_terminal() || parent.state == WorkflowExecutionStatus::ReadyStop;

        for attempt in repository.list_task_instances(instance_id).await? {
            if attempt.flag != TaskFlag::Active {
                continue;
            }
            let Some(child_id) = attempt.sub_workflow_instance_id else {
                continue;
            };
            let Some(child) = repository.load_instance(child_id).await? else {
                continue;
            };
            let waiting = matches!(
                attempt.state,
                TaskExecutionStatus::Dispatched | TaskExecutionStatus::RunningExecution
            );

            let report = waiting
                && (child.state.is_terminal()
                    || (child.state == WorkflowExecutionStatus::Pause
                        && parent.state == WorkflowExecutionStatus::ReadyPause));
            if report {
                debug!(
                    instance_id,
                    child_instance_id = child_id,
                    child_state = %child.state,
                    "Reporting sub-workflow state to adopted parent"
                );
                self.ctx.bus().post(
                    instance_id,
                    WorkflowEvent::SubWorkflowStateChanged {
                        child_instance_id: child_id,
                        task_instance_id: attempt.id,
                        state: child.state,
                    },
                );
                continue;
            }
            if child.state.is_terminal() {
                continue;
            }

            let command = if stopping {
                Some(ControlCommand::Stop)
            } else if waiting
                && parent.state == WorkflowExecutionStatus::ReadyPause
                && matches!(
                    child.state,
                    WorkflowExecutionStatus::Submitted | WorkflowExecutionStatus::RunningExecution
                )
            {
                Some(ControlCommand::Pause)
            } else {
                None
            };
            if let Some(command) = command {
                info!(
                    instance_id,
                    child_instance_id = child_id,
                    command = command.as_str(),
                    "Re-sending pending command to sub-workflow"
                );
                self.ctx.signal(child_id, command);
            }
        }
        Ok(())
    }

    async fn reconcile_tasks(&self, instance: &WorkflowInstance) -> Result<()> {
        let attempts = self
            .ctx
            .repository()
            .list_task_instances(instance.id)
            .await?;

        for attempt in attempts {
            if attempt.flag != TaskFlag::Active || !attempt.state.is_active() {
                continue;
            }
            let dispatched = matches!(
                attempt.state,
                TaskExecutionStatus::Dispatched | TaskExecutionStatus::RunningExecution
            );

            if dispatched && let Some(child_id) = attempt.sub_workflow_instance_id {
                if self.ctx.repository().load_instance(child_id).await?.is_some() {
                    debug!(
                        instance_id = instance.id,
                        task_instance_id = attempt.id,
                        child_instance_id = child_id,
                        "Sub-workflow attempt adopted"
                    );
                    continue;
                }
                // Child record lost: run the task again.
            } else if dispatched && self.ctx.dispatcher.is_alive(&attempt).await {
                info!(
                    instance_id = instance.id,
                    task_instance_id = attempt.id,
                    "Running task adopted"
                );
                continue;
            }

            self.replace_attempt(instance, attempt).await?;
        }
        Ok(())
    }

    /// Mark `attempt` NEED_FAULT_TOLERANCE and queue its successor.
    async fn replace_attempt(&self, instance: &WorkflowInstance, attempt: TaskInstance) -> Result<()> {
        let now = Utc::now();
        let mut retired = attempt.clone();
        retired.state = attempt.state.apply(TaskTransition::FaultTolerance)?;
        retired.flag = TaskFlag::Historical;
        retired.end_time = Some(now);

        let state = match instance.state {
            WorkflowExecutionStatus::ReadyStop => TaskExecutionStatus::Kill,
            WorkflowExecutionStatus::ReadyPause => TaskExecutionStatus::Pause,
            _ => TaskExecutionStatus::Submitted,
        };
        let mut fresh = attempt.next_attempt(state, attempt.retry_times, now);
        if state.is_finished() {
            fresh.end_time = Some(now);
        }

        let ctx = self.ctx.clone();
        ctx.persist(instance.id, "save_task_instance", || {
            ctx.repository().save_task_instance(&retired, ctx.node_id())
        })
        .await?;
        let fresh_id = ctx
            .persist(instance.id, "insert_task_instance", || {
                ctx.repository().insert_task_instance(&fresh, ctx.node_id())
            })
            .await?;

        info!(
            instance_id = instance.id,
            task_code = attempt.task_code,
            task_instance_id = attempt.id,
            fresh_task_instance_id = fresh_id,
            fresh_state = %state,
            "Task attempt needs fault tolerance"
        );
        Ok(())
    }
}
