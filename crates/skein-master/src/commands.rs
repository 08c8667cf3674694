// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command and trigger layer.
//!
//! Triggers (manual, schedule, backfill) create SUBMITTED instances and launch
//! their engines. Control commands (pause, stop, recover) are delivered to the
//! live engine and acknowledged once the engine accepted them; completion is
//! observed through [`SystemEvent`](crate::event::SystemEvent)s.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use skein_core::CoreError;
use skein_core::dag::Dag;
use skein_core::model::{
    BackfillParams, Command, CommandType, RunParams, WorkflowDefinition, WorkflowInstance,
};
use skein_core::params::initial_var_pool;
use tokio::sync::oneshot;
use tracing::{debug, info, instrument};

use crate::engine::{ControlCommand, EngineContext, WorkflowEvent};
use crate::error::{Error, Result};

/// How a command was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The command was accepted and is being carried out.
    Accepted,
    /// The instance had already finished; nothing was done.
    AlreadyTerminal,
}

/// Acknowledgement of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandAck {
    /// Instances created or affected.
    pub instance_ids: Vec<i64>,
    pub outcome: AckOutcome,
}

impl CommandAck {
    fn accepted(instance_ids: Vec<i64>) -> Self {
        Self {
            instance_ids,
            outcome: AckOutcome::Accepted,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome == AckOutcome::Accepted
    }
}

/// Entry point for triggers and control commands.
#[derive(Clone)]
pub struct CommandService {
    ctx: Arc<EngineContext>,
}

impl CommandService {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self { ctx }
    }

    /// Route a command record to the matching operation.
    pub async fn handle(&self, command: Command) -> Result<CommandAck> {
        match command {
            Command::Start {
                definition_code,
                definition_version,
                run,
            } => {
                let id = self
                    .manual_trigger(definition_code, definition_version, run)
                    .await?;
                Ok(CommandAck::accepted(vec![id]))
            }
            Command::Schedule {
                schedule_id,
                fire_time,
            } => {
                let id = self.schedule_trigger(schedule_id, fire_time).await?;
                Ok(CommandAck::accepted(vec![id]))
            }
            Command::Backfill {
                definition_code,
                definition_version,
                params,
            } => {
                let ids = self
                    .backfill_trigger(definition_code, definition_version, params)
                    .await?;
                Ok(CommandAck::accepted(ids))
            }
            Command::RepeatRun { instance_id } => self.repeat_run(instance_id).await,
            Command::Pause { instance_id } => self.pause(instance_id).await,
            Command::Stop { instance_id } => self.stop(instance_id).await,
            Command::RecoverSuspended { instance_id } => self.recover_suspended(instance_id).await,
        }
    }

    // ---- triggers ----

    /// Start one run of a definition.
    #[instrument(skip(self, run))]
    pub async fn manual_trigger(
        &self,
        definition_code: i64,
        definition_version: i32,
        run: RunParams,
    ) -> Result<i64> {
        self.ensure_running()?;
        let definition = self
            .load_definition(definition_code, definition_version)
            .await?;
        let instance = self.build_instance(&definition, CommandType::Start, run, None)?;
        let instance_id = self.ctx.submit(instance).await?;

        info!(instance_id, "Workflow instance triggered");
        Ok(instance_id)
    }

    /// Fire a schedule for `fire_time`.
    #[instrument(skip(self))]
    pub async fn schedule_trigger(&self, schedule_id: i64, fire_time: DateTime<Utc>) -> Result<i64> {
        self.ensure_running()?;
        let schedule = self
            .ctx
            .repository()
            .load_schedule(schedule_id)
            .await?
            .ok_or_else(|| CoreError::ValidationError {
                field: "schedule_id".to_string(),
                message: format!("schedule {} not found", schedule_id),
            })?;
        let definition = self
            .load_definition(schedule.definition_code, schedule.definition_version)
            .await?;
        let run = RunParams {
            params: schedule.params,
            start_nodes: Vec::new(),
        };
        let instance =
            self.build_instance(&definition, CommandType::Schedule, run, Some(fire_time))?;
        let instance_id = self.ctx.submit(instance).await?;

        info!(instance_id, %fire_time, "Scheduled workflow instance triggered");
        Ok(instance_id)
    }

    /// One instance per schedule time, created in ascending time order.
    #[instrument(skip(self, params))]
    pub async fn backfill_trigger(
        &self,
        definition_code: i64,
        definition_version: i32,
        params: BackfillParams,
    ) -> Result<Vec<i64>> {
        self.ensure_running()?;
        let definition = self
            .load_definition(definition_code, definition_version)
            .await?;
        let times = params.schedule_times()?;
        if times.is_empty() {
            return Err(CoreError::ValidationError {
                field: "times".to_string(),
                message: "backfill covers no schedule time".to_string(),
            }
            .into());
        }
        // Reject a bad DAG before the first instance exists.
        Dag::build(&definition, &params.run.start_nodes)?;

        let mut instance_ids = Vec::with_capacity(times.len());
        for time in times {
            let instance = self.build_instance(
                &definition,
                CommandType::Backfill,
                params.run.clone(),
                Some(time),
            )?;
            instance_ids.push(self.ctx.submit(instance).await?);
        }

        info!(count = instance_ids.len(), "Backfill triggered");
        Ok(instance_ids)
    }

    /// Run a finished instance again from the start.
    #[instrument(skip(self))]
    pub async fn repeat_run(&self, instance_id: i64) -> Result<CommandAck> {
        self.ensure_running()?;
        let instance = self.load_instance(instance_id).await?;
        if !instance.state.is_terminal() || self.ctx.registry().contains(instance_id) {
            return Err(CoreError::InvalidInstanceState {
                instance_id,
                expected: "SUCCESS, FAILURE or STOP".to_string(),
                actual: instance.state.to_string(),
            }
            .into());
        }

        let node_id = self.ctx.node_id();
        if instance.host != node_id
            && !self
                .ctx
                .repository()
                .claim_instance(instance_id, &instance.host, node_id)
                .await?
        {
            return Err(CoreError::NotLocallyOwned {
                instance_id,
                owner: instance.host,
            }
            .into());
        }

        if !self.ctx.launch(instance_id, true).await? {
            return Err(CoreError::InvalidInstanceState {
                instance_id,
                expected: "no running engine".to_string(),
                actual: "engine registered".to_string(),
            }
            .into());
        }
        info!(instance_id, "Repeat run accepted");
        Ok(CommandAck::accepted(vec![instance_id]))
    }

    // ---- control ----

    #[instrument(skip(self))]
    pub async fn pause(&self, instance_id: i64) -> Result<CommandAck> {
        self.control(instance_id, ControlCommand::Pause).await
    }

    #[instrument(skip(self))]
    pub async fn stop(&self, instance_id: i64) -> Result<CommandAck> {
        self.control(instance_id, ControlCommand::Stop).await
    }

    #[instrument(skip(self))]
    pub async fn recover_suspended(&self, instance_id: i64) -> Result<CommandAck> {
        self.control(instance_id, ControlCommand::Recover).await
    }

    async fn control(&self, instance_id: i64, command: ControlCommand) -> Result<CommandAck> {
        let (reply, accepted) = oneshot::channel();
        if self
            .ctx
            .registry()
            .send(instance_id, WorkflowEvent::Control { command, reply })
        {
            match accepted.await {
                Ok(Ok(())) => {
                    info!(instance_id, command = command.as_str(), "Control command accepted");
                    return Ok(CommandAck::accepted(vec![instance_id]));
                }
                Ok(Err(err)) => return Err(err.into()),
                // The engine exited with the command still queued.
                Err(_) => debug!(instance_id, "Engine stopped before answering"),
            }
        }
        self.without_engine(instance_id).await
    }

    /// Answer a control command for an instance with no local engine.
    async fn without_engine(&self, instance_id: i64) -> Result<CommandAck> {
        let instance = self.load_instance(instance_id).await?;
        if instance.state.is_terminal() {
            return Ok(CommandAck {
                instance_ids: vec![instance_id],
                outcome: AckOutcome::AlreadyTerminal,
            });
        }
        if instance.host == self.ctx.node_id() {
            return Err(CoreError::EngineUnavailable { instance_id }.into());
        }
        Err(CoreError::NotLocallyOwned {
            instance_id,
            owner: instance.host,
        }
        .into())
    }

    // ---- helpers ----

    fn ensure_running(&self) -> Result<()> {
        if self.ctx.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    async fn load_definition(&self, code: i64, version: i32) -> Result<WorkflowDefinition> {
        Ok(self
            .ctx
            .repository()
            .load_definition(code, version)
            .await?
            .ok_or(CoreError::DefinitionNotFound { code, version })?)
    }

    async fn load_instance(&self, instance_id: i64) -> Result<WorkflowInstance> {
        Ok(self
            .ctx
            .repository()
            .load_instance(instance_id)
            .await?
            .ok_or(CoreError::InstanceNotFound { instance_id })?)
    }

    fn build_instance(
        &self,
        definition: &WorkflowDefinition,
        command_type: CommandType,
        run: RunParams,
        schedule_time: Option<DateTime<Utc>>,
    ) -> Result<WorkflowInstance> {
        Dag::build(definition, &run.start_nodes)?;

        let mut instance = WorkflowInstance::submitted(definition, command_type, self.ctx.node_id());
        instance.var_pool = initial_var_pool(definition, &run.params);
        instance.command_params = run.params;
        instance.start_nodes = run.start_nodes;
        instance.schedule_time = schedule_time;
        Ok(instance)
    }
}
