// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependencies shared by every engine, and engine launching.

use std::future::Future;
use std::sync::Arc;

use skein_core::CoreError;
use skein_core::dag::Dag;
use skein_core::dispatcher::Dispatcher;
use skein_core::model::{CommandType, ParentLink, TaskInstance, WorkflowInstance};
use skein_core::params::initial_var_pool;
use skein_core::persistence::Repository;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ControlCommand, WorkflowEngine, WorkflowEvent};
use crate::config::EngineConfig;
use crate::event::EventBus;
use crate::registry::{RuntimeRegistry, WorkflowHandle};

/// Everything an engine needs besides its own instance state.
pub struct EngineContext {
    pub(crate) repository: Arc<dyn Repository>,
    pub(crate) dispatcher: Arc<dyn Dispatcher>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) registry: Arc<RuntimeRegistry>,
    pub(crate) config: EngineConfig,
    pub(crate) node_id: String,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) shutdown: CancellationToken,
}

impl EngineContext {
    pub fn new(
        repository: Arc<dyn Repository>,
        dispatcher: Arc<dyn Dispatcher>,
        bus: Arc<EventBus>,
        registry: Arc<RuntimeRegistry>,
        config: EngineConfig,
        node_id: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let permits = Arc::new(Semaphore::new(config.exec_threads.max(1)));
        Arc::new(Self {
            repository,
            dispatcher,
            bus,
            registry,
            config,
            node_id: node_id.into(),
            permits,
            shutdown,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Run a repository write, retrying transient failures with exponential
    /// backoff. Non-transient errors are returned at once.
    pub(crate) async fn persist<T, F, Fut>(
        &self,
        instance_id: i64,
        operation: &'static str,
        mut op: F,
    ) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let attempts = self.config.persist_retry_attempts.max(1);
        let mut delay = self.config.persist_retry_base;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    warn!(
                        instance_id,
                        operation,
                        attempt,
                        error = %e,
                        "Persistence write failed, retrying"
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                        delay = delay.saturating_mul(2);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(CoreError::PersistenceExhausted {
            instance_id,
            operation: operation.to_string(),
            attempts,
            last_error,
        })
    }

    /// Build the engine of `instance_id` from persisted state, register it and
    /// hand it the start event.
    ///
    /// Returns `false` when an engine for the instance is already registered.
    pub async fn launch(self: &Arc<Self>, instance_id: i64, repeat_run: bool) -> Result<bool, CoreError> {
        if self.registry.contains(instance_id) {
            return Ok(false);
        }

        let instance = self
            .repository
            .load_instance(instance_id)
            .await?
            .ok_or(CoreError::InstanceNotFound { instance_id })?;
        let definition = self
            .repository
            .load_definition(instance.definition_code, instance.definition_version)
            .await?
            .ok_or(CoreError::DefinitionNotFound {
                code: instance.definition_code,
                version: instance.definition_version,
            })?;
        let dag = Dag::build(&definition, &instance.start_nodes)?;
        let tasks = self.repository.list_task_instances(instance_id).await?;

        let (sender, receiver) = mpsc::unbounded_channel();
        if !self
            .registry
            .register(instance_id, WorkflowHandle::new(sender.clone()))
        {
            debug!(instance_id, "Engine already registered, not launching");
            return Ok(false);
        }

        let engine = WorkflowEngine::new(
            self.clone(),
            Arc::new(definition),
            dag,
            instance,
            tasks,
            sender.clone(),
            receiver,
        );
        // Queued before the loop starts so it is the first event processed.
        let _ = sender.send(WorkflowEvent::Start { repeat_run });
        tokio::spawn(engine.run());

        info!(instance_id, repeat_run, node_id = %self.node_id, "Workflow engine launched");
        Ok(true)
    }

    /// Persist a new SUBMITTED instance and launch its engine.
    pub(crate) async fn submit(self: &Arc<Self>, instance: WorkflowInstance) -> Result<i64, CoreError> {
        let instance_id = self
            .persist(0, "insert_instance", || self.repository.insert_instance(&instance))
            .await?;
        self.launch(instance_id, false).await?;
        Ok(instance_id)
    }

    /// Build the child instance run by a sub-workflow task attempt. The
    /// caller persists it together with the attempt.
    ///
    /// The parent's variable pool is passed down as command parameters.
    pub(crate) async fn prepare_child(
        &self,
        parent: &WorkflowInstance,
        task: &TaskInstance,
        definition_code: i64,
        definition_version: i32,
    ) -> Result<WorkflowInstance, CoreError> {
        let definition = self
            .repository
            .load_definition(definition_code, definition_version)
            .await?
            .ok_or(CoreError::DefinitionNotFound {
                code: definition_code,
                version: definition_version,
            })?;
        Dag::build(&definition, &[])?;

        let mut child = WorkflowInstance::submitted(&definition, CommandType::Start, &self.node_id);
        child.parent = Some(ParentLink {
            workflow_instance_id: parent.id,
            task_instance_id: task.id,
        });
        child.command_params = parent.var_pool.clone();
        child.var_pool = initial_var_pool(&definition, &parent.var_pool);
        child.schedule_time = parent.schedule_time;
        Ok(child)
    }

    /// Send a control command to another engine without waiting for the reply.
    pub(crate) fn signal(&self, instance_id: i64, command: ControlCommand) -> bool {
        let (reply, _) = oneshot::channel();
        let sent = self
            .registry
            .send(instance_id, WorkflowEvent::Control { command, reply });
        if !sent {
            debug!(
                instance_id,
                command = command.as_str(),
                "No local engine to signal"
            );
        }
        sent
    }
}
