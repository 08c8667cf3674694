// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory repository.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Repository;
use crate::error::CoreError;
use crate::model::{NodeLease, Schedule, TaskInstance, WorkflowDefinition, WorkflowInstance};

#[derive(Default)]
struct State {
    definitions: HashMap<(i64, i32), WorkflowDefinition>,
    instances: BTreeMap<i64, WorkflowInstance>,
    task_instances: BTreeMap<i64, TaskInstance>,
    schedules: BTreeMap<i64, Schedule>,
    leases: BTreeMap<String, NodeLease>,
    next_instance_id: i64,
    next_task_instance_id: i64,
}

impl State {
    fn check_owner(&self, instance_id: i64, owner: &str) -> Result<(), CoreError> {
        match self.instances.get(&instance_id) {
            Some(instance) if instance.host == owner => Ok(()),
            Some(instance) => Err(CoreError::NotLocallyOwned {
                instance_id,
                owner: instance.host.clone(),
            }),
            None => Err(CoreError::InstanceNotFound { instance_id }),
        }
    }

    fn insert_instance(&mut self, instance: &WorkflowInstance) -> i64 {
        self.next_instance_id += 1;
        let id = self.next_instance_id;
        let mut stored = instance.clone();
        stored.id = id;
        self.instances.insert(id, stored);
        id
    }

    fn save_task_instance(&mut self, task: &TaskInstance, owner: &str) -> Result<(), CoreError> {
        let Some(workflow_instance_id) = self
            .task_instances
            .get(&task.id)
            .map(|stored| stored.workflow_instance_id)
        else {
            return Err(CoreError::TaskInstanceNotFound {
                task_instance_id: task.id,
            });
        };
        self.check_owner(workflow_instance_id, owner)?;
        self.task_instances.insert(task.id, task.clone());
        Ok(())
    }
}

/// Repository kept entirely in process memory.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>, CoreError> {
        self.state.lock().map_err(|e| CoreError::DatabaseError {
            operation: "lock".to_string(),
            details: e.to_string(),
        })
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn load_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<Option<WorkflowDefinition>, CoreError> {
        Ok(self.state()?.definitions.get(&(code, version)).cloned())
    }

    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), CoreError> {
        self.state()?
            .definitions
            .insert((definition.code, definition.version), definition.clone());
        Ok(())
    }

    async fn insert_instance(&self, instance: &WorkflowInstance) -> Result<i64, CoreError> {
        Ok(self.state()?.insert_instance(instance))
    }

    async fn save_instance(&self, instance: &WorkflowInstance, owner: &str) -> Result<(), CoreError> {
        let mut state = self.state()?;
        state.check_owner(instance.id, owner)?;
        state.instances.insert(instance.id, instance.clone());
        Ok(())
    }

    async fn load_instance(&self, id: i64) -> Result<Option<WorkflowInstance>, CoreError> {
        Ok(self.state()?.instances.get(&id).cloned())
    }

    async fn list_instances_by_host(&self, host: &str) -> Result<Vec<WorkflowInstance>, CoreError> {
        Ok(self
            .state()?
            .instances
            .values()
            .filter(|i| i.host == host)
            .cloned()
            .collect())
    }

    async fn claim_instance(
        &self,
        id: i64,
        expected_host: &str,
        new_host: &str,
    ) -> Result<bool, CoreError> {
        let mut state = self.state()?;
        match state.instances.get_mut(&id) {
            Some(instance) if instance.host == expected_host => {
                instance.host = new_host.to_string();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(CoreError::InstanceNotFound { instance_id: id }),
        }
    }

    async fn insert_task_instance(&self, task: &TaskInstance, owner: &str) -> Result<i64, CoreError> {
        let mut state = self.state()?;
        state.check_owner(task.workflow_instance_id, owner)?;
        state.next_task_instance_id += 1;
        let id = state.next_task_instance_id;
        let mut stored = task.clone();
        stored.id = id;
        state.task_instances.insert(id, stored);
        Ok(id)
    }

    async fn save_task_instance(&self, task: &TaskInstance, owner: &str) -> Result<(), CoreError> {
        self.state()?.save_task_instance(task, owner)
    }

    async fn insert_sub_workflow(
        &self,
        child: &WorkflowInstance,
        parent_task: &TaskInstance,
        owner: &str,
    ) -> Result<i64, CoreError> {
        let mut state = self.state()?;
        state.check_owner(parent_task.workflow_instance_id, owner)?;
        if !state.task_instances.contains_key(&parent_task.id) {
            return Err(CoreError::TaskInstanceNotFound {
                task_instance_id: parent_task.id,
            });
        }

        let child_id = state.insert_instance(child);
        let mut linked = parent_task.clone();
        linked.sub_workflow_instance_id = Some(child_id);
        state.task_instances.insert(linked.id, linked);
        Ok(child_id)
    }

    async fn load_task_instance(&self, id: i64) -> Result<Option<TaskInstance>, CoreError> {
        Ok(self.state()?.task_instances.get(&id).cloned())
    }

    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, CoreError> {
        Ok(self
            .state()?
            .task_instances
            .values()
            .filter(|t| t.workflow_instance_id == workflow_instance_id)
            .cloned()
            .collect())
    }

    async fn save_schedule(&self, schedule: &Schedule) -> Result<(), CoreError> {
        self.state()?
            .schedules
            .insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn load_schedule(&self, id: i64) -> Result<Option<Schedule>, CoreError> {
        Ok(self.state()?.schedules.get(&id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<Schedule>, CoreError> {
        Ok(self.state()?.schedules.values().cloned().collect())
    }

    async fn heartbeat_node(&self, node_id: &str, now: DateTime<Utc>) -> Result<(), CoreError> {
        self.state()?
            .leases
            .entry(node_id.to_string())
            .and_modify(|lease| lease.last_heartbeat = now)
            .or_insert_with(|| NodeLease {
                node_id: node_id.to_string(),
                started_at: now,
                last_heartbeat: now,
            });
        Ok(())
    }

    async fn list_node_leases(&self) -> Result<Vec<NodeLease>, CoreError> {
        Ok(self.state()?.leases.values().cloned().collect())
    }

    async fn remove_node_lease(&self, node_id: &str) -> Result<(), CoreError> {
        self.state()?.leases.remove(node_id);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}
