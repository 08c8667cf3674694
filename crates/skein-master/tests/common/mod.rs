// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for skein-master integration tests.
//!
//! Provides TestContext: an in-memory repository, a mock dispatcher and a
//! started MasterRuntime, plus polling helpers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use skein_core::dispatcher::{Dispatcher, MockDispatcher};
use skein_core::model::{
    CommandType, FailureStrategy, TaskDefinition, TaskExecutionStatus, TaskFlag, TaskInstance,
    WorkflowDefinition, WorkflowExecutionStatus, WorkflowInstance,
};
use skein_core::persistence::{InMemoryRepository, Repository};
use skein_master::config::EngineConfig;
use skein_master::lease::LeaseConfig;
use skein_master::runtime::MasterRuntime;

pub const NODE_ID: &str = "master-test";

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Engine settings with short timeouts for tests.
pub fn test_engine_config() -> EngineConfig {
    EngineConfig {
        exec_threads: 8,
        dispatch_timeout: Duration::from_secs(5),
        kill_timeout: Duration::from_millis(300),
        persist_retry_attempts: 3,
        persist_retry_base: Duration::from_millis(1),
    }
}

/// Test context that owns a running master.
pub struct TestContext {
    pub repo: Arc<InMemoryRepository>,
    pub dispatcher: Arc<MockDispatcher>,
    pub runtime: MasterRuntime,
}

impl TestContext {
    /// Master whose tasks all succeed.
    pub async fn new() -> Self {
        Self::with_dispatcher(MockDispatcher::new()).await
    }

    /// Master whose tasks run until completed by the test.
    pub async fn hanging() -> Self {
        Self::with_dispatcher(MockDispatcher::hanging()).await
    }

    pub async fn with_dispatcher(dispatcher: MockDispatcher) -> Self {
        Self::start(Arc::new(InMemoryRepository::new()), Arc::new(dispatcher)).await
    }

    /// Start a master on an existing repository, as a restarted or surviving
    /// node would.
    pub async fn start(repo: Arc<InMemoryRepository>, dispatcher: Arc<MockDispatcher>) -> Self {
        Self::start_with(repo.clone(), repo, dispatcher.clone(), dispatcher).await
    }

    /// Start a master named `node_id` next to others sharing `repo`.
    pub async fn start_as(
        node_id: &str,
        repo: Arc<InMemoryRepository>,
        dispatcher: Arc<MockDispatcher>,
    ) -> Self {
        Self::start_node(node_id, repo.clone(), repo, dispatcher.clone(), dispatcher).await
    }

    /// Start a master whose storage or transport wraps the in-memory
    /// repository or the mock worker fleet.
    pub async fn start_with(
        storage: Arc<dyn Repository>,
        repo: Arc<InMemoryRepository>,
        transport: Arc<dyn Dispatcher>,
        dispatcher: Arc<MockDispatcher>,
    ) -> Self {
        Self::start_node(NODE_ID, storage, repo, transport, dispatcher).await
    }

    async fn start_node(
        node_id: &str,
        storage: Arc<dyn Repository>,
        repo: Arc<InMemoryRepository>,
        transport: Arc<dyn Dispatcher>,
        dispatcher: Arc<MockDispatcher>,
    ) -> Self {
        let runtime = MasterRuntime::builder()
            .repository(storage)
            .dispatcher(transport)
            .node_id(node_id)
            .engine_config(test_engine_config())
            .lease_config(LeaseConfig {
                heartbeat_interval: Duration::from_secs(3600),
                lease_timeout: Duration::from_secs(7200),
            })
            .scheduler_poll_interval(Duration::from_secs(3600))
            .build()
            .expect("runtime config")
            .start()
            .await
            .expect("runtime start");

        Self {
            repo,
            dispatcher,
            runtime,
        }
    }

    pub async fn save(&self, definition: WorkflowDefinition) {
        self.repo.save_definition(&definition).await.unwrap();
    }

    pub async fn instance(&self, id: i64) -> WorkflowInstance {
        self.repo.load_instance(id).await.unwrap().unwrap()
    }

    /// All attempts of an instance, ordered by id.
    pub async fn tasks(&self, id: i64) -> Vec<TaskInstance> {
        self.repo.list_task_instances(id).await.unwrap()
    }

    /// Attempts of one task code, ordered by id.
    pub async fn attempts(&self, id: i64, task_code: i64) -> Vec<TaskInstance> {
        self.tasks(id)
            .await
            .into_iter()
            .filter(|t| t.task_code == task_code)
            .collect()
    }

    /// Wait until the persisted instance reaches `state`.
    pub async fn wait_for_state(&self, id: i64, state: WorkflowExecutionStatus) -> WorkflowInstance {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let instance = self.instance(id).await;
            if instance.state == state {
                return instance;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "instance {} did not reach {} (still {})",
                    id, state, instance.state
                );
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the attempts of an instance satisfy `check`.
    pub async fn wait_for_tasks<F>(&self, id: i64, what: &str, check: F) -> Vec<TaskInstance>
    where
        F: Fn(&[TaskInstance]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let tasks = self.tasks(id).await;
            if check(&tasks) {
                return tasks;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}: {:#?}", what, tasks);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until the mock worker runs `count` tasks; returns their ids.
    pub async fn wait_for_running(&self, count: usize) -> Vec<i64> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let running = self.dispatcher.running();
            if running.len() == count {
                return running;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("expected {} running tasks, got {:?}", count, running);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until no engine is registered for `id`.
    pub async fn wait_for_deregistered(&self, id: i64) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while self.runtime.registry().contains(id) {
            if tokio::time::Instant::now() > deadline {
                panic!("engine of instance {} still registered", id);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Attempts still flagged ACTIVE.
pub fn active(tasks: &[TaskInstance]) -> Vec<&TaskInstance> {
    tasks.iter().filter(|t| t.flag == TaskFlag::Active).collect()
}

pub fn count_in(tasks: &[TaskInstance], state: TaskExecutionStatus) -> usize {
    tasks.iter().filter(|t| t.state == state).count()
}

/// One task, code 10.
pub fn single_task(code: i64) -> WorkflowDefinition {
    WorkflowDefinition::new(code, 1, "single").with_task(TaskDefinition::new(10, "only", "SHELL"))
}

/// `10 -> 20 -> 30`.
pub fn chain(code: i64) -> WorkflowDefinition {
    WorkflowDefinition::new(code, 1, "chain")
        .with_task(TaskDefinition::new(10, "extract", "SHELL"))
        .with_task(TaskDefinition::new(20, "transform", "SHELL"))
        .with_task(TaskDefinition::new(30, "load", "SHELL"))
        .with_relation(10, 20)
        .with_relation(20, 30)
}

/// Three independent branches: `1 -> 4`, `2 -> 5`, `3 -> 6`.
pub fn three_branches(code: i64) -> WorkflowDefinition {
    let mut def = WorkflowDefinition::new(code, 1, "branches");
    for first in 1..=3 {
        def = def
            .with_task(TaskDefinition::new(first, format!("first-{}", first), "SHELL"))
            .with_task(TaskDefinition::new(first + 3, format!("second-{}", first), "SHELL"))
            .with_relation(first, first + 3);
    }
    def
}

/// Three parallel tasks with no edges.
pub fn three_parallel(code: i64, strategy: FailureStrategy) -> WorkflowDefinition {
    WorkflowDefinition::new(code, 1, "parallel")
        .with_task(TaskDefinition::new(1, "a", "SHELL"))
        .with_task(TaskDefinition::new(2, "b", "SHELL"))
        .with_task(TaskDefinition::new(3, "c", "SHELL"))
        .with_failure_strategy(strategy)
}

/// Persist an instance as if a now-dead master had been running it.
pub async fn seed_instance(
    repo: &InMemoryRepository,
    definition: &WorkflowDefinition,
    host: &str,
    state: WorkflowExecutionStatus,
) -> WorkflowInstance {
    let mut instance = WorkflowInstance::submitted(definition, CommandType::Start, host);
    instance.state = state;
    instance.start_time = Some(Utc::now());
    instance.id = repo.insert_instance(&instance).await.unwrap();
    instance
}

/// Persist an ACTIVE attempt of `task` in `state`.
pub async fn seed_task(
    repo: &InMemoryRepository,
    instance: &WorkflowInstance,
    task: &TaskDefinition,
    state: TaskExecutionStatus,
) -> TaskInstance {
    let mut attempt = TaskInstance::first_attempt(task, instance.id, state, Utc::now());
    attempt.host = Some("mock-worker".to_string());
    attempt.id = repo
        .insert_task_instance(&attempt, &instance.host)
        .await
        .unwrap();
    attempt
}
