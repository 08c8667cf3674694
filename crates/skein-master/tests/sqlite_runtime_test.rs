// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime tests against the SQLite repository.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use skein_core::dispatcher::MockDispatcher;
use skein_core::model::{
    RunParams, TaskExecutionStatus, TaskFlag, TaskInstance, WorkflowExecutionStatus,
    WorkflowInstance,
};
use skein_core::persistence::{Repository, SqliteRepository};
use skein_master::lease::LeaseConfig;
use skein_master::runtime::MasterRuntime;

async fn sqlite() -> (tempfile::TempDir, Arc<SqliteRepository>) {
    let dir = tempfile::tempdir().unwrap();
    let repo = SqliteRepository::from_path(dir.path().join("skein.db"))
        .await
        .unwrap();
    (dir, Arc::new(repo))
}

async fn start(repo: Arc<SqliteRepository>, dispatcher: Arc<MockDispatcher>) -> MasterRuntime {
    MasterRuntime::builder()
        .repository(repo)
        .dispatcher(dispatcher)
        .node_id(NODE_ID)
        .engine_config(test_engine_config())
        .lease_config(LeaseConfig {
            heartbeat_interval: Duration::from_secs(3600),
            lease_timeout: Duration::from_secs(7200),
        })
        .scheduler_poll_interval(Duration::from_secs(3600))
        .build()
        .unwrap()
        .start()
        .await
        .unwrap()
}

async fn wait_until<F>(repo: &SqliteRepository, id: i64, check: F) -> (WorkflowInstance, Vec<TaskInstance>)
where
    F: Fn(&WorkflowInstance, &[TaskInstance]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let instance = repo.load_instance(id).await.unwrap().unwrap();
        let tasks = repo.list_task_instances(id).await.unwrap();
        if check(&instance, &tasks) {
            return (instance, tasks);
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance {} stuck in {}: {:#?}",
            id,
            instance.state,
            tasks
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_chain_runs_on_sqlite() {
    let (_dir, repo) = sqlite().await;
    repo.save_definition(&chain(1)).await.unwrap();
    let dispatcher = Arc::new(MockDispatcher::new());
    let runtime = start(repo.clone(), dispatcher.clone()).await;

    let id = runtime
        .commands()
        .manual_trigger(1, 1, RunParams::default())
        .await
        .unwrap();
    let (instance, tasks) = wait_until(&repo, id, |instance, _| {
        instance.state == WorkflowExecutionStatus::Success
    })
    .await;

    assert!(instance.end_time.is_some());
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.state == TaskExecutionStatus::Success));
    assert!(tasks.iter().all(|t| t.flag == TaskFlag::Active));
    assert_eq!(dispatcher.dispatched_codes(), vec![10, 20, 30]);

    runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_from_sqlite() {
    let (_dir, repo) = sqlite().await;
    repo.save_definition(&single_task(2)).await.unwrap();

    let first = start(repo.clone(), Arc::new(MockDispatcher::hanging())).await;
    let id = first
        .commands()
        .manual_trigger(2, 1, RunParams::default())
        .await
        .unwrap();
    wait_until(&repo, id, |_, tasks| {
        tasks
            .first()
            .is_some_and(|t| t.state == TaskExecutionStatus::RunningExecution)
    })
    .await;
    first.shutdown().await.unwrap();

    // The worker that ran the attempt is gone; the restarted node reruns it.
    let second = start(repo.clone(), Arc::new(MockDispatcher::new())).await;
    let (_, tasks) = wait_until(&repo, id, |instance, _| {
        instance.state == WorkflowExecutionStatus::Success
    })
    .await;

    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0].state, TaskExecutionStatus::NeedFaultTolerance);
    assert_eq!(tasks[0].flag, TaskFlag::Historical);
    assert_eq!(tasks[1].state, TaskExecutionStatus::Success);
    assert_eq!(tasks[1].first_submit_time, tasks[0].first_submit_time);

    second.shutdown().await.unwrap();
}
