// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tests for failure strategies, retries, timeouts and parameter passing.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use serde_json::json;
use skein_core::dispatcher::{
    DispatchAck, DispatchError, Dispatcher, MockDispatcher, MockOutcome, TaskDispatchRequest,
    TaskStateSender,
};
use skein_core::model::{
    FailureStrategy, RunParams, TaskDefinition, TaskExecutionStatus, TaskFlag, TaskInstance,
    TimeoutStrategy, VarPool, WorkflowDefinition, WorkflowExecutionStatus,
};
use skein_core::persistence::InMemoryRepository;
use skein_master::SystemEvent;

/// Worker transport whose cancel requests never reach a worker.
struct SilentCancel {
    inner: Arc<MockDispatcher>,
    cancels: Mutex<Vec<i64>>,
}

#[async_trait]
impl Dispatcher for SilentCancel {
    fn dispatcher_type(&self) -> &'static str {
        "silent-cancel"
    }

    fn set_callback_sink(&self, sink: TaskStateSender) {
        self.inner.set_callback_sink(sink);
    }

    async fn dispatch(&self, request: &TaskDispatchRequest) -> Result<DispatchAck, DispatchError> {
        self.inner.dispatch(request).await
    }

    async fn cancel(&self, task_instance_id: i64) -> Result<(), DispatchError> {
        self.cancels.lock().unwrap().push(task_instance_id);
        Ok(())
    }

    async fn is_alive(&self, task: &TaskInstance) -> bool {
        self.inner.is_alive(task).await
    }
}

/// Worker transport that acknowledges dispatches of one task code late.
/// The worker starts the task immediately.
struct SlowAck {
    inner: Arc<MockDispatcher>,
    task_code: i64,
    delay: Duration,
}

#[async_trait]
impl Dispatcher for SlowAck {
    fn dispatcher_type(&self) -> &'static str {
        "slow-ack"
    }

    fn set_callback_sink(&self, sink: TaskStateSender) {
        self.inner.set_callback_sink(sink);
    }

    async fn dispatch(&self, request: &TaskDispatchRequest) -> Result<DispatchAck, DispatchError> {
        let ack = self.inner.dispatch(request).await;
        if request.task_code == self.task_code {
            tokio::time::sleep(self.delay).await;
        }
        ack
    }

    async fn cancel(&self, task_instance_id: i64) -> Result<(), DispatchError> {
        self.inner.cancel(task_instance_id).await
    }

    async fn is_alive(&self, task: &TaskInstance) -> bool {
        self.inner.is_alive(task).await
    }
}

async fn start_slow_ack(task_code: i64, delay: Duration) -> TestContext {
    let mock = Arc::new(MockDispatcher::hanging());
    let transport = Arc::new(SlowAck {
        inner: mock.clone(),
        task_code,
        delay,
    });
    let repo = Arc::new(InMemoryRepository::new());
    TestContext::start_with(repo.clone(), repo, transport, mock).await
}

#[tokio::test]
async fn test_rejected_dispatch_is_retried() {
    let ctx = TestContext::new().await;
    ctx.save(
        WorkflowDefinition::new(1, 1, "rejected")
            .with_task(TaskDefinition::new(10, "picky", "SHELL").with_retries(1, 0)),
    )
    .await;
    ctx.dispatcher.script(10, [MockOutcome::Reject]);

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(1, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Success).await;

    let attempts = ctx.attempts(id, 10).await;
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].state, TaskExecutionStatus::Failure);
    assert!(attempts[0].host.is_none());
    assert_eq!(attempts[1].state, TaskExecutionStatus::Success);
}

#[tokio::test]
async fn test_retry_waits_for_interval() {
    let ctx = TestContext::new().await;
    ctx.save(
        WorkflowDefinition::new(2, 1, "spaced")
            .with_task(TaskDefinition::new(10, "flaky", "SHELL").with_retries(1, 1)),
    )
    .await;
    ctx.dispatcher.script(10, [MockOutcome::Fail]);

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(2, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Success).await;

    let attempts = ctx.attempts(id, 10).await;
    assert_eq!(attempts.len(), 2);
    let failed_at = attempts[0].end_time.unwrap();
    let retried_at = attempts[1].start_time.unwrap();
    assert!(retried_at - failed_at >= chrono::Duration::milliseconds(900));
}

#[tokio::test]
async fn test_end_strategy_kills_siblings() {
    let ctx = TestContext::hanging().await;
    ctx.save(three_parallel(3, FailureStrategy::End)).await;
    ctx.dispatcher.script(1, [MockOutcome::Fail]);

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(3, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Failure).await;

    let tasks = ctx.tasks(id).await;
    assert_eq!(tasks.len(), 3);
    let state_of = |code: i64| tasks.iter().find(|t| t.task_code == code).unwrap().state;
    assert_eq!(state_of(1), TaskExecutionStatus::Failure);
    assert_eq!(state_of(2), TaskExecutionStatus::Kill);
    assert_eq!(state_of(3), TaskExecutionStatus::Kill);
    ctx.wait_for_deregistered(id).await;
}

#[tokio::test]
async fn test_end_strategy_cancels_siblings_still_dispatching() {
    let ctx = start_slow_ack(2, Duration::from_millis(500)).await;
    ctx.save(three_parallel(10, FailureStrategy::End)).await;
    ctx.dispatcher.script(1, [MockOutcome::Reject]);

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(10, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Failure).await;

    // Nothing keeps running on the worker once the acks land.
    ctx.wait_for_running(0).await;
    let tasks = ctx.tasks(id).await;
    let id_of = |code: i64| tasks.iter().find(|t| t.task_code == code).unwrap().id;
    let mut cancelled = ctx.dispatcher.cancelled();
    cancelled.sort_unstable();
    cancelled.dedup();
    assert_eq!(cancelled, vec![id_of(2), id_of(3)]);
    assert_eq!(count_in(&tasks, TaskExecutionStatus::Kill), 2);
    ctx.wait_for_deregistered(id).await;
}

#[tokio::test]
async fn test_stop_cancels_task_acknowledged_after_kill_timeout() {
    let ctx = start_slow_ack(10, Duration::from_millis(600)).await;
    ctx.save(single_task(11)).await;

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(11, 1, RunParams::default())
        .await
        .unwrap();
    let task_id = ctx.wait_for_running(1).await[0];

    ctx.runtime.commands().stop(id).await.unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Stop).await;

    ctx.wait_for_running(0).await;
    assert!(ctx.dispatcher.cancelled().contains(&task_id));
    let tasks = ctx.tasks(id).await;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskExecutionStatus::Kill);
    ctx.wait_for_deregistered(id).await;
}

#[tokio::test]
async fn test_continue_strategy_runs_remaining_tasks() {
    let ctx = TestContext::new().await;
    ctx.save(
        WorkflowDefinition::new(4, 1, "continue")
            .with_task(TaskDefinition::new(1, "fails", "SHELL"))
            .with_task(TaskDefinition::new(2, "after-failure", "SHELL"))
            .with_task(TaskDefinition::new(3, "independent", "SHELL"))
            .with_task(TaskDefinition::new(4, "after-independent", "SHELL"))
            .with_relation(1, 2)
            .with_relation(3, 4),
    )
    .await;
    ctx.dispatcher.script(1, [MockOutcome::Fail]);

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(4, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Failure).await;

    let tasks = ctx.tasks(id).await;
    assert_eq!(tasks.len(), 4);
    assert_eq!(count_in(&tasks, TaskExecutionStatus::Failure), 1);
    assert_eq!(count_in(&tasks, TaskExecutionStatus::Success), 3);
    let mut codes = ctx.dispatcher.dispatched_codes();
    codes.sort_unstable();
    assert_eq!(codes, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_failing_timeout_fails_task() {
    let ctx = TestContext::hanging().await;
    ctx.save(
        WorkflowDefinition::new(5, 1, "slow").with_task(
            TaskDefinition::new(10, "slow", "SHELL").with_timeout(TimeoutStrategy::Failed, 1),
        ),
    )
    .await;
    let mut events = ctx.runtime.bus().subscribe();

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(5, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Failure).await;

    let attempts = ctx.attempts(id, 10).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, TaskExecutionStatus::Failure);
    assert_eq!(ctx.dispatcher.cancelled(), vec![attempts[0].id]);

    while let Ok(event) = events.try_recv() {
        assert!(
            !matches!(event, SystemEvent::TaskTimeout { .. }),
            "FAILED strategy does not warn"
        );
    }
}

#[tokio::test]
async fn test_warning_timeout_keeps_task_running() {
    let ctx = TestContext::hanging().await;
    ctx.save(
        WorkflowDefinition::new(6, 1, "slow").with_task(
            TaskDefinition::new(10, "slow", "SHELL").with_timeout(TimeoutStrategy::Warn, 1),
        ),
    )
    .await;
    let mut events = ctx.runtime.bus().subscribe();

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(6, 1, RunParams::default())
        .await
        .unwrap();
    let task_id = ctx.wait_for_running(1).await[0];

    let warned = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(SystemEvent::TaskTimeout {
                task_instance_id,
                task_code,
                ..
            }) = events.recv().await
            {
                return (task_instance_id, task_code);
            }
        }
    })
    .await
    .expect("timeout warning");
    assert_eq!(warned, (task_id, 10));

    assert_eq!(ctx.instance(id).await.state, WorkflowExecutionStatus::RunningExecution);
    assert!(ctx.dispatcher.cancelled().is_empty());

    ctx.dispatcher
        .complete(task_id, TaskExecutionStatus::Success, VarPool::new());
    ctx.wait_for_state(id, WorkflowExecutionStatus::Success).await;
}

#[tokio::test]
async fn test_unacknowledged_kill_is_forced() {
    let mock = Arc::new(MockDispatcher::hanging());
    let transport = Arc::new(SilentCancel {
        inner: mock.clone(),
        cancels: Mutex::new(Vec::new()),
    });
    let repo = Arc::new(InMemoryRepository::new());
    let ctx = TestContext::start_with(repo.clone(), repo, transport.clone(), mock).await;
    ctx.save(single_task(7)).await;

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(7, 1, RunParams::default())
        .await
        .unwrap();
    let task_id = ctx.wait_for_running(1).await[0];
    // Let the engine see the worker accept the task.
    ctx.wait_for_tasks(id, "running task", |tasks| {
        tasks[0].state == TaskExecutionStatus::RunningExecution
    })
    .await;

    ctx.runtime.commands().stop(id).await.unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Stop).await;

    let tasks = ctx.tasks(id).await;
    assert_eq!(tasks[0].state, TaskExecutionStatus::Kill);
    assert_eq!(*transport.cancels.lock().unwrap(), vec![task_id]);
    // The worker never heard about it.
    assert_eq!(ctx.dispatcher.running(), vec![task_id]);
}

#[tokio::test]
async fn test_params_resolved_from_pool_and_outputs_filtered() {
    let ctx = TestContext::new().await;
    ctx.save(
        WorkflowDefinition::new(8, 1, "params")
            .with_global_param("limit", json!(10))
            .with_global_param("target", json!("warehouse"))
            .with_task(
                TaskDefinition::new(10, "extract", "SQL")
                    .with_param("limit", json!("${limit}"))
                    .with_outputs(["rows"]),
            )
            .with_task(
                TaskDefinition::new(20, "load", "SHELL")
                    .with_param("count", json!("${rows}"))
                    .with_param("message", json!("load ${rows} rows into ${target}"))
                    .with_param("missing", json!("${nope}")),
            )
            .with_relation(10, 20),
    )
    .await;
    ctx.dispatcher.script(
        10,
        [MockOutcome::Succeed(VarPool::from([
            ("rows".to_string(), json!(42)),
            ("scratch".to_string(), json!("tmp")),
        ]))],
    );

    let run = RunParams {
        params: VarPool::from([("limit".to_string(), json!(5))]),
        start_nodes: Vec::new(),
    };
    let id = ctx.runtime.commands().manual_trigger(8, 1, run).await.unwrap();
    let instance = ctx.wait_for_state(id, WorkflowExecutionStatus::Success).await;

    let requests = ctx.dispatcher.dispatched();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].params["limit"], json!(5));
    assert_eq!(requests[1].params["count"], json!(42));
    assert_eq!(
        requests[1].params["message"],
        json!("load 42 rows into warehouse")
    );
    assert_eq!(requests[1].params["missing"], json!("${nope}"));

    assert_eq!(instance.var_pool.get("rows"), Some(&json!(42)));
    assert!(!instance.var_pool.contains_key("scratch"));

    // The task keeps its full report.
    let extract = &ctx.attempts(id, 10).await[0];
    assert_eq!(extract.var_pool.get("scratch"), Some(&json!("tmp")));
    assert_eq!(extract.flag, TaskFlag::Active);
}

#[tokio::test(start_paused = true)]
async fn test_workflow_timeout_is_reported() {
    let ctx = TestContext::hanging().await;
    ctx.save(single_task(9).with_timeout_minutes(1)).await;
    let mut events = ctx.runtime.bus().subscribe();

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(9, 1, RunParams::default())
        .await
        .unwrap();

    let reported = tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            if let Ok(SystemEvent::WorkflowTimeout { instance_id }) = events.recv().await {
                return instance_id;
            }
        }
    })
    .await
    .expect("workflow timeout event");
    assert_eq!(reported, id);
    assert_eq!(ctx.instance(id).await.state, WorkflowExecutionStatus::RunningExecution);
}
