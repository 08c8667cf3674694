// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invariants that must hold across every run.

mod common;

use std::collections::HashMap;

use common::*;
use skein_core::dispatcher::{MockOutcome, TaskStateChange};
use skein_core::model::{
    RunParams, TaskDefinition, TaskExecutionStatus, TaskFlag, TaskInstance, VarPool,
    WorkflowDefinition, WorkflowExecutionStatus,
};
use skein_master::SystemEvent;

#[tokio::test]
async fn test_one_active_attempt_per_task_code() {
    let ctx = TestContext::new().await;
    ctx.save(
        WorkflowDefinition::new(1, 1, "retries")
            .with_task(TaskDefinition::new(1, "a", "SHELL").with_retries(2, 0))
            .with_task(TaskDefinition::new(2, "b", "SHELL").with_retries(2, 0))
            .with_task(TaskDefinition::new(3, "c", "SHELL"))
            .with_relation(1, 3)
            .with_relation(2, 3),
    )
    .await;
    ctx.dispatcher.script(1, [MockOutcome::Fail, MockOutcome::Fail]);
    ctx.dispatcher.script(2, [MockOutcome::Reject]);

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(1, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Success).await;

    let tasks = ctx.tasks(id).await;
    let mut per_code: HashMap<i64, usize> = HashMap::new();
    for task in active(&tasks) {
        *per_code.entry(task.task_code).or_default() += 1;
    }
    assert_eq!(per_code, HashMap::from([(1, 1), (2, 1), (3, 1)]));
    assert_eq!(ctx.attempts(id, 1).await.len(), 3);
    assert_eq!(ctx.attempts(id, 2).await.len(), 2);
}

#[tokio::test]
async fn test_retry_chain_keeps_first_submit_time() {
    let ctx = TestContext::new().await;
    ctx.save(
        WorkflowDefinition::new(2, 1, "chain")
            .with_task(TaskDefinition::new(10, "flaky", "SHELL").with_retries(3, 0)),
    )
    .await;
    ctx.dispatcher.script(
        10,
        [
            MockOutcome::Fail,
            MockOutcome::Reject,
            MockOutcome::Fail,
            MockOutcome::Succeed(VarPool::new()),
        ],
    );

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(2, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(id, WorkflowExecutionStatus::Success).await;

    let attempts = ctx.attempts(id, 10).await;
    assert_eq!(attempts.len(), 4);
    let first = attempts[0].first_submit_time;
    for (n, pair) in attempts.windows(2).enumerate() {
        assert_eq!(pair[1].first_submit_time, first);
        assert!(pair[1].submit_time > pair[0].submit_time, "attempt {}", n + 1);
        assert_eq!(pair[1].retry_times, pair[0].retry_times + 1);
        assert_eq!(pair[0].flag, TaskFlag::Historical);
    }
    assert_eq!(attempts[3].flag, TaskFlag::Active);
}

#[tokio::test]
async fn test_duplicate_callback_is_ignored() {
    let ctx = TestContext::hanging().await;
    ctx.save(chain(3)).await;
    let mut events = ctx.runtime.bus().subscribe();

    let id = ctx
        .runtime
        .commands()
        .manual_trigger(3, 1, RunParams::default())
        .await
        .unwrap();
    let first = ctx.wait_for_running(1).await[0];
    ctx.dispatcher
        .complete(first, TaskExecutionStatus::Success, VarPool::new());

    // The second task starts only after the first one's success was handled.
    let second = ctx
        .wait_for_tasks(id, "second task", |tasks| tasks.len() == 2)
        .await[1]
        .id;

    // A worker replays its terminal report, then reports a contradicting one.
    ctx.dispatcher
        .send_callback(TaskStateChange::new(first, TaskExecutionStatus::Success));
    ctx.dispatcher
        .send_callback(TaskStateChange::new(first, TaskExecutionStatus::Failure));

    ctx.wait_for_running(1).await;
    ctx.dispatcher
        .complete(second, TaskExecutionStatus::Success, VarPool::new());
    let third = ctx
        .wait_for_tasks(id, "third task", |tasks| tasks.len() == 3)
        .await[2]
        .id;
    ctx.wait_for_running(1).await;
    ctx.dispatcher
        .complete(third, TaskExecutionStatus::Success, VarPool::new());
    ctx.wait_for_state(id, WorkflowExecutionStatus::Success).await;

    let attempts = ctx.attempts(id, 10).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].state, TaskExecutionStatus::Success);

    let mut successes = 0;
    while let Ok(event) = events.try_recv() {
        if let SystemEvent::TaskStateChanged {
            task_instance_id,
            state: TaskExecutionStatus::Success,
            ..
        } = event
            && task_instance_id == first
        {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn test_pause_recover_matches_uninterrupted_run() {
    let ctx = TestContext::new().await;
    ctx.save(chain(4)).await;
    // Only the first dispatch of the first task waits for the test.
    ctx.dispatcher.script(10, [MockOutcome::Hang]);

    let paused = ctx
        .runtime
        .commands()
        .manual_trigger(4, 1, RunParams::default())
        .await
        .unwrap();
    let first = ctx.wait_for_running(1).await[0];
    ctx.runtime.commands().pause(paused).await.unwrap();
    ctx.dispatcher
        .complete(first, TaskExecutionStatus::Success, VarPool::new());
    ctx.wait_for_state(paused, WorkflowExecutionStatus::Pause).await;

    let ack = ctx.runtime.commands().recover_suspended(paused).await.unwrap();
    assert!(ack.is_accepted());
    ctx.wait_for_state(paused, WorkflowExecutionStatus::Success).await;

    let straight = ctx
        .runtime
        .commands()
        .manual_trigger(4, 1, RunParams::default())
        .await
        .unwrap();
    ctx.wait_for_state(straight, WorkflowExecutionStatus::Success)
        .await;

    let outcome = |tasks: &[TaskInstance]| {
        let mut outcome: Vec<(i64, TaskExecutionStatus)> = active(tasks)
            .into_iter()
            .map(|t| (t.task_code, t.state))
            .collect();
        outcome.sort_by_key(|(code, _)| *code);
        outcome
    };
    let paused_tasks = ctx.tasks(paused).await;
    let straight_tasks = ctx.tasks(straight).await;
    assert_eq!(outcome(&paused_tasks), outcome(&straight_tasks));

    // The paused attempt of the second task was replaced on recover.
    let second = ctx.attempts(paused, 20).await;
    assert_eq!(second.len(), 2);
    assert_eq!(second[0].state, TaskExecutionStatus::Pause);
    assert_eq!(second[0].flag, TaskFlag::Historical);
    assert_eq!(second[1].first_submit_time, second[0].first_submit_time);
}
