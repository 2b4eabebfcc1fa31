use super::test_helpers::Harness;
use crate::{
    commands::{CommandContext, Surface},
    config::Config,
    models::{
        ExecutionOutcome, Origin, Priority, Provider, QueueName, Target, TaskKind, TaskStatus,
    },
};
use std::time::Duration;

fn issue_origin(event_id: &str) -> Origin {
    Origin {
        provider: Provider::IssueTracker,
        organization_id: "acme".to_string(),
        event_id: event_id.to_string(),
        actor: Some("alice".to_string()),
    }
}

fn code_host_ctx(reference: &str) -> CommandContext {
    CommandContext {
        surface: Surface::CodeHost,
        provider: Provider::CodeHost,
        organization_id: "acme".to_string(),
        event_id: "comment-1".to_string(),
        actor: "alice".to_string(),
        repo: Some("acme/widgets".to_string()),
        reference: Some(reference.to_string()),
        task_id: None,
    }
}

const PLAN_ENVELOPE: &str =
    r#"echo '{"outcome":"success","plan_ref":"PR#17","usage":{"input_tokens":10,"output_tokens":5,"cost_usd":0.01}}'"#;
const EXECUTE_ENVELOPE: &str =
    r#"echo '{"outcome":"success","pr_ref":"PR#18","usage":{"input_tokens":20,"output_tokens":9,"cost_usd":0.02}}'"#;

/// Scenario: plan-then-approve happy path, end to end.
#[tokio::test]
async fn plan_then_approve_happy_path() {
    let harness = Harness::new();

    // Ticket PROJ-42 labeled AI-Fix lands as a queued fix task.
    let created = harness
        .lifecycle
        .create_task(
            issue_origin("evt-42"),
            Target::new("acme/widgets").with_reference("PROJ-42"),
            TaskKind::Fix,
            Priority::Normal,
        )
        .await
        .unwrap();
    assert!(!created.deduplicated);
    let task_id = created.task.id.clone();
    assert_eq!(created.task.status, TaskStatus::Queued);
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Plan).await, 1);

    // Planning pass.
    let worked = harness.worker(PLAN_ENVELOPE).tick().await.unwrap();
    assert!(worked);

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval);
    assert_eq!(task.plan_ref.as_deref(), Some("PR#17"));
    assert_eq!(task.usage.input_tokens, 10);
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Plan).await, 0);

    // Human approval arrives as a comment on the plan artifact.
    let reply = harness
        .commands
        .dispatch("@agent approve", &code_host_ctx("PR#17"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.task_id.as_deref(), Some(task_id.as_str()));

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Approved);
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Execute).await, 1);

    // Execution pass.
    let worked = harness.worker(EXECUTE_ENVELOPE).tick().await.unwrap();
    assert!(worked);

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.pr_ref.as_deref(), Some("PR#18"));
    assert_eq!(task.usage.input_tokens, 30);

    // Two finished execution records, in order.
    let chain = harness.lifecycle.store().executions(&task_id).await.unwrap();
    assert_eq!(chain.len(), 2);
    assert_eq!(chain[0].agent, "planner");
    assert_eq!(chain[1].agent, "executor");
    assert!(chain
        .iter()
        .all(|r| r.outcome == Some(ExecutionOutcome::Success)));

    // Chat was told about the plan and the completion.
    let outbox = harness.outbox.snapshot().await;
    assert!(outbox.iter().any(|m| m.surface == "chat" && m.body.contains("Plan ready")));
    assert!(outbox.iter().any(|m| m.surface == "chat" && m.body.contains("completed")));
}

/// Scenario: the same event delivered twice yields exactly one task.
#[tokio::test]
async fn duplicate_event_yields_one_task() {
    let harness = Harness::new();
    let target = Target::new("acme/widgets").with_reference("PROJ-42");

    let first = harness
        .lifecycle
        .create_task(issue_origin("evt-42"), target.clone(), TaskKind::Fix, Priority::Normal)
        .await
        .unwrap();
    let second = harness
        .lifecycle
        .create_task(issue_origin("evt-42"), target, TaskKind::Fix, Priority::Normal)
        .await
        .unwrap();

    assert!(!first.deduplicated);
    assert!(second.deduplicated);
    assert_eq!(second.task.id, first.task.id);
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Plan).await, 1);
    assert_eq!(harness.metrics.snapshot().tasks_deduplicated, 1);
}

/// Scenario: reject path, then a late approve is refused.
#[tokio::test]
async fn reject_then_late_approve_is_refused() {
    let harness = Harness::new();
    let created = harness
        .lifecycle
        .create_task(
            issue_origin("evt-42"),
            Target::new("acme/widgets"),
            TaskKind::Fix,
            Priority::Normal,
        )
        .await
        .unwrap();
    let task_id = created.task.id.clone();

    harness.worker(PLAN_ENVELOPE).tick().await.unwrap();

    let reply = harness
        .commands
        .dispatch("@agent reject not now", &code_host_ctx("PR#17"))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.message.contains("Rejected"));

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Rejected);
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Execute).await, 0);

    // The fingerprint is released only for terminal tasks, and rejected
    // is terminal: the same ticket can be re-labeled later.
    let reply = harness
        .commands
        .dispatch("@agent approve", &code_host_ctx("PR#17"))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.message.contains("no-task-in-context") || reply.message.contains("illegal"));
}

/// Scenario: approve twice - the second is a refused no-op.
#[tokio::test]
async fn second_approve_is_noop() {
    let harness = Harness::new();
    let created = harness
        .lifecycle
        .create_task(
            issue_origin("evt-42"),
            Target::new("acme/widgets").with_reference("PR#17"),
            TaskKind::Fix,
            Priority::Normal,
        )
        .await
        .unwrap();
    let task_id = created.task.id.clone();

    harness.worker(PLAN_ENVELOPE).tick().await.unwrap();
    harness
        .commands
        .dispatch("@agent approve", &code_host_ctx("PR#17"))
        .await
        .unwrap()
        .unwrap();

    let reply = harness
        .commands
        .dispatch("@agent approve", &code_host_ctx("PR#17"))
        .await
        .unwrap()
        .unwrap();
    assert!(reply.message.contains("illegal-transition"));

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Approved);
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Execute).await, 1);
}

/// Scenario: subprocess timeout requeues with a bumped attempt.
#[tokio::test]
async fn subprocess_timeout_requeues() {
    let mut config = Config::for_tests();
    config.worker.plan_timeout_seconds = 0;
    let harness = Harness::with_config(config);

    let created = harness
        .lifecycle
        .create_task(
            issue_origin("evt-42"),
            Target::new("acme/widgets"),
            TaskKind::Fix,
            Priority::Normal,
        )
        .await
        .unwrap();
    let task_id = created.task.id.clone();

    harness.worker("sleep 30").tick().await.unwrap();

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert_eq!(task.attempts, 1);
    assert!(task.last_error.as_deref().unwrap_or("").contains("timed out"));
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Plan).await, 1);

    let chain = harness.lifecycle.store().executions(&task_id).await.unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].outcome, Some(ExecutionOutcome::Timeout));
}

/// Scenario: the attempt budget exhausts into `failed` with
/// reason `max-retries`.
#[tokio::test]
async fn exhausted_attempts_fail_with_max_retries() {
    let mut config = Config::for_tests();
    config.worker.max_attempts = 1;
    let harness = Harness::with_config(config);

    let created = harness
        .lifecycle
        .create_task(
            issue_origin("evt-42"),
            Target::new("acme/widgets"),
            TaskKind::Fix,
            Priority::Normal,
        )
        .await
        .unwrap();
    let task_id = created.task.id.clone();

    harness.worker("exit 3").tick().await.unwrap();

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.as_deref().unwrap().starts_with("max-retries:"));
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Plan).await, 0);

    // A new event for the same fingerprint may create a fresh task now.
    let again = harness
        .lifecycle
        .create_task(
            issue_origin("evt-42"),
            Target::new("acme/widgets"),
            TaskKind::Fix,
            Priority::Normal,
        )
        .await
        .unwrap();
    assert!(!again.deduplicated);
}

/// Scenario: improve loop attaches feedback and replans.
#[tokio::test]
async fn improve_loop_carries_feedback_into_next_plan() {
    let harness = Harness::new();
    let created = harness
        .lifecycle
        .create_task(
            issue_origin("evt-42"),
            Target::new("acme/widgets").with_reference("PR#17"),
            TaskKind::Fix,
            Priority::Normal,
        )
        .await
        .unwrap();
    let task_id = created.task.id.clone();

    harness.worker(PLAN_ENVELOPE).tick().await.unwrap();

    let reply = harness
        .commands
        .dispatch(
            "@agent improve focus only on module X",
            &code_host_ctx("PR#17"),
        )
        .await
        .unwrap()
        .unwrap();
    assert!(reply.message.contains("planning"));

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Planning);
    assert_eq!(task.feedback.as_deref(), Some("focus only on module X"));
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Plan).await, 1);

    // The next planning pass sees the feedback in its descriptor: the
    // stub dumps the descriptor to stdout, which lands in the task log.
    harness.worker("cat \"$1\"").tick().await.unwrap();
    let page = harness
        .lifecycle
        .logs()
        .read(&task_id, 0, 1000)
        .await
        .unwrap();
    let dump: String = page
        .entries
        .iter()
        .map(|e| e.message.clone())
        .collect::<Vec<_>>()
        .join("\n");
    assert!(dump.contains("focus only on module X"));

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::AwaitingApproval);
}

/// A task cancelled while its subprocess runs records a cancelled
/// execution and stays failed.
#[tokio::test]
async fn cancellation_interrupts_running_subprocess() {
    let harness = Harness::new();
    let created = harness
        .lifecycle
        .create_task(
            issue_origin("evt-42"),
            Target::new("acme/widgets"),
            TaskKind::Fix,
            Priority::Normal,
        )
        .await
        .unwrap();
    let task_id = created.task.id.clone();

    let worker = harness.worker("sleep 30");
    let tick = tokio::spawn(async move { worker.tick().await });

    // Give the worker time to claim and launch, then cancel.
    tokio::time::sleep(Duration::from_millis(300)).await;
    harness.lifecycle.cancel(&task_id, "operator").await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), tick)
        .await
        .expect("tick should finish after cancel")
        .unwrap()
        .unwrap();

    let task = harness.lifecycle.store().get(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.last_error.as_deref().unwrap().contains("cancelled"));

    let chain = harness.lifecycle.store().executions(&task_id).await.unwrap();
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].outcome, Some(ExecutionOutcome::Cancelled));

    // The claim was acked; nothing left to re-deliver.
    assert_eq!(harness.lifecycle.queue().depth(QueueName::Plan).await, 0);
}

/// Priority ordering is honored across tasks in the plan queue.
#[tokio::test]
async fn critical_tasks_plan_first() {
    let harness = Harness::new();
    let low = harness
        .lifecycle
        .create_task(
            issue_origin("evt-low"),
            Target::new("acme/low"),
            TaskKind::Fix,
            Priority::Low,
        )
        .await
        .unwrap();
    let critical = harness
        .lifecycle
        .create_task(
            issue_origin("evt-critical"),
            Target::new("acme/critical"),
            TaskKind::Fix,
            Priority::Critical,
        )
        .await
        .unwrap();

    harness.worker(PLAN_ENVELOPE).tick().await.unwrap();

    let critical_task = harness
        .lifecycle
        .store()
        .get(&critical.task.id)
        .await
        .unwrap();
    let low_task = harness.lifecycle.store().get(&low.task.id).await.unwrap();
    assert_eq!(critical_task.status, TaskStatus::AwaitingApproval);
    assert_eq!(low_task.status, TaskStatus::Queued);
}
