use crate::{
    collab::Collaborators,
    constants, ids,
    ids::TaskIdGenerator,
    logs::LogChannel,
    models::{
        ExecutionOutcome, ExecutionRecord, Origin, Priority, QueueName, StreamTag, Target, Task,
        TaskKind, TaskStatus, UsageCounters,
    },
    monitoring::Metrics,
    queue::WorkQueue,
    store::TaskStore,
    MendError, Result,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Events that drive the task state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    WorkerClaimed(QueueName),
    StageSucceeded(QueueName),
    StageFailedRetryable(QueueName),
    StageFailedFatal(QueueName),
    ApproveCommand,
    ImproveCommand,
    RejectCommand,
    MaxRetries,
    OperatorCancel,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskEvent::WorkerClaimed(q) => return write!(f, "worker-claimed({q})"),
            TaskEvent::StageSucceeded(q) => return write!(f, "stage-succeeded({q})"),
            TaskEvent::StageFailedRetryable(q) => return write!(f, "stage-failed-retryable({q})"),
            TaskEvent::StageFailedFatal(q) => return write!(f, "stage-failed-fatal({q})"),
            TaskEvent::ApproveCommand => "approve",
            TaskEvent::ImproveCommand => "improve",
            TaskEvent::RejectCommand => "reject",
            TaskEvent::MaxRetries => "max-retries",
            TaskEvent::OperatorCancel => "operator-cancel",
        };
        f.write_str(s)
    }
}

/// The legal-transition table. `None` means the event is illegal from
/// that status.
///
/// A plan claim is legal from `Planning` as well as `Queued`: the
/// improve loop parks the task in `Planning` before the next worker
/// picks it up. Retryable failures return the task to the status its
/// stage is claimed from (`Queued` for planning, `Approved` for
/// execution) so the re-claim passes the same guard.
pub fn next_status(from: TaskStatus, event: &TaskEvent) -> Option<TaskStatus> {
    use QueueName::*;
    use TaskStatus::*;

    match (from, event) {
        (Queued, TaskEvent::WorkerClaimed(Plan)) => Some(Planning),
        (Planning, TaskEvent::WorkerClaimed(Plan)) => Some(Planning),
        (Planning, TaskEvent::StageSucceeded(Plan)) => Some(AwaitingApproval),
        (Planning, TaskEvent::StageFailedRetryable(Plan)) => Some(Queued),
        (Planning, TaskEvent::StageFailedFatal(Plan)) => Some(Failed),
        (AwaitingApproval, TaskEvent::ApproveCommand) => Some(Approved),
        (AwaitingApproval, TaskEvent::ImproveCommand) => Some(Planning),
        (AwaitingApproval, TaskEvent::RejectCommand) => Some(Rejected),
        (Approved, TaskEvent::WorkerClaimed(Execute)) => Some(Executing),
        (Executing, TaskEvent::WorkerClaimed(Execute)) => Some(Executing),
        (Executing, TaskEvent::StageSucceeded(Execute)) => Some(Completed),
        (Executing, TaskEvent::StageFailedRetryable(Execute)) => Some(Approved),
        (Executing, TaskEvent::StageFailedFatal(Execute)) => Some(Failed),
        (from, TaskEvent::MaxRetries) if !from.is_terminal() => Some(Failed),
        (from, TaskEvent::OperatorCancel) if !from.is_terminal() => Some(Failed),
        _ => None,
    }
}

/// Exponential backoff with jitter; one schedule for requeues and
/// subprocess retries alike.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exp = constants::BACKOFF_FACTOR.saturating_pow(attempt.min(16));
    let base = constants::BACKOFF_BASE_SECS
        .saturating_mul(exp)
        .min(constants::BACKOFF_CAP_SECS);
    let jitter_span = (base as f64 * constants::BACKOFF_JITTER_RATIO).max(0.0);
    let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
    Duration::from_secs_f64((base as f64 + jitter).max(0.0))
}

/// Cooperative cancellation fan-in. Workers subscribe per task; the
/// lifecycle flips the flag when a running task turns terminal.
#[derive(Default)]
pub struct CancelRegistry {
    inner: std::sync::Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl CancelRegistry {
    pub fn subscribe(&self, task_id: &str) -> watch::Receiver<bool> {
        let mut inner = self.inner.lock().expect("cancel registry poisoned");
        inner
            .entry(task_id.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }

    pub fn cancel(&self, task_id: &str) {
        let inner = self.inner.lock().expect("cancel registry poisoned");
        if let Some(sender) = inner.get(task_id) {
            let _ = sender.send(true);
        }
    }

    pub fn clear(&self, task_id: &str) {
        let mut inner = self.inner.lock().expect("cancel registry poisoned");
        inner.remove(task_id);
    }
}

/// Outcome of task creation: either a fresh task or the surviving
/// non-terminal task with the same fingerprint.
#[derive(Debug, Clone)]
pub struct CreatedTask {
    pub task: Task,
    pub deduplicated: bool,
}

/// The one component allowed to move task status.
///
/// Every mutation goes through the store's check-and-set, retried on
/// version conflict, and every successful transition emits a structured
/// event and fans out its side effects (queue moves, collaborator
/// notifications, cancellation signals).
pub struct TaskLifecycle {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    logs: Arc<LogChannel>,
    collab: Collaborators,
    metrics: Arc<Metrics>,
    ids: TaskIdGenerator,
    cancels: CancelRegistry,
}

impl TaskLifecycle {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        logs: Arc<LogChannel>,
        collab: Collaborators,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            queue,
            logs,
            collab,
            metrics,
            ids: TaskIdGenerator::new(),
            cancels: CancelRegistry::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<dyn WorkQueue> {
        &self.queue
    }

    pub fn logs(&self) -> &Arc<LogChannel> {
        &self.logs
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collab
    }

    pub fn cancels(&self) -> &CancelRegistry {
        &self.cancels
    }

    /// Create a task and enqueue it for planning. A live task with the
    /// same fingerprint wins instead and the call reports deduplication.
    pub async fn create_task(
        &self,
        origin: Origin,
        target: Target,
        kind: TaskKind,
        priority: Priority,
    ) -> Result<CreatedTask> {
        let fingerprint = ids::fingerprint(&origin, &target);

        if let Some(existing) = self.store.find_active_by_fingerprint(&fingerprint).await? {
            Metrics::incr(&self.metrics.tasks_deduplicated);
            info!(task_id = %existing.id, fingerprint = %fingerprint, "Duplicate task ignored");
            return Ok(CreatedTask {
                task: existing,
                deduplicated: true,
            });
        }

        let task = Task::new(
            self.ids.next_id(),
            fingerprint.clone(),
            origin,
            target,
            kind,
            priority,
        );

        match self.store.put(task.clone()).await {
            Ok(()) => {}
            Err(MendError::Duplicate { task_id }) => {
                // Lost a race with a concurrent webhook delivery.
                Metrics::incr(&self.metrics.tasks_deduplicated);
                let existing = self.store.get(&task_id).await?;
                return Ok(CreatedTask {
                    task: existing,
                    deduplicated: true,
                });
            }
            Err(e) => return Err(e),
        }

        if let Err(e) = self
            .queue
            .enqueue(QueueName::Plan, &task.id, &fingerprint, priority)
            .await
        {
            match e {
                MendError::Duplicate { task_id } => {
                    let existing = self.store.get(&task_id).await?;
                    return Ok(CreatedTask {
                        task: existing,
                        deduplicated: true,
                    });
                }
                MendError::QueueFull { .. } => {
                    // The task record must not dangle in `queued` with no
                    // queue item behind it.
                    let _ = self
                        .transition(&task.id, TaskEvent::OperatorCancel, |t| {
                            t.last_error = Some("queue-full at intake".to_string());
                        })
                        .await;
                    return Err(e);
                }
                e => return Err(e),
            }
        }

        Metrics::incr(&self.metrics.tasks_created);
        self.logs
            .append(
                &task.id,
                StreamTag::System,
                &format!(
                    "task created: kind={} target={} priority={:?}",
                    task.kind, task.target.repo, task.priority
                ),
            )
            .await?;
        info!(task_id = %task.id, kind = %task.kind, "Task created and queued for planning");

        Ok(CreatedTask {
            task,
            deduplicated: false,
        })
    }

    /// Apply one state-machine event with CAS retry (3 attempts, linear
    /// backoff) and emit the transition event.
    pub async fn transition(
        &self,
        task_id: &str,
        event: TaskEvent,
        apply: impl Fn(&mut Task) + Send + Sync,
    ) -> Result<Task> {
        let mut attempt = 0;
        loop {
            let task = self.store.get(task_id).await?;
            let Some(next) = next_status(task.status, &event) else {
                return Err(MendError::IllegalTransition {
                    task_id: task_id.to_string(),
                    from: task.status.to_string(),
                    event: event.to_string(),
                });
            };

            let before = task.status;
            let mut updated = task.clone();
            updated.status = next;
            apply(&mut updated);

            match self.store.compare_and_update(updated, task.version).await {
                Ok(stored) => {
                    info!(
                        task_id = %task_id,
                        from = %before,
                        to = %stored.status,
                        event = %event,
                        "Task transition"
                    );
                    return Ok(stored);
                }
                Err(MendError::VersionConflict { .. })
                    if attempt < constants::VERSION_CONFLICT_RETRIES =>
                {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(
                        constants::VERSION_CONFLICT_BACKOFF_MS * attempt as u64,
                    ))
                    .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Worker claim: move into the stage's active status and open an
    /// execution record.
    pub async fn begin_stage(
        &self,
        task_id: &str,
        stage: QueueName,
        agent: &str,
        session_id: &str,
    ) -> Result<Task> {
        let task = self.store.get(task_id).await?;
        let status_before = task.status;
        let task = self
            .transition(task_id, TaskEvent::WorkerClaimed(stage), |_| {})
            .await?;

        self.store
            .record_execution(ExecutionRecord {
                task_id: task_id.to_string(),
                agent: agent.to_string(),
                session_id: session_id.to_string(),
                started_at: chrono::Utc::now(),
                finished_at: None,
                outcome: None,
                usage: UsageCounters::default(),
                next_agent_hint: None,
                status_before,
                status_after: None,
            })
            .await?;
        Ok(task)
    }

    /// Successful planning pass: park the plan for human approval.
    pub async fn complete_planning(
        &self,
        task_id: &str,
        plan_ref: Option<String>,
        usage: UsageCounters,
        next_agent_hint: Option<String>,
    ) -> Result<Task> {
        let plan = plan_ref.clone();
        let task = self
            .transition(task_id, TaskEvent::StageSucceeded(QueueName::Plan), |t| {
                if plan.is_some() {
                    t.plan_ref = plan.clone();
                }
                t.usage.accumulate(&usage);
                t.last_error = None;
            })
            .await?;

        self.store
            .finish_execution(
                task_id,
                ExecutionOutcome::Success,
                usage.clone(),
                next_agent_hint,
                task.status,
            )
            .await?;
        self.metrics
            .record_usage(usage.input_tokens, usage.output_tokens, usage.cost_usd);

        let artifact = task.plan_ref.as_deref().unwrap_or("(no artifact)");
        self.collab
            .code_host
            .post_plan(&task.target.repo, task.target.reference.as_deref(), artifact)
            .await
            .unwrap_or_else(|e| warn!(task_id, "plan post failed: {e}"));
        self.collab
            .chat
            .notify(&format!(
                "Plan ready for `{}` ({}): {} - reply `@agent approve` to execute",
                task.target.repo, task.id, artifact
            ))
            .await
            .unwrap_or_else(|e| warn!(task_id, "chat notify failed: {e}"));

        self.logs
            .append(
                task_id,
                StreamTag::System,
                &format!("planning complete, awaiting approval (plan: {artifact})"),
            )
            .await?;
        Ok(task)
    }

    /// Successful execution pass: the pipeline is done.
    pub async fn complete_execution(
        &self,
        task_id: &str,
        pr_ref: Option<String>,
        usage: UsageCounters,
    ) -> Result<Task> {
        let pr = pr_ref.clone();
        let task = self
            .transition(task_id, TaskEvent::StageSucceeded(QueueName::Execute), |t| {
                if pr.is_some() {
                    t.pr_ref = pr.clone();
                }
                t.usage.accumulate(&usage);
                t.last_error = None;
            })
            .await?;

        self.store
            .finish_execution(
                task_id,
                ExecutionOutcome::Success,
                usage.clone(),
                None,
                task.status,
            )
            .await?;
        self.metrics
            .record_usage(usage.input_tokens, usage.output_tokens, usage.cost_usd);
        Metrics::incr(&self.metrics.tasks_completed);
        self.cancels.clear(task_id);

        let artifact = task.pr_ref.as_deref().unwrap_or("(no PR)");
        if let Some(reference) = task.target.reference.as_deref() {
            self.collab
                .code_host
                .post_comment(
                    &task.target.repo,
                    reference,
                    &format!("Fix executed: {artifact}"),
                )
                .await
                .unwrap_or_else(|e| warn!(task_id, "code-host comment failed: {e}"));
        }
        self.collab
            .chat
            .notify(&format!(
                "Task {} completed for `{}`: {}",
                task.id, task.target.repo, artifact
            ))
            .await
            .unwrap_or_else(|e| warn!(task_id, "chat notify failed: {e}"));

        self.logs
            .append(task_id, StreamTag::System, "execution complete")
            .await?;
        Ok(task)
    }

    /// Retryable stage failure: the item went back to its queue; the
    /// task returns to the claimable status with the bumped attempt.
    pub async fn retry_stage(
        &self,
        task_id: &str,
        stage: QueueName,
        outcome: ExecutionOutcome,
        attempts: u32,
        reason: &str,
    ) -> Result<Task> {
        let task = self
            .transition(task_id, TaskEvent::StageFailedRetryable(stage), |t| {
                t.attempts = attempts;
                t.last_error = Some(reason.to_string());
            })
            .await?;

        self.store
            .finish_execution(task_id, outcome, UsageCounters::default(), None, task.status)
            .await?;
        self.logs
            .append(
                task_id,
                StreamTag::System,
                &format!("{stage} attempt {attempts} failed ({reason}), will retry"),
            )
            .await?;
        Ok(task)
    }

    /// Fatal stage failure: no retry.
    pub async fn fail_stage(
        &self,
        task_id: &str,
        stage: QueueName,
        outcome: ExecutionOutcome,
        reason: &str,
    ) -> Result<Task> {
        let task = self
            .transition(task_id, TaskEvent::StageFailedFatal(stage), |t| {
                t.last_error = Some(reason.to_string());
            })
            .await?;

        self.store
            .finish_execution(task_id, outcome, UsageCounters::default(), None, task.status)
            .await?;
        self.after_failure(&task, reason).await;
        Ok(task)
    }

    /// Dead-letter drain: the queue exhausted the attempt budget. The
    /// stored last error describes what kept failing unless the caller
    /// knows better.
    pub async fn fail_max_retries(&self, task_id: &str, detail: Option<&str>) -> Result<Task> {
        let prior = self.store.get(task_id).await?;
        let detail = detail
            .map(str::to_string)
            .or_else(|| prior.last_error.clone())
            .unwrap_or_else(|| "exhausted attempts".to_string());
        let task = self
            .transition(task_id, TaskEvent::MaxRetries, |t| {
                t.last_error = Some(format!("max-retries: {detail}"));
            })
            .await?;
        Metrics::incr(&self.metrics.queue_dead_letters);
        self.after_failure(&task, "max-retries").await;
        Ok(task)
    }

    async fn after_failure(&self, task: &Task, reason: &str) {
        Metrics::incr(&self.metrics.tasks_failed);
        self.cancels.cancel(&task.id);
        self.cancels.clear(&task.id);
        let _ = self
            .logs
            .append(&task.id, StreamTag::System, &format!("task failed: {reason}"))
            .await;
        self.collab
            .chat
            .notify(&format!(
                "Task {} failed for `{}`: {}",
                task.id,
                task.target.repo,
                task.last_error.as_deref().unwrap_or(reason)
            ))
            .await
            .unwrap_or_else(|e| warn!(task_id = %task.id, "chat notify failed: {e}"));
    }

    /// `approve` command: hand the plan to the execute queue.
    pub async fn approve(&self, task_id: &str, actor: &str) -> Result<Task> {
        let task = self
            .transition(task_id, TaskEvent::ApproveCommand, |t| {
                t.context
                    .insert("approved_by".to_string(), actor.to_string());
            })
            .await?;

        self.queue
            .enqueue(
                QueueName::Execute,
                &task.id,
                &task.fingerprint,
                task.priority,
            )
            .await?;
        self.logs
            .append(
                task_id,
                StreamTag::System,
                &format!("approved by {actor}, queued for execution"),
            )
            .await?;
        Ok(task)
    }

    /// `reject` command: terminal, with optional reviewer note.
    pub async fn reject(&self, task_id: &str, actor: &str, note: Option<&str>) -> Result<Task> {
        let note_owned = note.map(str::to_string);
        let task = self
            .transition(task_id, TaskEvent::RejectCommand, |t| {
                if let Some(n) = &note_owned {
                    t.context.insert("rejection_note".to_string(), n.clone());
                }
                t.context
                    .insert("rejected_by".to_string(), actor.to_string());
            })
            .await?;

        Metrics::incr(&self.metrics.tasks_rejected);
        self.cancels.cancel(task_id);
        self.cancels.clear(task_id);
        self.logs
            .append(task_id, StreamTag::System, &format!("rejected by {actor}"))
            .await?;
        self.collab
            .chat
            .notify(&format!("Task {} rejected by {}", task.id, actor))
            .await
            .unwrap_or_else(|e| warn!(task_id, "chat notify failed: {e}"));
        Ok(task)
    }

    /// `improve` command: back to planning with reviewer feedback
    /// attached; the feedback rides into the next runner descriptor.
    pub async fn improve(&self, task_id: &str, actor: &str, feedback: &str) -> Result<Task> {
        let feedback_owned = feedback.to_string();
        let task = self
            .transition(task_id, TaskEvent::ImproveCommand, |t| {
                t.feedback = Some(feedback_owned.clone());
                t.context
                    .insert("improve_requested_by".to_string(), actor.to_string());
            })
            .await?;

        self.queue
            .enqueue(QueueName::Plan, &task.id, &task.fingerprint, task.priority)
            .await?;
        self.logs
            .append(
                task_id,
                StreamTag::System,
                &format!("improvement requested by {actor}: {feedback}"),
            )
            .await?;
        Ok(task)
    }

    /// Operator cancel (`task cancel <id>`): terminal from any
    /// non-terminal status; a running subprocess gets the cancel signal.
    pub async fn cancel(&self, task_id: &str, actor: &str) -> Result<Task> {
        let task = self
            .transition(task_id, TaskEvent::OperatorCancel, |t| {
                t.last_error = Some(format!("cancelled by {actor}"));
            })
            .await?;

        // A ready queue item (not yet claimed) is dropped outright; a
        // claimed one is interrupted through the cancel signal and the
        // worker's ack removes it.
        let _ = self.queue.remove_ready(task_id).await;
        Metrics::incr(&self.metrics.tasks_failed);
        self.cancels.cancel(task_id);
        self.logs
            .append(task_id, StreamTag::System, &format!("cancelled by {actor}"))
            .await?;
        Ok(task)
    }
}
