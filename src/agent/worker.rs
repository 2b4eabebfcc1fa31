use crate::{
    agent::runner::{RunnerClient, RunnerInvocation},
    config::WorkerConfig,
    constants,
    lifecycle::{backoff_delay, TaskLifecycle},
    models::{ExecutionOutcome, QueueName, Task, UsageCounters},
    monitoring::Metrics,
    queue::{NackOutcome, QueueItem},
    repocache::RepoCacheManager,
    tokens::TokenBroker,
    MendError, Result,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// One worker: single-threaded per claim, many workers per process.
pub struct Worker {
    id: String,
    lifecycle: Arc<TaskLifecycle>,
    runner: Arc<RunnerClient>,
    cache: Arc<RepoCacheManager>,
    broker: Arc<dyn TokenBroker>,
    metrics: Arc<Metrics>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(
        id: String,
        lifecycle: Arc<TaskLifecycle>,
        runner: Arc<RunnerClient>,
        cache: Arc<RepoCacheManager>,
        broker: Arc<dyn TokenBroker>,
        metrics: Arc<Metrics>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            id,
            lifecycle,
            runner,
            cache,
            broker,
            metrics,
            config,
        }
    }

    fn visibility(&self) -> Duration {
        Duration::from_secs(self.config.claim_visibility_seconds)
    }

    fn stage_timeout(&self, stage: QueueName) -> Duration {
        match stage {
            QueueName::Plan => Duration::from_secs(self.config.plan_timeout_seconds),
            QueueName::Execute => Duration::from_secs(self.config.execute_timeout_seconds),
        }
    }

    fn agent_name(stage: QueueName) -> &'static str {
        match stage {
            QueueName::Plan => "planner",
            QueueName::Execute => "executor",
        }
    }

    /// Claim-process loop. Runs until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.id, "Worker started");
        let mut backend_pause = 1u64;

        loop {
            if *shutdown.borrow() {
                info!(worker = %self.id, "Worker stopping");
                return;
            }

            match self.tick().await {
                Ok(worked) => {
                    backend_pause = 1;
                    if !worked {
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_millis(
                                constants::WORKER_IDLE_POLL_MS,
                            )) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
                Err(e) => {
                    // Backend trouble: pause with exponential sleep, never
                    // spin and never drop work silently.
                    error!(worker = %self.id, "Worker tick failed: {e}");
                    tokio::time::sleep(Duration::from_secs(backend_pause)).await;
                    backend_pause = (backend_pause * 2).min(constants::BACKEND_PAUSE_CAP_SECS);
                }
            }
        }
    }

    /// One pass: fail dead letters, then try to claim and process one
    /// item. Returns whether any work was found.
    pub async fn tick(&self) -> Result<bool> {
        for dead in self.lifecycle.queue().drain_dead_letters().await {
            match self
                .lifecycle
                .fail_max_retries(&dead.item.task_id, None)
                .await
            {
                Ok(_) => {}
                // Already terminal: the cancel/reject path got there first.
                Err(MendError::IllegalTransition { .. }) => {}
                Err(e) => warn!(task_id = %dead.item.task_id, "Dead-letter failure: {e}"),
            }
        }

        // Execution finishes in-flight work; it goes first.
        for stage in [QueueName::Execute, QueueName::Plan] {
            if let Some(item) = self
                .lifecycle
                .queue()
                .claim(stage, &self.id, self.visibility())
                .await?
            {
                self.process(stage, item).await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn process(&self, stage: QueueName, item: QueueItem) {
        let task_id = item.task_id.clone();
        debug!(worker = %self.id, task_id = %task_id, stage = %stage, "Processing claim");

        let session_id = crate::ids::new_session_id();
        let task = match self
            .lifecycle
            .begin_stage(&task_id, stage, Self::agent_name(stage), &session_id)
            .await
        {
            Ok(task) => task,
            Err(MendError::IllegalTransition { from, .. }) => {
                // The state moved on (reject, cancel, duplicate delivery);
                // drop the claim.
                debug!(task_id = %task_id, from = %from, "Claim obsolete, acking");
                let _ = self.lifecycle.queue().ack(stage, &task_id, &self.id).await;
                return;
            }
            Err(e) => {
                warn!(task_id = %task_id, "begin_stage failed: {e}");
                self.retry_or_fail(stage, &item, ExecutionOutcome::Failed, &e.to_string(), false)
                    .await;
                return;
            }
        };

        // Heartbeat keeps the claim visible-deadline ahead of us for the
        // whole subprocess run.
        let heartbeat = self.spawn_heartbeat(stage, task_id.clone());

        let outcome = self.execute(stage, &task, &session_id).await;
        heartbeat.abort();

        match outcome {
            Ok(()) => {
                let _ = self.lifecycle.queue().ack(stage, &task_id, &self.id).await;
            }
            Err(e) if e.is_retryable() => {
                self.retry_or_fail(
                    stage,
                    &item,
                    outcome_for_error(&e),
                    &e.to_string(),
                    true,
                )
                .await;
            }
            Err(e) => {
                let _ = self.lifecycle.queue().ack(stage, &task_id, &self.id).await;
                if let Err(fail_err) = self
                    .lifecycle
                    .fail_stage(&task_id, stage, outcome_for_error(&e), &e.to_string())
                    .await
                {
                    warn!(task_id = %task_id, "fail_stage failed: {fail_err}");
                }
            }
        }
    }

    fn spawn_heartbeat(&self, stage: QueueName, task_id: String) -> tokio::task::JoinHandle<()> {
        let queue = self.lifecycle.queue().clone();
        let worker_id = self.id.clone();
        let visibility = self.visibility();
        let interval = visibility / 3;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = queue.extend(stage, &task_id, &worker_id, visibility).await {
                    debug!(task_id = %task_id, "Heartbeat stopped: {e}");
                    return;
                }
            }
        })
    }

    /// Prepare the working copy, run the subprocess, and apply the
    /// resulting transition. An `Err` here means the stage did not reach
    /// a terminal interpretation and the claim should be retried or
    /// failed by the caller.
    async fn execute(&self, stage: QueueName, task: &Task, session_id: &str) -> Result<()> {
        let provider = task.origin.provider;
        let organization = task.origin.organization_id.clone();

        let checkout = self
            .cache
            .acquire(&task.id, provider, &organization, &task.target.repo)
            .await?;

        // Token for the subprocess's own git pushes, fetched just-in-time
        // and scoped to the child environment.
        let token = self.broker.get_token(provider, &organization).await;
        let env = match token {
            Ok(token) => vec![("MEND_GIT_TOKEN".to_string(), token.reveal().to_string())],
            Err(e) => {
                checkout.release().await;
                return Err(e);
            }
        };

        let cancel = self.lifecycle.cancels().subscribe(&task.id);
        Metrics::incr(&self.metrics.runner_invocations);

        let result = self
            .runner
            .run(RunnerInvocation {
                task,
                stage,
                session_id,
                workdir: &checkout.path,
                timeout: self.stage_timeout(stage),
                env,
                logs: self.lifecycle.logs(),
                cancel,
            })
            .await;

        checkout.release().await;
        let result = result?;
        Metrics::add(
            &self.metrics.runner_wall_time_millis,
            (result.usage.wall_time_seconds * 1000.0) as u64,
        );

        match result.outcome {
            ExecutionOutcome::Success => {
                match stage {
                    QueueName::Plan => {
                        self.lifecycle
                            .complete_planning(
                                &task.id,
                                result.plan_ref,
                                result.usage,
                                result.next_agent,
                            )
                            .await?;
                    }
                    QueueName::Execute => {
                        self.lifecycle
                            .complete_execution(&task.id, result.pr_ref, result.usage)
                            .await?;
                    }
                }
                Ok(())
            }
            ExecutionOutcome::Cancelled => {
                // The task already turned terminal; just close the record.
                Metrics::incr(&self.metrics.runner_cancellations);
                self.lifecycle
                    .store()
                    .finish_execution(
                        &task.id,
                        ExecutionOutcome::Cancelled,
                        result.usage,
                        None,
                        self.lifecycle.store().get(&task.id).await?.status,
                    )
                    .await?;
                Ok(())
            }
            ExecutionOutcome::Timeout => {
                Metrics::incr(&self.metrics.runner_timeouts);
                Err(MendError::SubprocessTimeout {
                    seconds: self.stage_timeout(stage).as_secs(),
                })
            }
            ExecutionOutcome::Failed => Err(MendError::SubprocessFailed {
                retryable: result.retryable,
                message: result
                    .failure_reason
                    .unwrap_or_else(|| "runner failed".to_string()),
            }),
        }
    }

    /// Nack with backoff; a dead-lettered nack fails the task instead.
    async fn retry_or_fail(
        &self,
        stage: QueueName,
        item: &QueueItem,
        outcome: ExecutionOutcome,
        reason: &str,
        record_open: bool,
    ) {
        let delay = backoff_delay(item.attempts + 1);
        match self
            .lifecycle
            .queue()
            .nack(stage, &item.task_id, &self.id, Some(delay))
            .await
        {
            Ok(NackOutcome::Requeued { attempts }) => {
                if record_open {
                    if let Err(e) = self
                        .lifecycle
                        .retry_stage(&item.task_id, stage, outcome, attempts, reason)
                        .await
                    {
                        warn!(task_id = %item.task_id, "retry_stage failed: {e}");
                    }
                }
            }
            Ok(NackOutcome::DeadLettered) => {
                if record_open {
                    let _ = self
                        .lifecycle
                        .store()
                        .finish_execution(
                            &item.task_id,
                            outcome,
                            UsageCounters::default(),
                            None,
                            crate::models::TaskStatus::Failed,
                        )
                        .await;
                }
                if let Err(e) = self
                    .lifecycle
                    .fail_max_retries(&item.task_id, Some(reason))
                    .await
                {
                    warn!(task_id = %item.task_id, "fail_max_retries failed: {e}");
                }
            }
            Err(e) => warn!(task_id = %item.task_id, "nack failed: {e}"),
        }
    }
}

fn outcome_for_error(error: &MendError) -> ExecutionOutcome {
    match error {
        MendError::SubprocessTimeout { .. } => ExecutionOutcome::Timeout,
        _ => ExecutionOutcome::Failed,
    }
}
