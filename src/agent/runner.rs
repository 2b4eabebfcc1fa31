use crate::{
    config::RunnerConfig,
    constants,
    logs::LogChannel,
    models::{ExecutionOutcome, QueueName, StreamTag, Task, UsageCounters},
    MendError, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Client for the LLM command-line tool.
///
/// The tool is an external collaborator: this client only composes the
/// invocation, streams its output line by line into the log channel,
/// enforces the deadline, and interprets the result envelope.
#[derive(Debug, Clone)]
pub struct RunnerClient {
    binary: String,
    base_args: Vec<String>,
    /// Window between the cooperative stop and the hard kill.
    grace: Duration,
}

/// Everything one invocation needs.
pub struct RunnerInvocation<'a> {
    pub task: &'a Task,
    pub stage: QueueName,
    pub session_id: &'a str,
    pub workdir: &'a Path,
    pub timeout: Duration,
    /// Extra environment for the child (git token, etc.).
    pub env: Vec<(String, String)>,
    pub logs: &'a Arc<LogChannel>,
    pub cancel: watch::Receiver<bool>,
}

/// Interpreted result of one invocation.
#[derive(Debug, Clone)]
pub struct RunnerResult {
    pub outcome: ExecutionOutcome,
    pub usage: UsageCounters,
    pub plan_ref: Option<String>,
    pub pr_ref: Option<String>,
    pub next_agent: Option<String>,
    /// Meaningful only for `Failed`.
    pub retryable: bool,
    pub exit_code: Option<i32>,
    pub failure_reason: Option<String>,
}

/// The well-delimited JSON object the tool prints as its last stdout
/// line on a clean finish.
#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    outcome: String,
    #[serde(default)]
    plan_ref: Option<String>,
    #[serde(default)]
    pr_ref: Option<String>,
    #[serde(default)]
    usage: Option<EnvelopeUsage>,
    #[serde(default)]
    next_agent: Option<String>,
    #[serde(default)]
    retryable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct EnvelopeUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cost_usd: f64,
}

/// What the subprocess reads about its task, written to a temp file
/// whose path is the final argument.
#[derive(Debug, Serialize)]
struct TaskDescriptor<'a> {
    task_id: &'a str,
    stage: QueueName,
    kind: crate::models::TaskKind,
    repo: &'a str,
    reference: Option<&'a str>,
    attempt: u32,
    /// Reviewer feedback from the improve loop, when present.
    feedback: Option<&'a str>,
    context: &'a std::collections::HashMap<String, String>,
}

impl RunnerClient {
    pub async fn new(config: &RunnerConfig) -> Result<Self> {
        let binary = match &config.binary {
            Some(path) => path.clone(),
            None => Self::find_binary().await?,
        };
        Ok(Self {
            binary,
            base_args: config.base_args.clone(),
            grace: Duration::from_secs(constants::CANCEL_GRACE_SECS),
        })
    }

    /// Stub runner for tests: any binary, short grace window.
    #[cfg(test)]
    pub fn stub(binary: &str, base_args: &[&str]) -> Self {
        Self {
            binary: binary.to_string(),
            base_args: base_args.iter().map(|s| s.to_string()).collect(),
            grace: Duration::from_millis(200),
        }
    }

    /// Locate the runner CLI across the usual install locations.
    async fn find_binary() -> Result<String> {
        let candidates = [
            "mend-runner",               // PATH search
            "claude",                    // LLM CLI on PATH
            "/usr/local/bin/claude",     // standard install
        ];

        for candidate in &candidates {
            match Command::new(candidate).arg("--help").output().await {
                Ok(output) if output.status.success() => {
                    info!("Found runner binary at: {}", candidate);
                    return Ok(candidate.to_string());
                }
                Ok(_) => debug!("Binary at {} exists but --help failed", candidate),
                Err(_) => debug!("No binary found at {}", candidate),
            }
        }

        Err(MendError::Configuration(
            "runner binary not found; set RUNNER_BINARY".to_string(),
        ))
    }

    /// Launch the subprocess and see it through to an outcome.
    ///
    /// Both stream readers run concurrently with the wait so a chatty
    /// tool can never fill a pipe and deadlock. On deadline or
    /// cancellation the child gets the grace window to exit before the
    /// hard kill.
    pub async fn run(&self, invocation: RunnerInvocation<'_>) -> Result<RunnerResult> {
        let descriptor_path = self.write_descriptor(&invocation).await?;
        let started = std::time::Instant::now();

        let mut command = Command::new(&self.binary);
        command
            .args(&self.base_args)
            .arg(&descriptor_path)
            .current_dir(invocation.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        debug!(
            task_id = %invocation.task.id,
            stage = %invocation.stage,
            "Launching runner: {} {:?}",
            self.binary,
            self.base_args
        );

        let mut child = command.spawn().map_err(|e| MendError::SubprocessFailed {
            retryable: false,
            message: format!("failed to spawn runner: {e}"),
        })?;

        let stdout = child.stdout.take().ok_or_else(|| MendError::SubprocessFailed {
            retryable: false,
            message: "runner stdout unavailable".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| MendError::SubprocessFailed {
            retryable: false,
            message: "runner stderr unavailable".to_string(),
        })?;

        // Tails kept for envelope parsing (stdout) and failure
        // classification (stderr).
        let stdout_tail = Arc::new(Mutex::new(VecDeque::new()));
        let stderr_tail = Arc::new(Mutex::new(VecDeque::new()));

        let stdout_task = tokio::spawn(stream_lines(
            stdout,
            StreamTag::Stdout,
            invocation.task.id.clone(),
            invocation.logs.clone(),
            stdout_tail.clone(),
        ));
        let stderr_task = tokio::spawn(stream_lines(
            stderr,
            StreamTag::Stderr,
            invocation.task.id.clone(),
            invocation.logs.clone(),
            stderr_tail.clone(),
        ));

        let mut cancel = invocation.cancel.clone();
        let deadline = tokio::time::sleep(invocation.timeout);
        tokio::pin!(deadline);

        enum Ending {
            Exited(std::process::ExitStatus),
            TimedOut,
            Cancelled,
        }

        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status.map_err(|e| MendError::SubprocessFailed {
                retryable: true,
                message: format!("runner wait failed: {e}"),
            })?),
            _ = &mut deadline => Ending::TimedOut,
            _ = wait_cancelled(&mut cancel) => Ending::Cancelled,
        };

        let ending = match ending {
            Ending::Exited(status) => Ending::Exited(status),
            other => {
                // Escalation: grace window for a voluntary exit, then the
                // hard kill.
                let graced = tokio::time::timeout(self.grace, child.wait()).await;
                if graced.is_err() {
                    warn!(task_id = %invocation.task.id, "Runner ignored grace window, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
                other
            }
        };

        // Readers drain to EOF once the child is gone.
        let _ = stdout_task.await;
        let _ = stderr_task.await;
        let _ = tokio::fs::remove_file(&descriptor_path).await;

        let wall = started.elapsed().as_secs_f64();
        let stdout_tail = stdout_tail.lock().await.iter().cloned().collect::<Vec<_>>();
        let stderr_tail = stderr_tail.lock().await.iter().cloned().collect::<Vec<_>>();

        match ending {
            Ending::TimedOut => {
                invocation
                    .logs
                    .append(
                        &invocation.task.id,
                        StreamTag::System,
                        &format!("runner timed out after {}s", invocation.timeout.as_secs()),
                    )
                    .await?;
                Ok(RunnerResult {
                    outcome: ExecutionOutcome::Timeout,
                    usage: UsageCounters {
                        wall_time_seconds: wall,
                        ..Default::default()
                    },
                    plan_ref: None,
                    pr_ref: None,
                    next_agent: None,
                    retryable: true,
                    exit_code: None,
                    failure_reason: Some("timeout".to_string()),
                })
            }
            Ending::Cancelled => {
                invocation
                    .logs
                    .append(&invocation.task.id, StreamTag::System, "runner cancelled")
                    .await?;
                Ok(RunnerResult {
                    outcome: ExecutionOutcome::Cancelled,
                    usage: UsageCounters {
                        wall_time_seconds: wall,
                        ..Default::default()
                    },
                    plan_ref: None,
                    pr_ref: None,
                    next_agent: None,
                    retryable: false,
                    exit_code: None,
                    failure_reason: Some("cancelled".to_string()),
                })
            }
            Ending::Exited(status) => {
                Ok(interpret_exit(status.code(), &stdout_tail, &stderr_tail, wall))
            }
        }
    }

    async fn write_descriptor(&self, invocation: &RunnerInvocation<'_>) -> Result<PathBuf> {
        let descriptor = TaskDescriptor {
            task_id: &invocation.task.id,
            stage: invocation.stage,
            kind: invocation.task.kind,
            repo: &invocation.task.target.repo,
            reference: invocation.task.target.reference.as_deref(),
            attempt: invocation.task.attempts,
            feedback: invocation.task.feedback.as_deref(),
            context: &invocation.task.context,
        };
        let path = std::env::temp_dir().join(format!(
            "mend-task-{}-{}.json",
            invocation.task.id, invocation.session_id
        ));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&descriptor)?).await?;
        Ok(path)
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone; nobody can cancel anymore.
            std::future::pending::<()>().await;
        }
    }
}

/// Read one subprocess stream line by line into the log channel,
/// keeping a bounded tail for post-exit interpretation.
async fn stream_lines<R: AsyncRead + Unpin>(
    stream: R,
    tag: StreamTag,
    task_id: String,
    logs: Arc<LogChannel>,
    tail: Arc<Mutex<VecDeque<String>>>,
) {
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Err(e) = logs.append(&task_id, tag, &line).await {
                    warn!(task_id, "log append failed: {e}");
                }
                let mut tail = tail.lock().await;
                if tail.len() >= constants::ENVELOPE_SCAN_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(task_id, "stream read failed: {e}");
                break;
            }
        }
    }
}

/// Classify a normal exit: envelope first, exit code second.
fn interpret_exit(
    exit_code: Option<i32>,
    stdout_tail: &[String],
    stderr_tail: &[String],
    wall: f64,
) -> RunnerResult {
    let envelope = stdout_tail
        .iter()
        .rev()
        .filter(|line| line.trim_start().starts_with('{'))
        .find_map(|line| serde_json::from_str::<ResultEnvelope>(line.trim()).ok());

    let mut usage = UsageCounters {
        wall_time_seconds: wall,
        ..Default::default()
    };

    if let Some(envelope) = envelope {
        if let Some(env_usage) = &envelope.usage {
            usage.input_tokens = env_usage.input_tokens;
            usage.output_tokens = env_usage.output_tokens;
            usage.cost_usd = env_usage.cost_usd;
        }
        let success = envelope.outcome.eq_ignore_ascii_case("success");
        return RunnerResult {
            outcome: if success {
                ExecutionOutcome::Success
            } else {
                ExecutionOutcome::Failed
            },
            usage,
            plan_ref: envelope.plan_ref,
            pr_ref: envelope.pr_ref,
            next_agent: envelope.next_agent,
            retryable: envelope.retryable.unwrap_or(!success),
            exit_code,
            failure_reason: (!success).then(|| format!("runner reported {}", envelope.outcome)),
        };
    }

    match exit_code {
        Some(0) => RunnerResult {
            outcome: ExecutionOutcome::Success,
            usage,
            plan_ref: None,
            pr_ref: None,
            next_agent: None,
            retryable: false,
            exit_code,
            failure_reason: None,
        },
        code => {
            // sysexits-style usage/config failures are configuration
            // problems; retrying cannot fix them.
            let fatal = matches!(code, Some(64) | Some(78))
                || stderr_tail
                    .iter()
                    .any(|l| l.contains("misconfigured") || l.contains("invalid credentials"));
            RunnerResult {
                outcome: ExecutionOutcome::Failed,
                usage,
                plan_ref: None,
                pr_ref: None,
                next_agent: None,
                retryable: !fatal,
                exit_code: code,
                failure_reason: Some(match code {
                    Some(c) => format!("runner exited with code {c}"),
                    None => "runner killed by signal".to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;
    use crate::models::{Origin, Priority, Provider, Target, TaskKind};

    fn sample_task() -> Task {
        let origin = Origin {
            provider: Provider::IssueTracker,
            organization_id: "acme".to_string(),
            event_id: "ev-1".to_string(),
            actor: None,
        };
        let target = Target::new("acme/widgets");
        let fingerprint = ids::fingerprint(&origin, &target);
        Task::new(
            "t-runner".to_string(),
            fingerprint,
            origin,
            target,
            TaskKind::Fix,
            Priority::Normal,
        )
    }

    fn shell_runner(script: &str) -> RunnerClient {
        RunnerClient {
            binary: "sh".to_string(),
            base_args: vec!["-c".to_string(), script.to_string(), "runner".to_string()],
            grace: Duration::from_millis(200),
        }
    }

    fn invocation<'a>(
        task: &'a Task,
        workdir: &'a Path,
        logs: &'a Arc<LogChannel>,
        cancel: watch::Receiver<bool>,
        timeout: Duration,
    ) -> RunnerInvocation<'a> {
        RunnerInvocation {
            task,
            stage: QueueName::Plan,
            session_id: "s-1",
            workdir,
            timeout,
            env: Vec::new(),
            logs,
            cancel,
        }
    }

    #[tokio::test]
    async fn success_envelope_is_parsed_and_streamed() {
        let task = sample_task();
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (_tx, rx) = watch::channel(false);

        let script = r#"echo "working on it"; echo '{"outcome":"success","plan_ref":"PR#17","usage":{"input_tokens":120,"output_tokens":40,"cost_usd":0.02}}'"#;
        let result = shell_runner(script)
            .run(invocation(&task, dir.path(), &logs, rx, Duration::from_secs(30)))
            .await
            .unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::Success);
        assert_eq!(result.plan_ref.as_deref(), Some("PR#17"));
        assert_eq!(result.usage.input_tokens, 120);
        assert_eq!(result.usage.output_tokens, 40);

        let page = logs.read(&task.id, 0, 100).await.unwrap();
        assert!(page
            .entries
            .iter()
            .any(|e| e.stream == StreamTag::Stdout && e.message == "working on it"));
    }

    #[tokio::test]
    async fn stderr_is_tagged_separately() {
        let task = sample_task();
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (_tx, rx) = watch::channel(false);

        let script = r#"echo "to stderr" 1>&2; exit 0"#;
        let result = shell_runner(script)
            .run(invocation(&task, dir.path(), &logs, rx, Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Success);

        let page = logs.read(&task.id, 0, 100).await.unwrap();
        assert!(page
            .entries
            .iter()
            .any(|e| e.stream == StreamTag::Stderr && e.message == "to stderr"));
    }

    #[tokio::test]
    async fn nonzero_exit_without_envelope_is_retryable_failure() {
        let task = sample_task();
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (_tx, rx) = watch::channel(false);

        let result = shell_runner("exit 3")
            .run(invocation(&task, dir.path(), &logs, rx, Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Failed);
        assert!(result.retryable);
        assert_eq!(result.exit_code, Some(3));
    }

    #[tokio::test]
    async fn usage_exit_code_is_fatal() {
        let task = sample_task();
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (_tx, rx) = watch::channel(false);

        let result = shell_runner("exit 78")
            .run(invocation(&task, dir.path(), &logs, rx, Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Failed);
        assert!(!result.retryable);
    }

    #[tokio::test]
    async fn deadline_produces_timeout_outcome() {
        let task = sample_task();
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (_tx, rx) = watch::channel(false);

        let result = shell_runner("sleep 30")
            .run(invocation(&task, dir.path(), &logs, rx, Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Timeout);
        assert!(result.retryable);
    }

    #[tokio::test]
    async fn cancellation_produces_cancelled_outcome() {
        let task = sample_task();
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (tx, rx) = watch::channel(false);

        let runner = shell_runner("sleep 30");
        let logs_clone = logs.clone();
        let handle = {
            let task = task.clone();
            let dir_path = dir.path().to_path_buf();
            tokio::spawn(async move {
                runner
                    .run(RunnerInvocation {
                        task: &task,
                        stage: QueueName::Plan,
                        session_id: "s-1",
                        workdir: &dir_path,
                        timeout: Duration::from_secs(60),
                        env: Vec::new(),
                        logs: &logs_clone,
                        cancel: rx,
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn descriptor_carries_feedback_to_the_tool() {
        let mut task = sample_task();
        task.feedback = Some("focus only on module X".to_string());
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (_tx, rx) = watch::channel(false);

        // The stub prints the descriptor file back to stdout.
        let result = shell_runner("cat \"$1\"")
            .run(invocation(&task, dir.path(), &logs, rx, Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Success);

        let page = logs.read(&task.id, 0, 200).await.unwrap();
        let dumped: String = page
            .entries
            .iter()
            .filter(|e| e.stream == StreamTag::Stdout)
            .map(|e| e.message.clone())
            .collect::<Vec<_>>()
            .join("\n");
        assert!(dumped.contains("focus only on module X"));
        assert!(dumped.contains("t-runner"));
    }

    #[tokio::test]
    async fn timeout_escalates_to_kill_after_grace() {
        // A child that ignores the grace window is killed and the result
        // is still the timeout outcome.
        let task = sample_task();
        let dir = tempfile::tempdir().unwrap();
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (_tx, rx) = watch::channel(false);

        let result = shell_runner("sleep 1; exit 0")
            .run(invocation(&task, dir.path(), &logs, rx, Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Timeout);
    }
}
