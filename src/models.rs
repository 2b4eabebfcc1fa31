use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, str::FromStr};

/// External provider a tenant installation belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Provider {
    CodeHost,
    IssueTracker,
    Chat,
    ErrorReporter,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provider::CodeHost => "code-host",
            Provider::IssueTracker => "issue-tracker",
            Provider::Chat => "chat",
            Provider::ErrorReporter => "error-reporter",
        };
        f.write_str(s)
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code-host" => Ok(Provider::CodeHost),
            "issue-tracker" => Ok(Provider::IssueTracker),
            "chat" => Ok(Provider::Chat),
            "error-reporter" => Ok(Provider::ErrorReporter),
            _ => Err(format!("Unknown provider: {s}")),
        }
    }
}

/// A tenant on one provider, holding token references and the webhook
/// secret. `(provider, organization_id)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Installation {
    pub provider: Provider,
    pub organization_id: String,
    pub display_name: String,
    pub access_token_ref: String,
    pub refresh_token_ref: Option<String>,
    pub scopes: Vec<String>,
    /// Opaque secret bytes used to verify inbound webhook signatures.
    /// Skipped on serialization so it can never leak through the read API.
    #[serde(skip_serializing)]
    pub webhook_secret: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// What kind of work a task performs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Enrich,
    Fix,
    Approve,
    Improve,
    Review,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::Enrich => "enrich",
            TaskKind::Fix => "fix",
            TaskKind::Approve => "approve",
            TaskKind::Improve => "improve",
            TaskKind::Review => "review",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "enrich" => Ok(TaskKind::Enrich),
            "fix" => Ok(TaskKind::Fix),
            "approve" => Ok(TaskKind::Approve),
            "improve" => Ok(TaskKind::Improve),
            "review" => Ok(TaskKind::Review),
            _ => Err(format!("Unknown task kind: {s}")),
        }
    }
}

/// Task priority; higher dequeues first, ties broken FIFO.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            _ => Err(format!("Unknown priority: {s}")),
        }
    }
}

/// Task lifecycle status. Legal transitions are enforced by the
/// `lifecycle` module; the store only persists what the state machine
/// hands it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Queued,
    Planning,
    AwaitingApproval,
    Approved,
    Executing,
    Completed,
    Rejected,
    Failed,
    Deduplicated,
}

impl TaskStatus {
    /// Terminal statuses never transition again; a new task with the same
    /// fingerprint may be created once the previous one is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed
                | TaskStatus::Rejected
                | TaskStatus::Failed
                | TaskStatus::Deduplicated
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Planning => "planning",
            TaskStatus::AwaitingApproval => "awaiting-approval",
            TaskStatus::Approved => "approved",
            TaskStatus::Executing => "executing",
            TaskStatus::Completed => "completed",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Failed => "failed",
            TaskStatus::Deduplicated => "deduplicated",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "planning" => Ok(TaskStatus::Planning),
            "awaiting-approval" => Ok(TaskStatus::AwaitingApproval),
            "approved" => Ok(TaskStatus::Approved),
            "executing" => Ok(TaskStatus::Executing),
            "completed" => Ok(TaskStatus::Completed),
            "rejected" => Ok(TaskStatus::Rejected),
            "failed" => Ok(TaskStatus::Failed),
            "deduplicated" => Ok(TaskStatus::Deduplicated),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// Where a task came from: the provider plus the provider-side event id.
/// Together with the target this feeds the dedup fingerprint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Origin {
    pub provider: Provider,
    pub organization_id: String,
    pub event_id: String,
    /// Human identity that triggered the event, for loop prevention and
    /// audit. Bot identities are filtered before a task is created.
    pub actor: Option<String>,
}

/// What the task operates on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Target {
    /// `owner/name` form.
    pub repo: String,
    /// Optional PR/issue reference on the code host, e.g. `PR#17`.
    pub reference: Option<String>,
}

impl Target {
    pub fn new(repo: impl Into<String>) -> Self {
        Self {
            repo: repo.into(),
            reference: None,
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }
}

/// Cost and usage counters emitted by the runner subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageCounters {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub wall_time_seconds: f64,
}

impl UsageCounters {
    pub fn accumulate(&mut self, other: &UsageCounters) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
        self.wall_time_seconds += other.wall_time_seconds;
    }
}

/// The fundamental unit of work.
///
/// Tasks are created by the webhook dispatcher or the command router,
/// owned by the store, and mutated only through the state machine. The
/// `version` field backs optimistic concurrency: every successful update
/// bumps it, and stale writers get a version conflict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub fingerprint: String,
    pub origin: Origin,
    pub target: Target,
    pub kind: TaskKind,
    pub priority: Priority,
    pub status: TaskStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Plan artifact reference produced by the planning stage.
    pub plan_ref: Option<String>,
    /// PR reference produced by the execution stage.
    pub pr_ref: Option<String>,
    /// Reviewer feedback attached by the `improve` command; surfaced to
    /// the runner through the task descriptor on the next planning pass.
    pub feedback: Option<String>,
    pub usage: UsageCounters,
    pub context: HashMap<String, String>,
    pub version: u64,
}

impl Task {
    pub fn new(
        id: String,
        fingerprint: String,
        origin: Origin,
        target: Target,
        kind: TaskKind,
        priority: Priority,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            fingerprint,
            origin,
            target,
            kind,
            priority,
            status: TaskStatus::Queued,
            created_at: now,
            updated_at: now,
            attempts: 0,
            last_error: None,
            plan_ref: None,
            pr_ref: None,
            feedback: None,
            usage: UsageCounters::default(),
            context: HashMap::new(),
            version: 0,
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// The two pipeline stages, each backed by a named queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueueName {
    Plan,
    Execute,
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueName::Plan => f.write_str("plan"),
            QueueName::Execute => f.write_str("execute"),
        }
    }
}

/// Which subprocess stream a log line came from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamTag {
    Stdout,
    Stderr,
    System,
}

/// One line of per-task output history. Sequence numbers are contiguous
/// and strictly monotonic per task up to the truncation point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub stream: StreamTag,
    pub message: String,
}

/// Outcome of one runner invocation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionOutcome {
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionOutcome::Success => "success",
            ExecutionOutcome::Failed => "failed",
            ExecutionOutcome::Timeout => "timeout",
            ExecutionOutcome::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One link of a task's ordered execution chain. Only the last record may
/// be non-terminal (`finished_at == None`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub task_id: String,
    pub agent: String,
    pub session_id: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub outcome: Option<ExecutionOutcome>,
    pub usage: UsageCounters,
    pub next_agent_hint: Option<String>,
    pub status_before: TaskStatus,
    pub status_after: Option<TaskStatus>,
}

/// Declared metadata for the planning and execution agents, exposed by
/// `GET /agents`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub stage: QueueName,
    pub description: String,
}

pub fn declared_agents() -> Vec<AgentInfo> {
    vec![
        AgentInfo {
            name: "planner".to_string(),
            stage: QueueName::Plan,
            description: "Produces a fix plan awaiting human approval".to_string(),
        },
        AgentInfo {
            name: "executor".to_string(),
            stage: QueueName::Execute,
            description: "Realizes an approved plan and opens a pull request".to_string(),
        },
    ]
}
