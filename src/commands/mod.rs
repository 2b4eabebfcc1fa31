use crate::{
    lifecycle::TaskLifecycle,
    models::{Origin, Priority, Provider, Target, TaskKind, TaskStatus},
    monitoring::Metrics,
    store::TaskFilter,
    MendError, Result,
};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// Canonical commands recognized in free-form comment/chat text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Approve,
    Reject,
    Improve,
    Status,
    Help,
    CiStatus,
    CiLogs,
    RetryCi,
    /// `ask` / `explain` / `find` / `discover`: read-only review task.
    Ask,
    Unknown(String),
}

impl CommandKind {
    fn from_word(word: &str) -> Option<Self> {
        match word.to_lowercase().as_str() {
            "approve" | "lgtm" | "ship-it" | "shipit" | "go" => Some(CommandKind::Approve),
            "reject" | "no" | "stop" | "cancel" => Some(CommandKind::Reject),
            "improve" => Some(CommandKind::Improve),
            "status" => Some(CommandKind::Status),
            "help" => Some(CommandKind::Help),
            "ci-status" => Some(CommandKind::CiStatus),
            "ci-logs" => Some(CommandKind::CiLogs),
            "retry-ci" => Some(CommandKind::RetryCi),
            "ask" | "explain" | "find" | "discover" => Some(CommandKind::Ask),
            _ => None,
        }
    }

    fn usage(&self) -> &'static str {
        match self {
            CommandKind::Approve => "approve - execute the posted plan (aliases: lgtm, ship-it, go)",
            CommandKind::Reject => "reject [note] - discard the plan (aliases: no, stop, cancel)",
            CommandKind::Improve => "improve <feedback> - send the plan back with guidance",
            CommandKind::Status => "status - show the task's current state",
            CommandKind::Help => "help [command] - show usage",
            CommandKind::CiStatus => "ci-status - show CI state for this PR",
            CommandKind::CiLogs => "ci-logs - fetch CI logs for this PR",
            CommandKind::RetryCi => "retry-ci - re-run CI for this PR",
            CommandKind::Ask => "ask <question> - open a read-only review task",
            CommandKind::Unknown(_) => "",
        }
    }
}

/// Which collaboration surface the text arrived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    CodeHost,
    Chat,
    IssueTracker,
}

/// Everything the router needs to act on a parsed command.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub surface: Surface,
    pub provider: Provider,
    pub organization_id: String,
    /// Provider-side id of the comment/message carrying the command.
    pub event_id: String,
    pub actor: String,
    pub repo: Option<String>,
    /// The PR/ticket the text was posted on, when there is one.
    pub reference: Option<String>,
    /// Explicit task id, when the surface already knows it.
    pub task_id: Option<String>,
}

/// A parsed command plus its free-text argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: CommandKind,
    pub args: String,
}

/// What the router sends back to the originating surface.
#[derive(Debug, Clone)]
pub struct CommandReply {
    pub message: String,
    pub task_id: Option<String>,
}

/// Tokenizer for `@agent <command> [args]` text.
///
/// A leading mention is optional: bare `approve` works in chat, while a
/// mention with an unknown word still earns a help reply. Text with
/// neither a mention nor a known leading command is not addressed to us.
pub struct CommandParser {
    mention: Regex,
}

impl Default for CommandParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandParser {
    pub fn new() -> Self {
        Self {
            mention: Regex::new(r"^@[\w-]+\s*").expect("static mention pattern"),
        }
    }

    pub fn parse(&self, text: &str) -> Option<ParsedCommand> {
        let trimmed = text.trim();
        let (mentioned, rest) = match self.mention.find(trimmed) {
            Some(m) => (true, trimmed[m.end()..].trim_start()),
            None => (false, trimmed),
        };

        let (word, args) = match rest.split_once(char::is_whitespace) {
            Some((word, args)) => (word, args.trim()),
            None => (rest, ""),
        };
        if word.is_empty() {
            return None;
        }

        match CommandKind::from_word(word) {
            Some(kind) => Some(ParsedCommand {
                kind,
                args: args.to_string(),
            }),
            None if mentioned => Some(ParsedCommand {
                kind: CommandKind::Unknown(word.to_string()),
                args: args.to_string(),
            }),
            None => None,
        }
    }
}

fn surface_supports(kind: &CommandKind, surface: Surface) -> bool {
    match kind {
        // Approval-gate commands need a human-reviewable surface.
        CommandKind::Approve | CommandKind::Reject | CommandKind::Improve => {
            matches!(surface, Surface::CodeHost | Surface::Chat)
        }
        CommandKind::CiStatus | CommandKind::CiLogs | CommandKind::RetryCi => {
            matches!(surface, Surface::CodeHost | Surface::Chat)
        }
        CommandKind::Status | CommandKind::Help | CommandKind::Ask | CommandKind::Unknown(_) => {
            true
        }
    }
}

fn help_text() -> String {
    let commands = [
        CommandKind::Approve,
        CommandKind::Reject,
        CommandKind::Improve,
        CommandKind::Status,
        CommandKind::CiStatus,
        CommandKind::CiLogs,
        CommandKind::RetryCi,
        CommandKind::Ask,
        CommandKind::Help,
    ];
    let mut out = String::from("Available commands:\n");
    for cmd in commands {
        out.push_str("  ");
        out.push_str(cmd.usage());
        out.push('\n');
    }
    out
}

/// Routes parsed commands into lifecycle transitions and collaborator
/// calls. User-facing failures (`no-task-in-context`,
/// `unsupported-surface`, `illegal-transition`) come back as replies so
/// the surface always gets an answer; only internal faults are errors.
pub struct CommandRouter {
    lifecycle: Arc<TaskLifecycle>,
    metrics: Arc<Metrics>,
    parser: CommandParser,
}

impl CommandRouter {
    pub fn new(lifecycle: Arc<TaskLifecycle>, metrics: Arc<Metrics>) -> Self {
        Self {
            lifecycle,
            metrics,
            parser: CommandParser::new(),
        }
    }

    /// Parse and dispatch. `Ok(None)` means the text was not a command.
    pub async fn dispatch(
        &self,
        text: &str,
        ctx: &CommandContext,
    ) -> Result<Option<CommandReply>> {
        let Some(parsed) = self.parser.parse(text) else {
            return Ok(None);
        };
        debug!(actor = %ctx.actor, command = ?parsed.kind, "Command received");
        Metrics::incr(&self.metrics.commands_parsed);

        if let CommandKind::Unknown(word) = &parsed.kind {
            Metrics::incr(&self.metrics.commands_unknown);
            return Ok(Some(CommandReply {
                message: format!("Unknown command `{word}`.\n{}", help_text()),
                task_id: None,
            }));
        }

        if !surface_supports(&parsed.kind, ctx.surface) {
            return Ok(Some(CommandReply {
                message: "unsupported-surface: this command cannot be used from here".to_string(),
                task_id: None,
            }));
        }

        match parsed.kind {
            CommandKind::Approve => self.approve(ctx).await,
            CommandKind::Reject => self.reject(ctx, &parsed.args).await,
            CommandKind::Improve => self.improve(ctx, &parsed.args).await,
            CommandKind::Status => self.status(ctx).await,
            CommandKind::Help => Ok(Some(CommandReply {
                message: match CommandKind::from_word(parsed.args.trim()) {
                    Some(kind) if !parsed.args.trim().is_empty() => kind.usage().to_string(),
                    _ => help_text(),
                },
                task_id: None,
            })),
            CommandKind::CiStatus => self.ci(ctx, CiAction::Status).await,
            CommandKind::CiLogs => self.ci(ctx, CiAction::Logs).await,
            CommandKind::RetryCi => self.ci(ctx, CiAction::Retry).await,
            CommandKind::Ask => self.ask(ctx, &parsed.args).await,
            CommandKind::Unknown(_) => unreachable!("handled above"),
        }
    }

    /// Find the live task this surface context refers to: an explicit id
    /// wins, otherwise match the repo + PR/ticket reference against
    /// non-terminal tasks (their target or posted plan artifact).
    async fn resolve_task(&self, ctx: &CommandContext) -> Result<Option<String>> {
        if let Some(task_id) = &ctx.task_id {
            return Ok(Some(task_id.clone()));
        }
        let (Some(repo), Some(reference)) = (&ctx.repo, &ctx.reference) else {
            return Ok(None);
        };

        let page = self
            .lifecycle
            .store()
            .list(&TaskFilter::default(), None, 500)
            .await?;
        Ok(page
            .tasks
            .into_iter()
            .find(|t| {
                !t.status.is_terminal()
                    && t.target.repo == *repo
                    && (t.target.reference.as_deref() == Some(reference.as_str())
                        || t.plan_ref.as_deref() == Some(reference.as_str()))
            })
            .map(|t| t.id))
    }

    async fn require_task(&self, ctx: &CommandContext) -> Result<std::result::Result<String, CommandReply>> {
        match self.resolve_task(ctx).await? {
            Some(task_id) => Ok(Ok(task_id)),
            None => Ok(Err(CommandReply {
                message: "no-task-in-context: could not resolve a task for this surface"
                    .to_string(),
                task_id: None,
            })),
        }
    }

    async fn approve(&self, ctx: &CommandContext) -> Result<Option<CommandReply>> {
        let task_id = match self.require_task(ctx).await? {
            Ok(id) => id,
            Err(reply) => return Ok(Some(reply)),
        };
        match self.lifecycle.approve(&task_id, &ctx.actor).await {
            Ok(task) => Ok(Some(CommandReply {
                message: format!("Approved. Task {} queued for execution.", task.id),
                task_id: Some(task.id),
            })),
            Err(MendError::IllegalTransition { from, .. }) => Ok(Some(CommandReply {
                message: format!("illegal-transition: cannot approve a task in `{from}`"),
                task_id: Some(task_id),
            })),
            Err(e) => Err(e),
        }
    }

    async fn reject(&self, ctx: &CommandContext, note: &str) -> Result<Option<CommandReply>> {
        let task_id = match self.require_task(ctx).await? {
            Ok(id) => id,
            Err(reply) => return Ok(Some(reply)),
        };
        let note = (!note.is_empty()).then_some(note);
        match self.lifecycle.reject(&task_id, &ctx.actor, note).await {
            Ok(task) => Ok(Some(CommandReply {
                message: format!("Rejected. Task {} will not be executed.", task.id),
                task_id: Some(task.id),
            })),
            Err(MendError::IllegalTransition { from, .. }) => Ok(Some(CommandReply {
                message: format!("illegal-transition: cannot reject a task in `{from}`"),
                task_id: Some(task_id),
            })),
            Err(e) => Err(e),
        }
    }

    async fn improve(&self, ctx: &CommandContext, feedback: &str) -> Result<Option<CommandReply>> {
        if feedback.trim().is_empty() {
            return Ok(Some(CommandReply {
                message: format!("Usage: {}", CommandKind::Improve.usage()),
                task_id: None,
            }));
        }
        let task_id = match self.require_task(ctx).await? {
            Ok(id) => id,
            Err(reply) => return Ok(Some(reply)),
        };
        match self.lifecycle.improve(&task_id, &ctx.actor, feedback).await {
            Ok(task) => Ok(Some(CommandReply {
                message: format!("Task {} sent back to planning with your feedback.", task.id),
                task_id: Some(task.id),
            })),
            Err(MendError::IllegalTransition { from, .. }) => Ok(Some(CommandReply {
                message: format!("illegal-transition: cannot improve a task in `{from}`"),
                task_id: Some(task_id),
            })),
            Err(e) => Err(e),
        }
    }

    async fn status(&self, ctx: &CommandContext) -> Result<Option<CommandReply>> {
        let task_id = match self.require_task(ctx).await? {
            Ok(id) => id,
            Err(reply) => return Ok(Some(reply)),
        };
        let task = self.lifecycle.store().get(&task_id).await?;
        let mut message = format!(
            "Task {}: status={} kind={} target={} attempts={}",
            task.id, task.status, task.kind, task.target.repo, task.attempts
        );
        if let Some(plan) = &task.plan_ref {
            message.push_str(&format!(" plan={plan}"));
        }
        if let Some(pr) = &task.pr_ref {
            message.push_str(&format!(" pr={pr}"));
        }
        if task.status == TaskStatus::AwaitingApproval {
            message.push_str(" - reply `@agent approve` to execute");
        }
        Ok(Some(CommandReply {
            message,
            task_id: Some(task.id),
        }))
    }

    async fn ci(&self, ctx: &CommandContext, action: CiAction) -> Result<Option<CommandReply>> {
        let (Some(repo), Some(reference)) = (&ctx.repo, &ctx.reference) else {
            return Ok(Some(CommandReply {
                message: "no-task-in-context: CI commands need a PR context".to_string(),
                task_id: None,
            }));
        };
        let code_host = &self.lifecycle.collaborators().code_host;
        let message = match action {
            CiAction::Status => code_host.ci_status(repo, reference).await?,
            CiAction::Logs => code_host.ci_logs(repo, reference).await?,
            CiAction::Retry => {
                code_host.retry_ci(repo, reference).await?;
                format!("CI re-run requested for {repo}#{reference}")
            }
        };
        Ok(Some(CommandReply {
            message,
            task_id: None,
        }))
    }

    /// `ask`/`explain`/`find`/`discover`: a low-priority read-only
    /// review task through the ordinary planning queue.
    async fn ask(&self, ctx: &CommandContext, question: &str) -> Result<Option<CommandReply>> {
        if question.trim().is_empty() {
            return Ok(Some(CommandReply {
                message: format!("Usage: {}", CommandKind::Ask.usage()),
                task_id: None,
            }));
        }
        let Some(repo) = &ctx.repo else {
            return Ok(Some(CommandReply {
                message: "no-task-in-context: a repository is needed for review questions"
                    .to_string(),
                task_id: None,
            }));
        };

        let origin = Origin {
            provider: ctx.provider,
            organization_id: ctx.organization_id.clone(),
            event_id: ctx.event_id.clone(),
            actor: Some(ctx.actor.clone()),
        };
        let mut target = Target::new(repo.clone());
        if let Some(reference) = &ctx.reference {
            target = target.with_reference(reference.clone());
        }

        let created = self
            .lifecycle
            .create_task(origin, target, TaskKind::Review, Priority::Low)
            .await?;
        let created_task = created
            .task
            .with_context("question", question.to_string());
        // Persist the question on the freshly created task.
        let task_id = created_task.id.clone();
        if !created.deduplicated {
            let version = created_task.version;
            let _ = self
                .lifecycle
                .store()
                .compare_and_update(created_task, version)
                .await;
        }

        Ok(Some(CommandReply {
            message: format!("Opened review task {task_id} for your question."),
            task_id: Some(task_id),
        }))
    }
}

enum CiAction {
    Status,
    Logs,
    Retry,
}
