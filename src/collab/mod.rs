//! Narrow interfaces to the external collaboration surfaces.
//!
//! The core asks these traits for exactly what the pipeline needs;
//! provider-specific REST clients implement them out of tree. The
//! logging implementations shipped here write to the process log and
//! keep a bounded outbox so operators (and tests) can inspect what
//! would have been sent.

use crate::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Outbound operations against the code host.
#[async_trait]
pub trait CodeHostClient: Send + Sync {
    /// Comment on a PR or issue, identified by `owner/name` + reference.
    async fn post_comment(&self, repo: &str, reference: &str, body: &str) -> Result<()>;

    /// Publish a plan artifact for human review.
    async fn post_plan(&self, repo: &str, reference: Option<&str>, plan_ref: &str) -> Result<()>;

    async fn ci_status(&self, repo: &str, reference: &str) -> Result<String>;

    async fn ci_logs(&self, repo: &str, reference: &str) -> Result<String>;

    async fn retry_ci(&self, repo: &str, reference: &str) -> Result<()>;
}

/// Outbound notifications to the chat surface.
#[async_trait]
pub trait ChatNotifier: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Outbound operations against the issue tracker.
#[async_trait]
pub trait IssueTrackerClient: Send + Sync {
    async fn comment(&self, ticket: &str, body: &str) -> Result<()>;
}

/// Everything the lifecycle fan-out needs, bundled.
#[derive(Clone)]
pub struct Collaborators {
    pub code_host: Arc<dyn CodeHostClient>,
    pub chat: Arc<dyn ChatNotifier>,
    pub issue_tracker: Arc<dyn IssueTrackerClient>,
}

impl Collaborators {
    /// Logging stand-ins for every surface; the default for `serve`
    /// until real clients are wired in.
    pub fn logging() -> (Self, Arc<Outbox>) {
        let outbox = Arc::new(Outbox::new(256));
        let collaborators = Self {
            code_host: Arc::new(LoggingCodeHost {
                outbox: outbox.clone(),
            }),
            chat: Arc::new(LoggingChat {
                outbox: outbox.clone(),
            }),
            issue_tracker: Arc::new(LoggingIssueTracker {
                outbox: outbox.clone(),
            }),
        };
        (collaborators, outbox)
    }
}

/// Bounded record of outbound messages.
pub struct Outbox {
    entries: Mutex<VecDeque<OutboxEntry>>,
    cap: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry {
    pub surface: &'static str,
    pub destination: String,
    pub body: String,
}

impl Outbox {
    fn new(cap: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            cap,
        }
    }

    async fn push(&self, entry: OutboxEntry) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.cap {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub async fn drain(&self) -> Vec<OutboxEntry> {
        let mut entries = self.entries.lock().await;
        entries.drain(..).collect()
    }

    pub async fn snapshot(&self) -> Vec<OutboxEntry> {
        let entries = self.entries.lock().await;
        entries.iter().cloned().collect()
    }
}

struct LoggingCodeHost {
    outbox: Arc<Outbox>,
}

#[async_trait]
impl CodeHostClient for LoggingCodeHost {
    async fn post_comment(&self, repo: &str, reference: &str, body: &str) -> Result<()> {
        info!(repo, reference, "code-host comment: {}", body);
        self.outbox
            .push(OutboxEntry {
                surface: "code-host",
                destination: format!("{repo}#{reference}"),
                body: body.to_string(),
            })
            .await;
        Ok(())
    }

    async fn post_plan(&self, repo: &str, reference: Option<&str>, plan_ref: &str) -> Result<()> {
        info!(repo, ?reference, plan_ref, "code-host plan posted");
        self.outbox
            .push(OutboxEntry {
                surface: "code-host",
                destination: repo.to_string(),
                body: format!("plan: {plan_ref}"),
            })
            .await;
        Ok(())
    }

    async fn ci_status(&self, repo: &str, reference: &str) -> Result<String> {
        info!(repo, reference, "code-host ci-status requested");
        Ok("unknown (no code-host client configured)".to_string())
    }

    async fn ci_logs(&self, repo: &str, reference: &str) -> Result<String> {
        info!(repo, reference, "code-host ci-logs requested");
        Ok("no logs (no code-host client configured)".to_string())
    }

    async fn retry_ci(&self, repo: &str, reference: &str) -> Result<()> {
        info!(repo, reference, "code-host retry-ci requested");
        Ok(())
    }
}

struct LoggingChat {
    outbox: Arc<Outbox>,
}

#[async_trait]
impl ChatNotifier for LoggingChat {
    async fn notify(&self, message: &str) -> Result<()> {
        info!("chat notification: {}", message);
        self.outbox
            .push(OutboxEntry {
                surface: "chat",
                destination: String::new(),
                body: message.to_string(),
            })
            .await;
        Ok(())
    }
}

struct LoggingIssueTracker {
    outbox: Arc<Outbox>,
}

#[async_trait]
impl IssueTrackerClient for LoggingIssueTracker {
    async fn comment(&self, ticket: &str, body: &str) -> Result<()> {
        info!(ticket, "issue-tracker comment: {}", body);
        self.outbox
            .push(OutboxEntry {
                surface: "issue-tracker",
                destination: ticket.to_string(),
                body: body.to_string(),
            })
            .await;
        Ok(())
    }
}
