use crate::{
    constants,
    models::{
        ExecutionOutcome, ExecutionRecord, Installation, Provider, Task, TaskStatus, UsageCounters,
    },
    MendError, Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Filter for task listing; all fields are conjunctive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub provider: Option<Provider>,
    pub actor: Option<String>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
}

/// One page of a cursored listing, ordered by `updated_at` descending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub tasks: Vec<Task>,
    pub next_cursor: Option<String>,
}

/// Authoritative task persistence.
///
/// The store is the single source of truth for status. It never decides
/// transitions itself; the lifecycle module hands it fully-formed tasks
/// and the store only enforces versioning and the fingerprint invariant
/// (at most one non-terminal task per fingerprint).
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new task. Rejects a second non-terminal task with the
    /// same fingerprint with `Duplicate`.
    async fn put(&self, task: Task) -> Result<()>;

    async fn get(&self, task_id: &str) -> Result<Task>;

    /// Check-and-set update: succeeds only when the stored version equals
    /// `expected_version`, then stores the task with the version bumped
    /// and `updated_at` refreshed. Returns the stored task.
    async fn compare_and_update(&self, task: Task, expected_version: u64) -> Result<Task>;

    async fn find_active_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Task>>;

    async fn list(
        &self,
        filter: &TaskFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<TaskPage>;

    /// Append a new (open) execution record to the task's chain.
    async fn record_execution(&self, record: ExecutionRecord) -> Result<()>;

    /// Close the task's last open execution record.
    async fn finish_execution(
        &self,
        task_id: &str,
        outcome: ExecutionOutcome,
        usage: UsageCounters,
        next_agent_hint: Option<String>,
        status_after: TaskStatus,
    ) -> Result<()>;

    async fn executions(&self, task_id: &str) -> Result<Vec<ExecutionRecord>>;

    async fn upsert_installation(&self, installation: Installation) -> Result<()>;

    async fn installation(
        &self,
        provider: Provider,
        organization_id: &str,
    ) -> Result<Option<Installation>>;

    /// Task counts per status, for the metrics endpoint.
    async fn status_counts(&self) -> Result<HashMap<TaskStatus, u64>>;

    /// Remove terminal tasks older than the retention window.
    async fn sweep(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize>;
}

/// In-memory store. All state behind a single `RwLock`; critical
/// sections are short and never perform I/O.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Arc<RwLock<StoreInner>>,
}

#[derive(Default)]
struct StoreInner {
    tasks: HashMap<String, Task>,
    /// fingerprint → task id, maintained only for non-terminal tasks.
    active_fingerprints: HashMap<String, String>,
    executions: HashMap<String, Vec<ExecutionRecord>>,
    installations: HashMap<(Provider, String), Installation>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn encode_cursor(task: &Task) -> String {
    format!("{}.{}", task.updated_at.timestamp_millis(), task.id)
}

fn matches(filter: &TaskFilter, task: &Task) -> bool {
    if let Some(status) = filter.status {
        if task.status != status {
            return false;
        }
    }
    if let Some(provider) = filter.provider {
        if task.origin.provider != provider {
            return false;
        }
    }
    if let Some(actor) = &filter.actor {
        if task.origin.actor.as_deref() != Some(actor.as_str()) {
            return false;
        }
    }
    if let Some(after) = filter.created_after {
        if task.created_at < after {
            return false;
        }
    }
    if let Some(before) = filter.created_before {
        if task.created_at > before {
            return false;
        }
    }
    true
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn put(&self, task: Task) -> Result<()> {
        let mut inner = self.inner.write().await;

        if !task.status.is_terminal() {
            if let Some(existing_id) = inner.active_fingerprints.get(&task.fingerprint) {
                // A second live task for the fingerprint is a duplicate,
                // reported with the surviving task's id.
                if inner
                    .tasks
                    .get(existing_id)
                    .is_some_and(|t| !t.status.is_terminal())
                {
                    return Err(MendError::Duplicate {
                        task_id: existing_id.clone(),
                    });
                }
            }
            inner
                .active_fingerprints
                .insert(task.fingerprint.clone(), task.id.clone());
        }

        debug!(task_id = %task.id, fingerprint = %task.fingerprint, "Task stored");
        inner.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn get(&self, task_id: &str) -> Result<Task> {
        let inner = self.inner.read().await;
        inner
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| MendError::NotFound(format!("task {task_id}")))
    }

    async fn compare_and_update(&self, mut task: Task, expected_version: u64) -> Result<Task> {
        let mut inner = self.inner.write().await;

        let stored = inner
            .tasks
            .get(&task.id)
            .ok_or_else(|| MendError::NotFound(format!("task {}", task.id)))?;

        if stored.version != expected_version {
            return Err(MendError::VersionConflict {
                task_id: task.id.clone(),
            });
        }

        task.version = expected_version + 1;
        task.updated_at = chrono::Utc::now();

        if task.status.is_terminal() {
            inner.active_fingerprints.remove(&task.fingerprint);
        } else {
            inner
                .active_fingerprints
                .insert(task.fingerprint.clone(), task.id.clone());
        }

        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    async fn find_active_by_fingerprint(&self, fingerprint: &str) -> Result<Option<Task>> {
        let inner = self.inner.read().await;
        Ok(inner
            .active_fingerprints
            .get(fingerprint)
            .and_then(|id| inner.tasks.get(id))
            .filter(|t| !t.status.is_terminal())
            .cloned())
    }

    async fn list(
        &self,
        filter: &TaskFilter,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<TaskPage> {
        let inner = self.inner.read().await;

        let mut tasks: Vec<&Task> = inner.tasks.values().filter(|t| matches(filter, t)).collect();
        tasks.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        // Cursor is opaque to callers: the `(updated_at, id)` sort key of
        // the last task on the previous page. The page starts at the first
        // task strictly after it in the descending order.
        let start = match cursor {
            Some(raw) => {
                let (millis, id) = raw
                    .split_once('.')
                    .ok_or_else(|| MendError::Validation(format!("malformed cursor: {raw}")))?;
                let millis: i64 = millis
                    .parse()
                    .map_err(|_| MendError::Validation(format!("malformed cursor: {raw}")))?;
                tasks
                    .iter()
                    .position(|t| (t.updated_at.timestamp_millis(), t.id.as_str()) < (millis, id))
                    .unwrap_or(tasks.len())
            }
            None => 0,
        };

        let page: Vec<Task> = tasks.iter().skip(start).take(limit).map(|t| (*t).clone()).collect();
        let next_cursor = if start + page.len() < tasks.len() {
            page.last().map(encode_cursor)
        } else {
            None
        };

        Ok(TaskPage {
            tasks: page,
            next_cursor,
        })
    }

    async fn record_execution(&self, record: ExecutionRecord) -> Result<()> {
        let mut inner = self.inner.write().await;
        let chain = inner.executions.entry(record.task_id.clone()).or_default();

        // Only the last record may be open; starting a new one while the
        // previous is unfinished is a lifecycle bug.
        if chain.last().is_some_and(|r| r.finished_at.is_none()) {
            return Err(MendError::Validation(format!(
                "task {} already has an open execution record",
                record.task_id
            )));
        }
        chain.push(record);
        Ok(())
    }

    async fn finish_execution(
        &self,
        task_id: &str,
        outcome: ExecutionOutcome,
        usage: UsageCounters,
        next_agent_hint: Option<String>,
        status_after: TaskStatus,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .executions
            .get_mut(task_id)
            .and_then(|chain| chain.last_mut())
            .filter(|r| r.finished_at.is_none())
            .ok_or_else(|| {
                MendError::NotFound(format!("open execution record for task {task_id}"))
            })?;

        record.finished_at = Some(chrono::Utc::now());
        record.outcome = Some(outcome);
        record.usage = usage;
        record.next_agent_hint = next_agent_hint;
        record.status_after = Some(status_after);
        Ok(())
    }

    async fn executions(&self, task_id: &str) -> Result<Vec<ExecutionRecord>> {
        let inner = self.inner.read().await;
        Ok(inner.executions.get(task_id).cloned().unwrap_or_default())
    }

    async fn upsert_installation(&self, installation: Installation) -> Result<()> {
        let mut inner = self.inner.write().await;
        let key = (
            installation.provider,
            installation.organization_id.clone(),
        );
        inner.installations.insert(key, installation);
        Ok(())
    }

    async fn installation(
        &self,
        provider: Provider,
        organization_id: &str,
    ) -> Result<Option<Installation>> {
        let inner = self.inner.read().await;
        Ok(inner
            .installations
            .get(&(provider, organization_id.to_string()))
            .cloned())
    }

    async fn status_counts(&self) -> Result<HashMap<TaskStatus, u64>> {
        let inner = self.inner.read().await;
        let mut counts: HashMap<TaskStatus, u64> = HashMap::new();
        for task in inner.tasks.values() {
            *counts.entry(task.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn sweep(&self, now: chrono::DateTime<chrono::Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::seconds(constants::STORE_RETENTION_SECS as i64);
        let mut inner = self.inner.write().await;

        let stale: Vec<String> = inner
            .tasks
            .values()
            .filter(|t| t.status.is_terminal() && t.updated_at < cutoff)
            .map(|t| t.id.clone())
            .collect();

        for id in &stale {
            if let Some(task) = inner.tasks.remove(id) {
                inner.executions.remove(id);
                // The active index never references terminal tasks, but a
                // stale entry pointing at this id must not survive it.
                if inner.active_fingerprints.get(&task.fingerprint) == Some(id) {
                    inner.active_fingerprints.remove(&task.fingerprint);
                }
            }
        }

        if !stale.is_empty() {
            info!("Swept {} terminal tasks from store", stale.len());
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;
    use crate::models::{Origin, Priority, Target, TaskKind};

    fn sample_task(event_id: &str) -> Task {
        let origin = Origin {
            provider: Provider::IssueTracker,
            organization_id: "acme".to_string(),
            event_id: event_id.to_string(),
            actor: Some("alice".to_string()),
        };
        let target = Target::new("acme/widgets");
        let fingerprint = ids::fingerprint(&origin, &target);
        Task::new(
            format!("t-{event_id}"),
            fingerprint,
            origin,
            target,
            TaskKind::Fix,
            Priority::Normal,
        )
    }

    #[tokio::test]
    async fn put_and_get_round_trip() {
        let store = MemoryTaskStore::new();
        let task = sample_task("ev-1");
        store.put(task.clone()).await.unwrap();

        let fetched = store.get(&task.id).await.unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.version, 0);
    }

    #[tokio::test]
    async fn duplicate_fingerprint_is_rejected_while_active() {
        let store = MemoryTaskStore::new();
        let first = sample_task("ev-1");
        store.put(first.clone()).await.unwrap();

        let mut second = sample_task("ev-1");
        second.id = "t-other".to_string();
        let err = store.put(second).await.unwrap_err();
        match err {
            MendError::Duplicate { task_id } => assert_eq!(task_id, first.id),
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn fingerprint_frees_up_once_terminal() {
        let store = MemoryTaskStore::new();
        let mut first = sample_task("ev-1");
        store.put(first.clone()).await.unwrap();

        first.status = TaskStatus::Failed;
        store.compare_and_update(first, 0).await.unwrap();

        let mut second = sample_task("ev-1");
        second.id = "t-second".to_string();
        store.put(second).await.unwrap();
    }

    #[tokio::test]
    async fn version_conflict_on_stale_write() {
        let store = MemoryTaskStore::new();
        let task = sample_task("ev-1");
        store.put(task.clone()).await.unwrap();

        let mut fresh = store.get(&task.id).await.unwrap();
        fresh.status = TaskStatus::Planning;
        let updated = store.compare_and_update(fresh, 0).await.unwrap();
        assert_eq!(updated.version, 1);

        let mut stale = task.clone();
        stale.status = TaskStatus::Failed;
        let err = store.compare_and_update(stale, 0).await.unwrap_err();
        assert!(matches!(err, MendError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn list_orders_by_updated_at_desc_and_pages() {
        let store = MemoryTaskStore::new();
        for i in 0..5 {
            let mut task = sample_task(&format!("ev-{i}"));
            task.updated_at = chrono::Utc::now() + chrono::Duration::milliseconds(i * 10);
            store.put(task).await.unwrap();
        }

        let first_page = store
            .list(&TaskFilter::default(), None, 2)
            .await
            .unwrap();
        assert_eq!(first_page.tasks.len(), 2);
        assert!(first_page.next_cursor.is_some());
        assert!(first_page.tasks[0].updated_at >= first_page.tasks[1].updated_at);

        let second_page = store
            .list(
                &TaskFilter::default(),
                first_page.next_cursor.as_deref(),
                10,
            )
            .await
            .unwrap();
        assert_eq!(second_page.tasks.len(), 3);
        assert!(second_page.next_cursor.is_none());

        // No overlap between pages.
        for task in &second_page.tasks {
            assert!(first_page.tasks.iter().all(|t| t.id != task.id));
        }
    }

    #[tokio::test]
    async fn execution_chain_allows_single_open_record() {
        let store = MemoryTaskStore::new();
        let task = sample_task("ev-1");
        store.put(task.clone()).await.unwrap();

        let record = ExecutionRecord {
            task_id: task.id.clone(),
            agent: "planner".to_string(),
            session_id: "s-1".to_string(),
            started_at: chrono::Utc::now(),
            finished_at: None,
            outcome: None,
            usage: UsageCounters::default(),
            next_agent_hint: None,
            status_before: TaskStatus::Queued,
            status_after: None,
        };
        store.record_execution(record.clone()).await.unwrap();

        let err = store.record_execution(record.clone()).await.unwrap_err();
        assert!(matches!(err, MendError::Validation(_)));

        store
            .finish_execution(
                &task.id,
                ExecutionOutcome::Success,
                UsageCounters::default(),
                None,
                TaskStatus::AwaitingApproval,
            )
            .await
            .unwrap();

        store.record_execution(record).await.unwrap();
        let chain = store.executions(&task.id).await.unwrap();
        assert_eq!(chain.len(), 2);
        assert!(chain[0].finished_at.is_some());
        assert!(chain[1].finished_at.is_none());
    }

    #[tokio::test]
    async fn sweep_removes_only_old_terminal_tasks() {
        let store = MemoryTaskStore::new();
        let mut old_done = sample_task("ev-old");
        old_done.status = TaskStatus::Completed;
        old_done.updated_at =
            chrono::Utc::now() - chrono::Duration::seconds(constants::STORE_RETENTION_SECS as i64 + 60);
        store.put(old_done.clone()).await.unwrap();

        let live = sample_task("ev-live");
        store.put(live.clone()).await.unwrap();

        let removed = store.sweep(chrono::Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&old_done.id).await.is_err());
        assert!(store.get(&live.id).await.is_ok());
    }
}
