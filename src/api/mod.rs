use crate::{
    lifecycle::TaskLifecycle,
    models::{declared_agents, ExecutionRecord, Provider, QueueName, Task, TaskStatus},
    monitoring::{HealthStatus, Metrics, MetricsSnapshot},
    store::TaskFilter,
    MendError, Result,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

const SERVICE_NAME: &str = "mend-core";
const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

const ROUTE_HEALTH: &str = "/health";
const ROUTE_TASKS: &str = "/tasks";
const ROUTE_TASK_BY_ID: &str = "/tasks/{task_id}";
const ROUTE_TASK_LOGS: &str = "/tasks/{task_id}/logs";
const ROUTE_TASK_STATUS: &str = "/tasks/{task_id}/status";
const ROUTE_AGENTS: &str = "/agents";
const ROUTE_METRICS: &str = "/metrics";

/// Poll-again hint returned when a client asks to follow a live log.
const FOLLOW_RETRY_MS: u64 = 1000;

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;
const DEFAULT_LOG_PAGE: usize = 100;
const MAX_LOG_PAGE: usize = 1000;

/// Read-only HTTP surface for the dashboard. Authentication is expected
/// to be enforced upstream by a reverse proxy.
#[derive(Clone)]
pub struct ApiState {
    pub lifecycle: Arc<TaskLifecycle>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(code: StatusCode, message: impl Into<String>) -> Response {
    (
        code,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
        .into_response()
}

fn map_error(e: MendError) -> Response {
    match e {
        MendError::NotFound(what) => error_response(StatusCode::NOT_FOUND, what),
        MendError::Validation(msg) => error_response(StatusCode::BAD_REQUEST, msg),
        other => {
            tracing::error!("Read API failure: {other}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListTasksQuery {
    pub status: Option<String>,
    pub provider: Option<String>,
    pub actor: Option<String>,
    pub since: Option<chrono::DateTime<chrono::Utc>>,
    pub until: Option<chrono::DateTime<chrono::Utc>>,
    pub cursor: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskDetailResponse {
    pub task: Task,
    pub executions: Vec<ExecutionRecord>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub offset: Option<u64>,
    pub limit: Option<usize>,
    pub follow: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub entries: Vec<crate::models::LogEntry>,
    pub next_offset: u64,
    pub total: u64,
    pub has_more: bool,
    /// Present when `follow=true`: short-poll again after this delay.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub counters: MetricsSnapshot,
    pub queue_depths: HashMap<String, usize>,
    pub tasks_by_status: HashMap<String, u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub service: String,
    pub version: String,
    pub status: HealthStatus,
    pub uptime_seconds: f64,
}

/// Build the read API router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(ROUTE_HEALTH, get(health))
        .route(ROUTE_TASKS, get(list_tasks))
        .route(ROUTE_TASK_BY_ID, get(get_task))
        .route(ROUTE_TASK_LOGS, get(get_logs))
        .route(ROUTE_TASK_STATUS, get(get_status))
        .route(ROUTE_AGENTS, get(list_agents))
        .route(ROUTE_METRICS, get(get_metrics))
        .with_state(state)
}

/// Bind and serve a composed router until the process is stopped.
pub async fn serve(listen_addr: &str, router: Router) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .map_err(|e| MendError::Configuration(format!("cannot bind {listen_addr}: {e}")))?;
    info!("HTTP server listening on {}", listen_addr);
    axum::serve(listener, router)
        .await
        .map_err(|e| MendError::Internal(e.into()))?;
    Ok(())
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        service: SERVICE_NAME.to_string(),
        version: SERVICE_VERSION.to_string(),
        status: HealthStatus::Healthy,
        uptime_seconds: state.metrics.uptime_seconds(),
    })
}

async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<ListTasksQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::parse::<TaskStatus>) {
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
        None => None,
    };
    let provider = match query.provider.as_deref().map(str::parse::<Provider>) {
        Some(Ok(provider)) => Some(provider),
        Some(Err(e)) => return error_response(StatusCode::BAD_REQUEST, e),
        None => None,
    };

    let filter = TaskFilter {
        status,
        provider,
        actor: query.actor,
        created_after: query.since,
        created_before: query.until,
    };
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);

    match state
        .lifecycle
        .store()
        .list(&filter, query.cursor.as_deref(), limit)
        .await
    {
        Ok(page) => Json(ListTasksResponse {
            tasks: page.tasks,
            next_cursor: page.next_cursor,
        })
        .into_response(),
        Err(e) => map_error(e),
    }
}

async fn get_task(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    let task = match state.lifecycle.store().get(&task_id).await {
        Ok(task) => task,
        Err(e) => return map_error(e),
    };
    match state.lifecycle.store().executions(&task_id).await {
        Ok(executions) => Json(TaskDetailResponse { task, executions }).into_response(),
        Err(e) => map_error(e),
    }
}

async fn get_logs(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Response {
    // Unknown task ids 404 rather than returning an empty log.
    if let Err(e) = state.lifecycle.store().get(&task_id).await {
        return map_error(e);
    }

    let offset = query.offset.unwrap_or(0);
    let limit = query.limit.unwrap_or(DEFAULT_LOG_PAGE).min(MAX_LOG_PAGE);
    match state.lifecycle.logs().read(&task_id, offset, limit).await {
        Ok(page) => Json(LogsResponse {
            entries: page.entries,
            next_offset: page.next_offset,
            total: page.total,
            has_more: page.has_more,
            retry_after_ms: query.follow.unwrap_or(false).then_some(FOLLOW_RETRY_MS),
        })
        .into_response(),
        Err(e) => map_error(e),
    }
}

async fn get_status(State(state): State<ApiState>, Path(task_id): Path<String>) -> Response {
    match state.lifecycle.store().get(&task_id).await {
        Ok(task) => Json(TaskStatusResponse {
            task_id: task.id,
            status: task.status,
            attempts: task.attempts,
            updated_at: task.updated_at,
            plan_ref: task.plan_ref,
            pr_ref: task.pr_ref,
            last_error: task.last_error,
        })
        .into_response(),
        Err(e) => map_error(e),
    }
}

async fn list_agents() -> Json<Vec<crate::models::AgentInfo>> {
    Json(declared_agents())
}

async fn get_metrics(State(state): State<ApiState>) -> Response {
    let counters = state.metrics.snapshot();
    let mut queue_depths = HashMap::new();
    for queue in [QueueName::Plan, QueueName::Execute] {
        queue_depths.insert(
            queue.to_string(),
            state.lifecycle.queue().depth(queue).await,
        );
    }
    match state.lifecycle.store().status_counts().await {
        Ok(counts) => {
            let tasks_by_status = counts
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect();
            Json(MetricsResponse {
                counters,
                queue_depths,
                tasks_by_status,
            })
            .into_response()
        }
        Err(e) => map_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::Collaborators;
    use crate::config::Config;
    use crate::logs::LogChannel;
    use crate::models::{Origin, Priority, StreamTag, Target, TaskKind};
    use crate::queue::MemoryWorkQueue;
    use crate::store::MemoryTaskStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn state_with_lifecycle() -> ApiState {
        let config = Config::for_tests();
        let store: Arc<dyn crate::store::TaskStore> = Arc::new(MemoryTaskStore::new());
        let queue: Arc<dyn crate::queue::WorkQueue> = Arc::new(MemoryWorkQueue::new(
            config.queue.high_water,
            false,
            config.worker.max_attempts,
        ));
        let logs = Arc::new(LogChannel::new(1000, 3600));
        let (collab, _) = Collaborators::logging();
        let metrics = Arc::new(Metrics::new());
        ApiState {
            lifecycle: Arc::new(TaskLifecycle::new(
                store,
                queue,
                logs,
                collab,
                metrics.clone(),
            )),
            metrics,
        }
    }

    async fn create_task(state: &ApiState, event_id: &str) -> Task {
        state
            .lifecycle
            .create_task(
                Origin {
                    provider: Provider::IssueTracker,
                    organization_id: "acme".to_string(),
                    event_id: event_id.to_string(),
                    actor: Some("alice".to_string()),
                },
                Target::new("acme/widgets"),
                TaskKind::Fix,
                Priority::Normal,
            )
            .await
            .unwrap()
            .task
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_service_metadata() {
        let state = state_with_lifecycle().await;
        let (status, body) = get_json(router(state), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "mend-core");
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn list_tasks_filters_by_status() {
        let state = state_with_lifecycle().await;
        create_task(&state, "ev-1").await;
        create_task(&state, "ev-2").await;

        let (status, body) = get_json(router(state.clone()), "/tasks?status=queued").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"].as_array().unwrap().len(), 2);

        let (status, body) = get_json(router(state.clone()), "/tasks?status=completed").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"].as_array().unwrap().len(), 0);

        let (status, _) = get_json(router(state), "/tasks?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn task_detail_includes_execution_chain() {
        let state = state_with_lifecycle().await;
        let task = create_task(&state, "ev-1").await;
        state
            .lifecycle
            .begin_stage(&task.id, QueueName::Plan, "planner", "s-1")
            .await
            .unwrap();

        let (status, body) = get_json(router(state), &format!("/tasks/{}", task.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["task"]["id"], task.id.as_str());
        assert_eq!(body["executions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_task_is_404() {
        let state = state_with_lifecycle().await;
        let (status, _) = get_json(router(state.clone()), "/tasks/missing").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get_json(router(state), "/tasks/missing/logs").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn log_tailing_pages_by_offset() {
        let state = state_with_lifecycle().await;
        let task = create_task(&state, "ev-1").await;
        // One system line already exists from creation.
        for i in 0..150 {
            state
                .lifecycle
                .logs()
                .append(&task.id, StreamTag::Stdout, &format!("line {i}"))
                .await
                .unwrap();
        }

        let (status, body) = get_json(
            router(state.clone()),
            &format!("/tasks/{}/logs?offset=0&limit=100", task.id),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entries"].as_array().unwrap().len(), 100);
        assert_eq!(body["next_offset"], 100);
        assert_eq!(body["has_more"], true);

        let (_, body) = get_json(
            router(state),
            &format!("/tasks/{}/logs?offset=100&limit=100", task.id),
        )
        .await;
        assert_eq!(body["entries"].as_array().unwrap().len(), 51);
        assert_eq!(body["has_more"], false);
    }

    #[tokio::test]
    async fn follow_adds_retry_hint() {
        let state = state_with_lifecycle().await;
        let task = create_task(&state, "ev-1").await;
        let (_, body) = get_json(
            router(state),
            &format!("/tasks/{}/logs?follow=true", task.id),
        )
        .await;
        assert_eq!(body["retry_after_ms"], FOLLOW_RETRY_MS);
    }

    #[tokio::test]
    async fn agents_and_metrics_endpoints_respond() {
        let state = state_with_lifecycle().await;
        create_task(&state, "ev-1").await;

        let (status, body) = get_json(router(state.clone()), "/agents").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 2);

        let (status, body) = get_json(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["counters"]["tasks_created"], 1);
        assert_eq!(body["queue_depths"]["plan"], 1);
        assert_eq!(body["tasks_by_status"]["queued"], 1);
    }

    #[tokio::test]
    async fn status_endpoint_is_minimal() {
        let state = state_with_lifecycle().await;
        let task = create_task(&state, "ev-1").await;
        let (status, body) =
            get_json(router(state), &format!("/tasks/{}/status", task.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "queued");
        assert_eq!(body["attempts"], 0);
        assert!(body.get("task").is_none());
    }
}
