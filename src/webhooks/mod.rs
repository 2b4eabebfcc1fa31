use crate::{
    commands::{CommandContext, CommandRouter, Surface},
    config::WebhookSecrets,
    lifecycle::TaskLifecycle,
    models::{Origin, Priority, Provider, Target, TaskKind},
    monitoring::Metrics,
    MendError, Result,
};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};

pub mod handlers;

type HmacSha256 = Hmac<Sha256>;

/// Declared metadata for one webhook handler.
#[derive(Debug, Clone, Serialize)]
pub struct HandlerMeta {
    pub name: &'static str,
    pub path: &'static str,
    pub description: &'static str,
    pub enabled: bool,
}

/// A provider event normalized into the fields the core acts on.
#[derive(Debug, Clone)]
pub struct NormalizedEvent {
    pub provider: Provider,
    pub organization_id: String,
    pub event_id: String,
    pub actor: Option<String>,
    pub repo: Option<String>,
    pub reference: Option<String>,
    /// Free text carried by the event (comment body, chat message).
    pub body: Option<String>,
    /// Explicit task id named by the event (chat `task:<id>` token).
    pub task_id: Option<String>,
    /// Work directly requested by the event itself (a label, an alert),
    /// as opposed to text that still needs command parsing.
    pub kind_hint: Option<TaskKind>,
    pub priority: Priority,
}

/// What a handler wants done with a normalized event.
#[derive(Debug, Clone)]
pub enum WebhookAction {
    EnqueueTask {
        kind: TaskKind,
        target: Target,
        priority: Priority,
    },
    /// Route the carried text through the command parser.
    Command { surface: Surface },
    Ignored { reason: &'static str },
}

/// One webhook endpoint: signature scheme, payload normalization, and
/// the resulting action. Implementations are pure over the payload; all
/// I/O happens in the dispatcher.
pub trait WebhookHandler: Send + Sync {
    fn meta(&self) -> HandlerMeta;

    /// Verify the request signature. Called before any parsing.
    fn verify(&self, headers: &HeaderMap, body: &[u8], secrets: &WebhookSecrets) -> Result<()>;

    /// Normalize the payload. `Ok(None)` means an event family this
    /// handler does not act on.
    fn parse(&self, body: &[u8], headers: &HeaderMap) -> Result<Option<NormalizedEvent>>;

    fn handle(&self, event: &NormalizedEvent) -> WebhookAction;
}

/// Registration table populated by each handler module's `register`
/// hook; `main` iterates it at boot. Keeps the handler set closed
/// without reflection.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn add(&mut self, handler: Arc<dyn WebhookHandler>) {
        self.handlers.push(handler);
    }

    pub fn handlers(&self) -> &[Arc<dyn WebhookHandler>] {
        &self.handlers
    }
}

/// The built-in handler set.
pub fn builtin_registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::default();
    handlers::code_host::register(&mut registry);
    handlers::issue_tracker::register(&mut registry);
    handlers::chat::register(&mut registry);
    handlers::error_reporter::register(&mut registry);
    registry
}

// --- signature helpers -------------------------------------------------

pub(crate) fn hmac_sha256_hex(secret: &str, message: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(message);
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Constant-time comparison of a presented hex signature against the
/// expected HMAC of the body.
pub(crate) fn verify_hmac_hex(presented: &str, secret: &str, message: &[u8]) -> bool {
    let expected = hmac_sha256_hex(secret, message);
    constant_time_eq(presented.trim(), &expected)
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && a.as_bytes().ct_eq(b.as_bytes()).into()
}

pub(crate) fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// An actor matching a configured bot identity must never create work,
/// or the system replies to itself forever.
pub(crate) fn is_bot_actor(actor: Option<&str>, bot_identities: &[String]) -> bool {
    match actor {
        Some(actor) => {
            let actor = actor.to_lowercase();
            bot_identities.iter().any(|bot| *bot == actor)
        }
        None => false,
    }
}

// --- dispatcher --------------------------------------------------------

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct DispatcherState {
    pub lifecycle: Arc<TaskLifecycle>,
    pub commands: Arc<CommandRouter>,
    pub secrets: Arc<WebhookSecrets>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

fn respond(code: StatusCode, body: WebhookResponse) -> Response {
    (code, Json(body)).into_response()
}

/// Build the dispatcher router, binding every enabled handler to its
/// declared path.
pub fn dispatcher_router(registry: HandlerRegistry, state: DispatcherState) -> Router {
    let mut router = Router::new();
    for handler in registry.handlers() {
        let meta = handler.meta();
        if !meta.enabled {
            info!("Webhook handler {} is disabled, not binding {}", meta.name, meta.path);
            continue;
        }
        info!("Binding webhook handler {} at {}", meta.name, meta.path);
        let handler = handler.clone();
        router = router.route(
            meta.path,
            post(move |state: State<DispatcherState>, headers: HeaderMap, body: Bytes| {
                let handler = handler.clone();
                async move { dispatch(state.0, handler, headers, body).await }
            }),
        );
    }
    router.with_state(state)
}

/// Per-request lifecycle: signature → parse → loop check → action.
async fn dispatch(
    state: DispatcherState,
    handler: Arc<dyn WebhookHandler>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let meta = handler.meta();
    Metrics::incr(&state.metrics.webhooks_received);

    if let Err(e) = handler.verify(&headers, &body, &state.secrets) {
        Metrics::incr(&state.metrics.webhooks_rejected_signature);
        warn!(handler = meta.name, "Webhook signature rejected: {e}");
        return respond(
            StatusCode::UNAUTHORIZED,
            WebhookResponse {
                status: "unauthorized".to_string(),
                task_id: None,
                message: None,
            },
        );
    }

    let event = match handler.parse(&body, &headers) {
        Ok(Some(event)) => event,
        Ok(None) => {
            Metrics::incr(&state.metrics.webhooks_ignored);
            return respond(
                StatusCode::OK,
                WebhookResponse {
                    status: "ignored".to_string(),
                    task_id: None,
                    message: Some("event family not handled".to_string()),
                },
            );
        }
        Err(e) => {
            warn!(handler = meta.name, "Webhook payload rejected: {e}");
            return respond(
                StatusCode::BAD_REQUEST,
                WebhookResponse {
                    status: "invalid".to_string(),
                    task_id: None,
                    message: Some(e.to_string()),
                },
            );
        }
    };

    // Loop prevention: our own bot must not feed the pipeline.
    if is_bot_actor(event.actor.as_deref(), &state.secrets.bot_identities) {
        Metrics::incr(&state.metrics.webhooks_ignored);
        return respond(
            StatusCode::OK,
            WebhookResponse {
                status: "ignored".to_string(),
                task_id: None,
                message: Some("own bot activity".to_string()),
            },
        );
    }

    match handler.handle(&event) {
        WebhookAction::Ignored { reason } => {
            Metrics::incr(&state.metrics.webhooks_ignored);
            respond(
                StatusCode::OK,
                WebhookResponse {
                    status: "ignored".to_string(),
                    task_id: None,
                    message: Some(reason.to_string()),
                },
            )
        }
        WebhookAction::EnqueueTask {
            kind,
            target,
            priority,
        } => {
            let origin = Origin {
                provider: event.provider,
                organization_id: event.organization_id.clone(),
                event_id: event.event_id.clone(),
                actor: event.actor.clone(),
            };
            match state.lifecycle.create_task(origin, target, kind, priority).await {
                Ok(created) if created.deduplicated => respond(
                    StatusCode::OK,
                    WebhookResponse {
                        status: "duplicate".to_string(),
                        task_id: Some(created.task.id),
                        message: None,
                    },
                ),
                Ok(created) => {
                    // Carry the event's summary text into the task so the
                    // runner descriptor can show it.
                    if let Some(summary) = event.body.clone() {
                        let version = created.task.version;
                        let enriched = created.task.clone().with_context("summary", summary);
                        let _ = state
                            .lifecycle
                            .store()
                            .compare_and_update(enriched, version)
                            .await;
                    }
                    respond(
                        StatusCode::OK,
                        WebhookResponse {
                            status: "queued".to_string(),
                            task_id: Some(created.task.id),
                            message: None,
                        },
                    )
                }
                Err(MendError::QueueFull { .. }) => {
                    Metrics::incr(&state.metrics.webhooks_throttled);
                    respond(
                        StatusCode::SERVICE_UNAVAILABLE,
                        WebhookResponse {
                            status: "throttled".to_string(),
                            task_id: None,
                            message: Some("queue above high-water mark, retry later".to_string()),
                        },
                    )
                }
                Err(e) => {
                    error!(handler = meta.name, "Task creation failed: {e}");
                    respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        WebhookResponse {
                            status: "error".to_string(),
                            task_id: None,
                            message: None,
                        },
                    )
                }
            }
        }
        WebhookAction::Command { surface } => {
            let Some(text) = event.body.clone() else {
                Metrics::incr(&state.metrics.webhooks_ignored);
                return respond(
                    StatusCode::OK,
                    WebhookResponse {
                        status: "ignored".to_string(),
                        task_id: None,
                        message: Some("no text to parse".to_string()),
                    },
                );
            };
            let ctx = CommandContext {
                surface,
                provider: event.provider,
                organization_id: event.organization_id.clone(),
                event_id: event.event_id.clone(),
                actor: event.actor.clone().unwrap_or_else(|| "unknown".to_string()),
                repo: event.repo.clone(),
                reference: event.reference.clone(),
                task_id: event.task_id.clone(),
            };
            match state.commands.dispatch(&text, &ctx).await {
                Ok(Some(reply)) => {
                    // Answer on the originating surface as well; the HTTP
                    // response alone only reaches the provider's delivery
                    // machinery.
                    if surface == Surface::CodeHost {
                        if let (Some(repo), Some(reference)) = (&ctx.repo, &ctx.reference) {
                            state
                                .lifecycle
                                .collaborators()
                                .code_host
                                .post_comment(repo, reference, &reply.message)
                                .await
                                .unwrap_or_else(|e| warn!("reply comment failed: {e}"));
                        }
                    }
                    respond(
                        StatusCode::OK,
                        WebhookResponse {
                            status: "ok".to_string(),
                            task_id: reply.task_id,
                            message: Some(reply.message),
                        },
                    )
                }
                Ok(None) => {
                    Metrics::incr(&state.metrics.webhooks_ignored);
                    respond(
                        StatusCode::OK,
                        WebhookResponse {
                            status: "ignored".to_string(),
                            task_id: None,
                            message: Some("not addressed to the agent".to_string()),
                        },
                    )
                }
                Err(e) => {
                    error!(handler = meta.name, "Command dispatch failed: {e}");
                    respond(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        WebhookResponse {
                            status: "error".to_string(),
                            task_id: None,
                            message: None,
                        },
                    )
                }
            }
        }
    }
}
