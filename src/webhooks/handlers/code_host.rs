use crate::{
    commands::Surface,
    config::WebhookSecrets,
    models::{Priority, Provider, Target, TaskKind},
    webhooks::{
        header_str, verify_hmac_hex, HandlerMeta, HandlerRegistry, NormalizedEvent, WebhookAction,
        WebhookHandler,
    },
    MendError, Result,
};
use axum::http::HeaderMap;
use serde::Deserialize;
use std::sync::Arc;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";
const DELIVERY_HEADER: &str = "x-delivery-id";

/// Label that opts a pull request into the fix pipeline.
const FIX_LABEL: &str = "ai-fix";

pub fn register(registry: &mut HandlerRegistry) {
    registry.add(Arc::new(CodeHostHandler));
}

/// PR events, issue-comment events, and review events from the code
/// host. Signature: HMAC-SHA256 over the raw body, presented as
/// `sha256=<hex>`.
pub struct CodeHostHandler;

#[derive(Debug, Deserialize)]
struct CodeHostPayload {
    #[serde(default)]
    event_id: Option<String>,
    organization: String,
    event: String,
    action: String,
    repository: String,
    #[serde(default)]
    number: Option<u64>,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    comment: Option<CommentPayload>,
    #[serde(default)]
    sender: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    body: String,
    author: String,
}

impl WebhookHandler for CodeHostHandler {
    fn meta(&self) -> HandlerMeta {
        HandlerMeta {
            name: "code-host",
            path: "/webhooks/code-host",
            description: "PR, issue-comment, and review events from the code host",
            enabled: true,
        }
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8], secrets: &WebhookSecrets) -> Result<()> {
        let secret = secrets
            .code_host_secret
            .as_deref()
            .ok_or(MendError::SignatureRejected)?;
        let presented = header_str(headers, SIGNATURE_HEADER)
            .and_then(|v| v.strip_prefix("sha256="))
            .ok_or(MendError::SignatureRejected)?;
        if verify_hmac_hex(presented, secret, body) {
            Ok(())
        } else {
            Err(MendError::SignatureRejected)
        }
    }

    fn parse(&self, body: &[u8], headers: &HeaderMap) -> Result<Option<NormalizedEvent>> {
        let payload: CodeHostPayload = serde_json::from_slice(body)
            .map_err(|e| MendError::Validation(format!("malformed code-host payload: {e}")))?;

        let event_id = payload
            .event_id
            .clone()
            .or_else(|| header_str(headers, DELIVERY_HEADER).map(str::to_string))
            .ok_or_else(|| MendError::Validation("missing event id".to_string()))?;

        let known_event = matches!(
            payload.event.as_str(),
            "pull_request" | "issue_comment" | "pull_request_review" | "pull_request_review_comment"
        );
        if !known_event {
            return Ok(None);
        }

        let reference = payload.number.map(|n| format!("PR#{n}"));
        let (actor, body_text) = match &payload.comment {
            Some(comment) => (Some(comment.author.clone()), Some(comment.body.clone())),
            None => (payload.sender.clone(), None),
        };

        // A PR labeled for the agent opts into the fix pipeline.
        let kind_hint = (payload.event == "pull_request"
            && payload.action == "labeled"
            && payload
                .labels
                .iter()
                .any(|l| l.eq_ignore_ascii_case(FIX_LABEL)))
        .then_some(TaskKind::Fix);

        Ok(Some(NormalizedEvent {
            provider: Provider::CodeHost,
            organization_id: payload.organization.clone(),
            event_id,
            actor,
            repo: Some(payload.repository.clone()),
            reference,
            body: body_text,
            task_id: None,
            kind_hint,
            priority: Priority::Normal,
        }))
    }

    fn handle(&self, event: &NormalizedEvent) -> WebhookAction {
        // Comment and review text routes through the command parser.
        if event.body.is_some() {
            return WebhookAction::Command {
                surface: Surface::CodeHost,
            };
        }

        if let Some(kind) = event.kind_hint {
            let Some(repo) = event.repo.clone() else {
                return WebhookAction::Ignored {
                    reason: "labeled event without repository",
                };
            };
            let mut target = Target::new(repo);
            if let Some(reference) = event.reference.clone() {
                target = target.with_reference(reference);
            }
            return WebhookAction::EnqueueTask {
                kind,
                target,
                priority: event.priority,
            };
        }

        WebhookAction::Ignored {
            reason: "no actionable comment or label",
        }
    }
}
