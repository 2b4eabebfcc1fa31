use crate::{
    config::WebhookSecrets,
    models::{Priority, Provider, Target, TaskKind},
    webhooks::{
        constant_time_eq, header_str, HandlerMeta, HandlerRegistry, NormalizedEvent, WebhookAction,
        WebhookHandler,
    },
    MendError, Result,
};
use axum::http::HeaderMap;
use serde::Deserialize;
use std::sync::Arc;

const SECRET_HEADER: &str = "x-report-secret";

pub fn register(registry: &mut HandlerRegistry) {
    registry.add(Arc::new(ErrorReporterHandler));
}

/// Issue-triggered alerts from the error-reporting service. Signature:
/// optional shared secret header, compared in constant time.
pub struct ErrorReporterHandler;

#[derive(Debug, Deserialize)]
struct AlertPayload {
    /// Stable issue id; repeated alerts for the same issue share it,
    /// which is what dedups alert storms into one task.
    issue_id: String,
    organization: String,
    #[serde(default)]
    repository: Option<String>,
    title: String,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    culprit: Option<String>,
}

fn priority_for(level: Option<&str>) -> Priority {
    match level.map(|l| l.to_lowercase()).as_deref() {
        Some("fatal") => Priority::Critical,
        Some("error") => Priority::High,
        Some("warning") => Priority::Normal,
        _ => Priority::Low,
    }
}

impl WebhookHandler for ErrorReporterHandler {
    fn meta(&self) -> HandlerMeta {
        HandlerMeta {
            name: "error-reporter",
            path: "/webhooks/error-reporter",
            description: "Issue-triggered alerts from the error reporter",
            enabled: true,
        }
    }

    fn verify(&self, headers: &HeaderMap, _body: &[u8], secrets: &WebhookSecrets) -> Result<()> {
        let Some(secret) = secrets.error_reporter_secret.as_deref() else {
            return Ok(());
        };
        let presented = header_str(headers, SECRET_HEADER).ok_or(MendError::SignatureRejected)?;
        if constant_time_eq(presented, secret) {
            Ok(())
        } else {
            Err(MendError::SignatureRejected)
        }
    }

    fn parse(&self, body: &[u8], _headers: &HeaderMap) -> Result<Option<NormalizedEvent>> {
        let payload: AlertPayload = serde_json::from_slice(body)
            .map_err(|e| MendError::Validation(format!("malformed alert payload: {e}")))?;

        let priority = priority_for(payload.level.as_deref());
        let mut summary = payload.title.clone();
        if let Some(culprit) = &payload.culprit {
            summary.push_str(&format!(" ({culprit})"));
        }

        Ok(Some(NormalizedEvent {
            provider: Provider::ErrorReporter,
            organization_id: payload.organization,
            event_id: payload.issue_id,
            actor: None,
            repo: payload.repository,
            reference: None,
            body: Some(summary),
            task_id: None,
            kind_hint: Some(TaskKind::Fix),
            priority,
        }))
    }

    fn handle(&self, event: &NormalizedEvent) -> WebhookAction {
        let Some(repo) = event.repo.clone() else {
            return WebhookAction::Ignored {
                reason: "alert names no repository",
            };
        };
        WebhookAction::EnqueueTask {
            kind: TaskKind::Fix,
            target: Target::new(repo),
            priority: event.priority,
        }
    }
}
