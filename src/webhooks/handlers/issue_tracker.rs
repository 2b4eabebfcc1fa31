use crate::{
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

const SIGNATURE_HEADER: &str = "x-webhook-signature";

pub fn register(registry: &mut HandlerRegistry) {
    registry.add(Arc::new(IssueTrackerHandler));
}

/// Ticket created/updated/transitioned events from the issue tracker.
/// Signature is optional: installations without a configured secret are
/// accepted as-is, matching the tracker's delivery model.
pub struct IssueTrackerHandler;

#[derive(Debug, Deserialize)]
struct TicketPayload {
    event_id: String,
    organization: String,
    action: String,
    ticket: Ticket,
    #[serde(default)]
    actor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Ticket {
    key: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default)]
    repository: Option<String>,
    #[serde(default)]
    priority: Option<String>,
}

fn kind_for_labels(labels: &[String]) -> Option<TaskKind> {
    for label in labels {
        match label.to_lowercase().as_str() {
            "ai-fix" => return Some(TaskKind::Fix),
            "ai-enrich" => return Some(TaskKind::Enrich),
            "ai-review" => return Some(TaskKind::Review),
            _ => {}
        }
    }
    None
}

fn priority_for(raw: Option<&str>) -> Priority {
    match raw.map(|p| p.to_lowercase()).as_deref() {
        Some("blocker") | Some("highest") | Some("critical") => Priority::Critical,
        Some("high") => Priority::High,
        Some("low") | Some("lowest") | Some("trivial") => Priority::Low,
        _ => Priority::Normal,
    }
}

impl WebhookHandler for IssueTrackerHandler {
    fn meta(&self) -> HandlerMeta {
        HandlerMeta {
            name: "issue-tracker",
            path: "/webhooks/issue-tracker",
            description: "Ticket lifecycle events from the issue tracker",
            enabled: true,
        }
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8], secrets: &WebhookSecrets) -> Result<()> {
        let Some(secret) = secrets.issue_tracker_secret.as_deref() else {
            return Ok(());
        };
        let presented =
            header_str(headers, SIGNATURE_HEADER).ok_or(MendError::SignatureRejected)?;
        if verify_hmac_hex(presented, secret, body) {
            Ok(())
        } else {
            Err(MendError::SignatureRejected)
        }
    }

    fn parse(&self, body: &[u8], _headers: &HeaderMap) -> Result<Option<NormalizedEvent>> {
        let payload: TicketPayload = serde_json::from_slice(body)
            .map_err(|e| MendError::Validation(format!("malformed issue-tracker payload: {e}")))?;

        if !matches!(
            payload.action.as_str(),
            "ticket-created" | "ticket-updated" | "ticket-labeled" | "ticket-transitioned"
        ) {
            return Ok(None);
        }

        let kind_hint = kind_for_labels(&payload.ticket.labels);
        let priority = priority_for(payload.ticket.priority.as_deref());

        Ok(Some(NormalizedEvent {
            provider: Provider::IssueTracker,
            organization_id: payload.organization,
            event_id: payload.event_id,
            actor: payload.actor,
            repo: payload.ticket.repository,
            reference: Some(payload.ticket.key),
            body: None,
            task_id: None,
            kind_hint,
            priority,
        }))
    }

    fn handle(&self, event: &NormalizedEvent) -> WebhookAction {
        let Some(kind) = event.kind_hint else {
            return WebhookAction::Ignored {
                reason: "ticket carries no agent label",
            };
        };
        let Some(repo) = event.repo.clone() else {
            return WebhookAction::Ignored {
                reason: "ticket names no repository",
            };
        };

        let mut target = Target::new(repo);
        if let Some(reference) = event.reference.clone() {
            target = target.with_reference(reference);
        }
        WebhookAction::EnqueueTask {
            kind,
            target,
            priority: event.priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::webhooks::hmac_sha256_hex;
    use axum::http::HeaderValue;

    fn payload() -> serde_json::Value {
        serde_json::json!({
            "event_id": "evt-42",
            "organization": "acme",
            "action": "ticket-labeled",
            "ticket": {
                "key": "PROJ-42",
                "labels": ["AI-Fix"],
                "repository": "acme/widgets",
                "priority": "high"
            },
            "actor": "alice"
        })
    }

    #[test]
    fn labeled_ticket_enqueues_fix_with_mapped_priority() {
        let handler = IssueTrackerHandler;
        let event = handler
            .parse(payload().to_string().as_bytes(), &HeaderMap::new())
            .unwrap()
            .unwrap();
        assert_eq!(event.reference.as_deref(), Some("PROJ-42"));

        match handler.handle(&event) {
            WebhookAction::EnqueueTask {
                kind,
                target,
                priority,
            } => {
                assert_eq!(kind, TaskKind::Fix);
                assert_eq!(target.repo, "acme/widgets");
                assert_eq!(target.reference.as_deref(), Some("PROJ-42"));
                assert_eq!(priority, Priority::High);
            }
            other => panic!("expected EnqueueTask, got {other:?}"),
        }
    }

    #[test]
    fn ticket_without_agent_label_is_ignored() {
        let mut body = payload();
        body["ticket"]["labels"] = serde_json::json!(["triage"]);
        let handler = IssueTrackerHandler;
        let event = handler
            .parse(body.to_string().as_bytes(), &HeaderMap::new())
            .unwrap()
            .unwrap();
        assert!(matches!(
            handler.handle(&event),
            WebhookAction::Ignored { .. }
        ));
    }

    #[test]
    fn signature_is_optional_but_checked_when_configured() {
        let handler = IssueTrackerHandler;
        let body = payload().to_string();

        let mut no_secret = Config::for_tests().webhooks;
        no_secret.issue_tracker_secret = None;
        assert!(handler
            .verify(&HeaderMap::new(), body.as_bytes(), &no_secret)
            .is_ok());

        let secrets = Config::for_tests().webhooks;
        assert!(handler
            .verify(&HeaderMap::new(), body.as_bytes(), &secrets)
            .is_err());

        let mut headers = HeaderMap::new();
        let signature = hmac_sha256_hex("issue-tracker-secret", body.as_bytes());
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&signature).unwrap());
        assert!(handler.verify(&headers, body.as_bytes(), &secrets).is_ok());
    }

    #[test]
    fn enrich_label_maps_to_enrich_kind() {
        let mut body = payload();
        body["ticket"]["labels"] = serde_json::json!(["ai-enrich"]);
        let handler = IssueTrackerHandler;
        let event = handler
            .parse(body.to_string().as_bytes(), &HeaderMap::new())
            .unwrap()
            .unwrap();
        assert!(matches!(
            handler.handle(&event),
            WebhookAction::EnqueueTask {
                kind: TaskKind::Enrich,
                ..
            }
        ));
    }
}
