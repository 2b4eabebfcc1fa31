use crate::{
    commands::Surface,
    config::WebhookSecrets,
    models::{Priority, Provider},
    webhooks::{
        constant_time_eq, header_str, hmac_sha256_hex, HandlerMeta, HandlerRegistry,
        NormalizedEvent, WebhookAction, WebhookHandler,
    },
    MendError, Result,
};
use axum::http::HeaderMap;
use serde::Deserialize;
use std::sync::Arc;

const TIMESTAMP_HEADER: &str = "x-chat-request-timestamp";
const SIGNATURE_HEADER: &str = "x-chat-signature";

/// Requests older than this are replays.
const MAX_SKEW_SECS: i64 = 300;

pub fn register(registry: &mut HandlerRegistry) {
    registry.add(Arc::new(ChatHandler));
}

/// Command invocations and interactive actions from the chat service.
/// Signature: the vendor's timestamp+signature scheme - HMAC-SHA256 over
/// `v0:<timestamp>:<body>`, presented as `v0=<hex>`, with a freshness
/// window.
pub struct ChatHandler;

#[derive(Debug, Deserialize)]
struct ChatPayload {
    event_id: String,
    team_id: String,
    #[serde(rename = "type")]
    event_type: String,
    user: String,
    text: String,
    #[serde(default)]
    channel: Option<String>,
}

/// Chat text can address a task or repo directly: `task:<id>`,
/// `repo:<owner/name>`, `ref:<reference>` tokens are lifted out of the
/// text before command parsing.
fn extract_tokens(text: &str) -> (String, Option<String>, Option<String>, Option<String>) {
    let mut task_id = None;
    let mut repo = None;
    let mut reference = None;
    let mut rest = Vec::new();

    for word in text.split_whitespace() {
        if let Some(v) = word.strip_prefix("task:") {
            task_id = Some(v.to_string());
        } else if let Some(v) = word.strip_prefix("repo:") {
            repo = Some(v.to_string());
        } else if let Some(v) = word.strip_prefix("ref:") {
            reference = Some(v.to_string());
        } else {
            rest.push(word);
        }
    }
    (rest.join(" "), task_id, repo, reference)
}

impl WebhookHandler for ChatHandler {
    fn meta(&self) -> HandlerMeta {
        HandlerMeta {
            name: "chat",
            path: "/webhooks/chat",
            description: "Command invocations and button actions from chat",
            enabled: true,
        }
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8], secrets: &WebhookSecrets) -> Result<()> {
        let secret = secrets
            .chat_signing_secret
            .as_deref()
            .ok_or(MendError::SignatureRejected)?;

        let timestamp = header_str(headers, TIMESTAMP_HEADER)
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or(MendError::SignatureRejected)?;
        let skew = (chrono::Utc::now().timestamp() - timestamp).abs();
        if skew > MAX_SKEW_SECS {
            return Err(MendError::SignatureRejected);
        }

        let presented = header_str(headers, SIGNATURE_HEADER)
            .and_then(|v| v.strip_prefix("v0="))
            .ok_or(MendError::SignatureRejected)?;

        let mut message = format!("v0:{timestamp}:").into_bytes();
        message.extend_from_slice(body);
        let expected = hmac_sha256_hex(secret, &message);
        if constant_time_eq(presented.trim(), &expected) {
            Ok(())
        } else {
            Err(MendError::SignatureRejected)
        }
    }

    fn parse(&self, body: &[u8], _headers: &HeaderMap) -> Result<Option<NormalizedEvent>> {
        let payload: ChatPayload = serde_json::from_slice(body)
            .map_err(|e| MendError::Validation(format!("malformed chat payload: {e}")))?;

        if !matches!(payload.event_type.as_str(), "app_mention" | "message" | "block_action") {
            return Ok(None);
        }

        let (text, task_id, repo, reference) = extract_tokens(&payload.text);
        let reference = reference.or(payload.channel.clone());

        Ok(Some(NormalizedEvent {
            provider: Provider::Chat,
            organization_id: payload.team_id,
            event_id: payload.event_id,
            actor: Some(payload.user),
            repo,
            reference,
            body: Some(text),
            task_id,
            kind_hint: None,
            priority: Priority::Normal,
        }))
    }

    fn handle(&self, _event: &NormalizedEvent) -> WebhookAction {
        WebhookAction::Command {
            surface: Surface::Chat,
        }
    }
}
