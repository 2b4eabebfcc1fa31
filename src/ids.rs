use crate::models::{Origin, Target};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Task-id generator.
///
/// Ids sort roughly by creation time (millisecond prefix plus a process
/// counter) and carry uuid entropy so two processes can mint ids without
/// coordination.
#[derive(Debug, Default)]
pub struct TaskIdGenerator {
    counter: AtomicU64,
}

impl TaskIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> String {
        let millis = chrono::Utc::now().timestamp_millis();
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let entropy = Uuid::new_v4().simple().to_string();
        format!("t-{millis}-{seq:04}-{}", &entropy[..8])
    }
}

/// Deterministic digest identifying a task's origin + target.
///
/// The same provider event aimed at the same target always produces the
/// same fingerprint, which is what dedup keys on. The digest covers the
/// provider, organization, event id, repo, and reference, each
/// length-delimited so field boundaries cannot collide.
pub fn fingerprint(origin: &Origin, target: &Target) -> String {
    let mut hasher = Sha256::new();
    for field in [
        origin.provider.to_string().as_str(),
        origin.organization_id.as_str(),
        origin.event_id.as_str(),
        target.repo.as_str(),
        target.reference.as_deref().unwrap_or(""),
    ] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    let digest = hasher.finalize();
    hex_encode(&digest[..16])
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Session ids for runner invocations.
pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;

    fn origin(event: &str) -> Origin {
        Origin {
            provider: Provider::IssueTracker,
            organization_id: "acme".to_string(),
            event_id: event.to_string(),
            actor: Some("alice".to_string()),
        }
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let target = Target::new("acme/widgets").with_reference("PROJ-42");
        assert_eq!(
            fingerprint(&origin("ev-1"), &target),
            fingerprint(&origin("ev-1"), &target)
        );
    }

    #[test]
    fn fingerprint_distinguishes_origin_and_target() {
        let target = Target::new("acme/widgets");
        assert_ne!(
            fingerprint(&origin("ev-1"), &target),
            fingerprint(&origin("ev-2"), &target)
        );
        assert_ne!(
            fingerprint(&origin("ev-1"), &Target::new("acme/widgets")),
            fingerprint(&origin("ev-1"), &Target::new("acme/gadgets"))
        );
    }

    #[test]
    fn fingerprint_ignores_actor() {
        let target = Target::new("acme/widgets");
        let mut other = origin("ev-1");
        other.actor = Some("bob".to_string());
        assert_eq!(
            fingerprint(&origin("ev-1"), &target),
            fingerprint(&other, &target)
        );
    }

    #[test]
    fn ids_are_unique() {
        let generator = TaskIdGenerator::new();
        let a = generator.next_id();
        let b = generator.next_id();
        assert_ne!(a, b);
        assert!(a.starts_with("t-"));
    }
}
