//! # Mend Core
//!
//! Mend Core is an autonomous bug-fixing orchestrator: signed webhooks
//! from the code host, issue tracker, chat, and error reporter are
//! classified into typed tasks, queued through a human-gated two-stage
//! pipeline (planning → approval → execution), and executed by an LLM
//! command-line tool whose output streams back to the original
//! collaboration surfaces.
//!
//! ## Architecture
//!
//! - **Webhook dispatcher**: signature-verified intake that normalizes
//!   provider events into tasks or commands
//! - **Priority queue**: two named queues with claim/ack/nack,
//!   visibility deadlines, and fingerprint dedup
//! - **Task lifecycle**: the one component allowed to move task status,
//!   with optimistic concurrency against the store
//! - **Agent worker**: claims queue items, prepares a cached working
//!   copy, and drives the runner subprocess
//! - **Log channel**: bounded per-task output history with offset reads
//! - **Read API**: the dashboard's HTTP surface
//!
//! The LLM tool itself, provider REST clients, and the dashboard UI are
//! external collaborators behind narrow interfaces.

/// Agent worker and runner subprocess client
pub mod agent;
/// Read API for the dashboard
pub mod api;
/// Collaborator interfaces (code host, chat, issue tracker)
pub mod collab;
/// Command parser and router for comment/chat text
pub mod commands;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Task ids, fingerprints, and session ids
pub mod ids;
/// Error types and handling
pub mod error;
/// Task state machine and side-effect fan-out
pub mod lifecycle;
/// Per-task bounded log channel
pub mod logs;
/// Core data models
pub mod models;
/// Metric counters and health
pub mod monitoring;
/// Two-stage priority work queue
pub mod queue;
/// Repository working-copy cache
pub mod repocache;
/// Durable task store
pub mod store;
/// Token broker for provider credentials
pub mod tokens;
/// Webhook registry and dispatcher
pub mod webhooks;

#[cfg(test)]
mod tests;

pub use error::{MendError, Result};
