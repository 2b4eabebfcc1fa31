//! Built-in webhook handlers, one per collaborator surface. Each module
//! exposes a `register` hook appended to the boot-time registry.

pub mod chat;
pub mod code_host;
pub mod error_reporter;
pub mod issue_tracker;
