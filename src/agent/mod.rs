//! The agent worker: claims queue items, prepares a working copy,
//! drives the LLM CLI subprocess, and feeds the outcome back through
//! the state machine.

mod runner;
mod worker;

pub use runner::{RunnerClient, RunnerInvocation, RunnerResult};
pub use worker::Worker;
