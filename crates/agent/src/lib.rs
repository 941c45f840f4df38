//! Agent Runtime - the autonomous outreach loop and its collaborators
//!
//! This crate wires the deterministic rules in `cadence-core` to the outside world:
//! - Generates email bodies and classifies replies through a pluggable LLM client
//! - Delivers mail over SMTP
//! - Runs queued sends on a bounded worker pool with delayed retries
//! - Drives cycles, inbox polling and health checks from a scheduler
//!
//! # Architecture
//!
//! The agent follows a two-phase loop:
//! 1. **Cycle** (`runner`) - gate checks, quota sizing, decisions, pending queue rows
//! 2. **Execution** (`executor`, `queue`) - claim the row, generate, send, record
//!
//! Operators reach both through `control`; the daemon drives them through `scheduler`.
//!
//! # Safety Principle
//!
//! The LLM only writes prose. Whether, when and to whom an email goes out is decided by
//! the core rules and the queue row, never by model output.

pub mod control;
pub mod executor;
pub mod llm;
pub mod mail;
pub mod prompt;
pub mod queue;
pub mod replies;
pub mod runner;
pub mod runtime;
pub mod scheduler;
pub mod stores;

#[cfg(test)]
mod testing;

pub use control::{AgentControl, ControlError};
pub use executor::SendExecutor;
pub use queue::{TaskQueue, WorkerPool};
pub use runner::{AgentRunner, CycleReport, CycleStatus};
pub use runtime::{AgentRuntime, RuntimeError};
pub use scheduler::AgentScheduler;
pub use stores::AgentStores;
