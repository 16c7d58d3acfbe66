//! # Fleet Core
//!
//! Fleet Core is a durable task lifecycle, continuation, and
//! agent-to-agent orchestration engine for fleets of autonomous
//! agent workers sharing a filesystem-backed workspace.
//!
//! ## Architecture
//!
//! - **Task Lifecycle Engine** (`tasks`): per-agent task files, the
//!   Stop Guard, and the operations that drive a task from creation
//!   to completion or backlog pick-up.
//! - **Continuation Controller** (`continuation`): keeps an agent
//!   working across model turns without human nudging.
//! - **A2A Flow Orchestrator** (`a2a`): structured agent-to-agent
//!   request/response turns with a concurrency gate and a durable
//!   job store.
//! - **Monitor** (`monitor`): an HTTP+WS surface for observing the
//!   above from outside the process.
//!
//! Ambient concerns (locking, eventing, configuration, milestone
//! sync) are split into their own modules so the lifecycle/
//! continuation/A2A modules stay focused on orchestration logic.

pub mod a2a;
pub mod auth;
pub mod config;
pub mod constants;
pub mod continuation;
pub mod error;
pub mod events;
pub mod locking;
pub mod milestone;
pub mod monitor;
pub mod rate_limit;
pub mod session;
pub mod tasks;
pub mod validation;

pub use error::{FleetError, Result};
