//! Agent-to-agent flow orchestration: a per-agent concurrency gate, a
//! durable job store with startup reaper, and the flow orchestrator that
//! drives a structured multi-turn conversation between two agent sessions.

pub mod gate;
pub mod intent;
pub mod job_store;
pub mod orchestrator;

pub use gate::{ConcurrencyGate, FlowPermit};
pub use intent::{classify_intent, effective_turns, Intent, TerminationReason};
pub use job_store::{JobRecord, JobStatus, JobStore, ReaperReport};
pub use orchestrator::{AgentTurnRunner, FlowOrchestrator, FlowOutcome, FlowRequest, ReplyPoll, TurnOutcome, TurnRole};
