//! A2A Flow Orchestrator: durable multi-turn agent-to-agent conversations,
//! wired to the concurrency gate, job store, and the owning task's
//! delegation record.

use super::gate::ConcurrencyGate;
use super::intent::{classify_intent, detect_early_termination, effective_turns, Intent, TerminationReason};
use super::job_store::{JobRecord, JobStatus, JobStore};
use crate::continuation::failure::backoff_for_attempt;
use crate::events::{Event, EventBus};
use crate::tasks::delegation::{update_delegation, Delegation, DelegationStatus};
use crate::tasks::store::TaskStore;
use crate::validation::parse_structured_payload;
use crate::{constants, Result};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyPoll {
    Ok(String),
    NotFound,
    Error(String),
    Pending,
    Transient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    pub reply: Option<String>,
    pub skip: bool,
}

/// The actual agent-step I/O the orchestrator drives. Injected so the
/// control flow above (retry/backoff, intent, termination) is testable
/// without a real agent runtime, the same way `MilestoneSync` is injected
/// into task completion.
#[async_trait]
pub trait AgentTurnRunner: Send + Sync {
    async fn poll_round_one_reply(&self, target_session_key: &str, conversation_id: &str) -> ReplyPoll;
    async fn run_turn(
        &self,
        target_session_key: &str,
        role: TurnRole,
        turn_index: u32,
        intent: Intent,
        prior_replies: &[String],
    ) -> TurnOutcome;
    async fn announce(&self, target_session_key: &str, summary: &str) -> bool;
}

#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub from_agent: String,
    pub target_session_key: String,
    pub requester_session_key: Option<String>,
    pub message: String,
    pub conversation_id: String,
    pub max_ping_pong_turns: u32,
    pub payload: Option<serde_json::Value>,
    pub round_one_reply: Option<String>,
    pub task_id: Option<String>,
    pub max_retries: u32,
    pub announce_target: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub configured_max_turns: u32,
    pub effective_turns: u32,
    pub actual_turns: u32,
    pub early_termination: bool,
    pub termination_reason: Option<TerminationReason>,
    pub announced: bool,
    pub blocked_cause: Option<String>,
}

pub struct FlowOrchestrator {
    gate: ConcurrencyGate,
    jobs: JobStore,
    events: EventBus,
    tasks: TaskStore,
    round_one_poll_chunk: Duration,
    round_one_max_wait: Duration,
}

fn is_subagent_key(session_key: &str) -> bool {
    session_key.contains(":subagent:")
}

impl FlowOrchestrator {
    pub fn new(gate: ConcurrencyGate, jobs: JobStore, events: EventBus, tasks: TaskStore) -> Self {
        FlowOrchestrator {
            gate,
            jobs,
            events,
            tasks,
            round_one_poll_chunk: constants::A2A_ROUND_ONE_POLL_CHUNK,
            round_one_max_wait: constants::A2A_ROUND_ONE_MAX_WAIT,
        }
    }

    /// Overrides round-1 wait timing; used by tests to avoid real 5-minute waits.
    pub fn with_round_one_timing(mut self, poll_chunk: Duration, max_wait: Duration) -> Self {
        self.round_one_poll_chunk = poll_chunk;
        self.round_one_max_wait = max_wait;
        self
    }

    pub async fn run_flow(&self, req: FlowRequest, runner: &dyn AgentTurnRunner) -> Result<FlowOutcome> {
        let job_id = format!("job_{}", uuid::Uuid::new_v4().simple());
        let mut job = JobRecord::new(
            job_id.clone(),
            req.target_session_key.clone(),
            req.target_session_key.clone(),
            req.message.clone(),
            req.conversation_id.clone(),
            req.max_ping_pong_turns,
        );
        job.requester_session_key = req.requester_session_key.clone();
        job.task_id = req.task_id.clone();
        job.status = JobStatus::Running;
        self.jobs.create(&job).await?;

        let permit = self.gate.acquire(&req.from_agent, &job_id).await?;

        let event_role = if is_subagent_key(&req.target_session_key) || req.requester_session_key.as_deref().map(is_subagent_key).unwrap_or(false) {
            "delegation.subagent"
        } else {
            "conversation.main"
        };
        self.events
            .emit(Event::new(
                "a2a.send",
                Some(req.from_agent.clone()),
                json!({
                    "fromAgent": req.from_agent,
                    "toAgent": req.target_session_key,
                    "messageExcerpt": excerpt(&req.message),
                    "conversationId": req.conversation_id,
                    "eventRole": event_role,
                }),
            ))
            .await;

        let outcome = self.run_flow_body(&mut job, &req, runner).await;

        permit.release();

        match &outcome {
            Ok(o) => {
                job.status = o.status;
                job.current_turn = o.actual_turns;
            }
            Err(e) => {
                job.status = JobStatus::Failed;
                job.last_error = Some(e.to_string());
            }
        }
        self.jobs.save(job.clone()).await?;

        if let (Some(task_id), Ok(flow_outcome)) = (&req.task_id, &outcome) {
            self.wire_delegation(&req.from_agent, task_id, &req, flow_outcome).await?;
        }

        outcome
    }

    async fn run_flow_body(
        &self,
        job: &mut JobRecord,
        req: &FlowRequest,
        runner: &dyn AgentTurnRunner,
    ) -> Result<FlowOutcome> {
        let payload = req.payload.as_ref().and_then(parse_structured_payload);
        let intent = classify_intent(payload.as_ref(), &req.message);

        let round_one = self.wait_for_round_one_reply(req, runner).await;

        let Some(first_reply) = round_one else {
            self.events
                .emit(Event::new(
                    "a2a.complete",
                    Some(req.from_agent.clone()),
                    json!({
                        "jobId": job.job_id,
                        "announced": false,
                        "outcome": "blocked",
                        "cause": "no reply received",
                    }),
                ))
                .await;
            return Ok(FlowOutcome {
                job_id: job.job_id.clone(),
                status: JobStatus::Done,
                configured_max_turns: req.max_ping_pong_turns,
                effective_turns: 0,
                actual_turns: 0,
                early_termination: false,
                termination_reason: None,
                announced: false,
                blocked_cause: Some("no reply received".into()),
            });
        };

        let mut replies = vec![first_reply];
        let turns = effective_turns(req.max_ping_pong_turns, intent);

        let mut actual_turns = 0;
        let mut early_termination = false;
        let mut termination_reason = None;

        for turn_index in 1..=turns {
            let role = if turn_index % 2 == 0 { TurnRole::Sender } else { TurnRole::Receiver };
            let turn = runner
                .run_turn(&req.target_session_key, role, turn_index, intent, &replies)
                .await;

            if turn.skip || turn.reply.as_deref().map(str::is_empty).unwrap_or(true) {
                break;
            }
            let reply = turn.reply.unwrap();
            actual_turns += 1;

            if let Some(reason) = detect_early_termination(&reply, &replies) {
                early_termination = true;
                termination_reason = Some(reason);
                self.events
                    .emit(Event::new(
                        "a2a.response",
                        Some(req.from_agent.clone()),
                        json!({ "jobId": job.job_id, "turn": turn_index, "terminationReason": format!("{reason:?}") }),
                    ))
                    .await;
                replies.push(reply);
                break;
            }

            self.events
                .emit(Event::new(
                    "a2a.response",
                    Some(req.from_agent.clone()),
                    json!({ "jobId": job.job_id, "turn": turn_index }),
                ))
                .await;
            replies.push(reply);
        }

        let announced = if let Some(target) = &req.announce_target {
            let summary = replies.last().cloned().unwrap_or_default();
            runner.announce(target, &summary).await
        } else {
            false
        };

        self.events
            .emit(Event::new(
                "a2a.complete",
                Some(req.from_agent.clone()),
                json!({
                    "jobId": job.job_id,
                    "configuredMaxTurns": req.max_ping_pong_turns,
                    "effectiveTurns": turns,
                    "actualTurns": actual_turns,
                    "earlyTermination": early_termination,
                    "terminationReason": termination_reason.map(|r| format!("{r:?}")),
                    "announceSkipped": req.announce_target.is_none(),
                }),
            ))
            .await;

        Ok(FlowOutcome {
            job_id: job.job_id.clone(),
            status: JobStatus::Done,
            configured_max_turns: req.max_ping_pong_turns,
            effective_turns: turns,
            actual_turns,
            early_termination,
            termination_reason,
            announced,
            blocked_cause: None,
        })
    }

    async fn wait_for_round_one_reply(&self, req: &FlowRequest, runner: &dyn AgentTurnRunner) -> Option<String> {
        if let Some(reply) = &req.round_one_reply {
            return Some(reply.clone());
        }

        let deadline = tokio::time::Instant::now() + self.round_one_max_wait;
        let mut retry_attempt = 0u32;

        loop {
            match runner.poll_round_one_reply(&req.target_session_key, &req.conversation_id).await {
                ReplyPoll::Ok(text) => return Some(text),
                ReplyPoll::NotFound | ReplyPoll::Error(_) => return None,
                ReplyPoll::Transient(reason) => {
                    if retry_attempt >= constants::A2A_MAX_RETRIES {
                        return None;
                    }
                    self.events
                        .emit(Event::new(
                            "a2a.retry",
                            Some(req.from_agent.clone()),
                            json!({ "conversationId": req.conversation_id, "attempt": retry_attempt, "reason": reason }),
                        ))
                        .await;
                    let delay = backoff_for_attempt(constants::A2A_RETRY_BASE, retry_attempt);
                    retry_attempt += 1;
                    sleep(delay).await;
                }
                ReplyPoll::Pending => {
                    if tokio::time::Instant::now() >= deadline {
                        return None;
                    }
                    sleep(self.round_one_poll_chunk).await;
                }
            }
        }
    }

    async fn wire_delegation(
        &self,
        agent_id: &str,
        task_id: &str,
        req: &FlowRequest,
        outcome: &FlowOutcome,
    ) -> Result<()> {
        let Some(mut task) = self.tasks.read(agent_id, task_id).await else {
            return Ok(());
        };

        let delegation = Delegation::new(
            req.target_session_key.clone(),
            req.target_session_key.clone(),
            req.message.clone(),
            req.max_retries,
        );
        let delegation_id = delegation.delegation_id.clone();
        task.delegations.push(delegation);

        if outcome.blocked_cause.is_none() {
            if let Some(d) = task.delegations.iter_mut().find(|d| d.delegation_id == delegation_id) {
                let _ = update_delegation(d, DelegationStatus::Running, None);
            }
        }

        self.tasks.write(agent_id, &mut task).await
    }
}

fn excerpt(message: &str) -> String {
    message.chars().take(120).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    struct ScriptedRunner {
        round_one: ReplyPoll,
        turn_replies: Vec<&'static str>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl AgentTurnRunner for ScriptedRunner {
        async fn poll_round_one_reply(&self, _: &str, _: &str) -> ReplyPoll {
            self.round_one.clone()
        }

        async fn run_turn(&self, _: &str, _: TurnRole, turn_index: u32, _: Intent, _: &[String]) -> TurnOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.turn_replies.get((turn_index - 1) as usize) {
                Some(reply) => TurnOutcome { reply: Some(reply.to_string()), skip: false },
                None => TurnOutcome { reply: None, skip: true },
            }
        }

        async fn announce(&self, _: &str, _: &str) -> bool {
            true
        }
    }

    fn orchestrator(dir: &TempDir) -> FlowOrchestrator {
        FlowOrchestrator::new(
            ConcurrencyGate::new(),
            JobStore::new(dir.path()),
            EventBus::new(),
            TaskStore::new(dir.path()),
        )
        .with_round_one_timing(Duration::from_millis(5), Duration::from_millis(50))
    }

    fn request() -> FlowRequest {
        FlowRequest {
            from_agent: "agent-a".into(),
            target_session_key: "agent:b:main".into(),
            requester_session_key: Some("agent:a:main".into()),
            message: "please collaborate on this".into(),
            conversation_id: "conv_1".into(),
            max_ping_pong_turns: 3,
            payload: None,
            round_one_reply: None,
            task_id: None,
            max_retries: 1,
            announce_target: None,
        }
    }

    #[tokio::test]
    async fn no_reply_within_deadline_completes_blocked() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let runner = ScriptedRunner { round_one: ReplyPoll::Pending, turn_replies: vec![], calls: AtomicU32::new(0) };

        let outcome = orch.run_flow(request(), &runner).await.unwrap();
        assert_eq!(outcome.blocked_cause.as_deref(), Some("no reply received"));
        assert_eq!(outcome.actual_turns, 0);
    }

    #[tokio::test]
    async fn ping_pong_runs_until_receiver_skips() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let runner = ScriptedRunner {
            round_one: ReplyPoll::Ok("sure, let's do it".into()),
            turn_replies: vec!["working on it", "almost there"],
            calls: AtomicU32::new(0),
        };

        let outcome = orch.run_flow(request(), &runner).await.unwrap();
        assert_eq!(outcome.actual_turns, 2);
        assert!(!outcome.early_termination);
        assert!(outcome.actual_turns <= outcome.effective_turns);
        assert!(outcome.effective_turns <= outcome.configured_max_turns);
    }

    #[tokio::test]
    async fn early_termination_on_completion_marker_stops_loop() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let runner = ScriptedRunner {
            round_one: ReplyPoll::Ok("starting now".into()),
            turn_replies: vec!["task complete, all done", "should never run"],
            calls: AtomicU32::new(0),
        };

        let outcome = orch.run_flow(request(), &runner).await.unwrap();
        assert!(outcome.early_termination);
        assert_eq!(outcome.termination_reason, Some(TerminationReason::CompletionMarker));
        assert_eq!(outcome.actual_turns, 1);
    }

    #[tokio::test]
    async fn delegation_is_recorded_on_owning_task() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let runner = ScriptedRunner { round_one: ReplyPoll::Ok("ok".into()), turn_replies: vec![], calls: AtomicU32::new(0) };

        let task_store = TaskStore::new(dir.path());
        let mut task = crate::tasks::Task::new(
            crate::tasks::new_task_id(),
            "parent task".into(),
            crate::tasks::Priority::Medium,
            false,
        );
        let task_id = task.id.clone();
        task_store.write("agent-a", &mut task).await.unwrap();

        let mut req = request();
        req.task_id = Some(task_id.clone());
        orch.run_flow(req, &runner).await.unwrap();

        let reloaded = task_store.read("agent-a", &task_id).await.unwrap();
        assert_eq!(reloaded.delegations.len(), 1);
        assert_eq!(reloaded.delegations[0].status, DelegationStatus::Running);
    }
}
