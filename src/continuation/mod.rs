//! The Continuation Controller: keeps an agent working across model turns
//! without a human nudging it, layering a synchronous Stop Guard
//! (`tasks::lifecycle`) with self-driving, event, polling, and
//! zombie-recovery continuation strategies.

pub mod failure;
pub mod polling;
pub mod self_drive;

pub use failure::{classify_failure, FailureReason, FailureTracker};
pub use polling::{poll_action, PollAction};
pub use self_drive::{EscalationReason, SelfDriveAction, SelfDriveState};

use crate::events::{Event, EventBus};
use crate::tasks::store::TaskStore;
use crate::tasks::TaskStatus;
use crate::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Coordinates the four continuation layers against a shared task store and
/// event bus. One instance is shared across the whole fleet; per-agent state
/// lives in its internal maps.
#[derive(Clone)]
pub struct ContinuationController {
    store: TaskStore,
    events: EventBus,
    self_drive: Arc<Mutex<HashMap<String, SelfDriveState>>>,
    failures: Arc<Mutex<HashMap<(String, String), FailureTracker>>>,
    last_continuation_sent: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl ContinuationController {
    pub fn new(store: TaskStore, events: EventBus) -> Self {
        ContinuationController {
            store,
            events,
            self_drive: Arc::new(Mutex::new(HashMap::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            last_continuation_sent: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// `lifecycle:start` for `agent_id`: cancels any pending self-drive
    /// escalation state, same as a fresh work session.
    pub async fn on_lifecycle_start(&self, agent_id: &str) {
        let mut states = self.self_drive.lock().await;
        states.entry(agent_id.to_string()).or_default().on_lifecycle_start();
    }

    /// `lifecycle:end` for `agent_id`'s main session. Applies layer B's
    /// grace delay before emitting, so a fast subsequent `lifecycle:start`
    /// (the agent resuming on its own) suppresses it.
    pub async fn on_lifecycle_end(&self, agent_id: &str) -> Result<SelfDriveAction> {
        let Some(task) = self.store.find_active(agent_id).await? else {
            return Ok(SelfDriveAction::None);
        };

        sleep(std::time::Duration::from_millis(crate::constants::SELF_DRIVE_GRACE_DELAY_MS)).await;

        let action = {
            let mut states = self.self_drive.lock().await;
            let state = states.entry(agent_id.to_string()).or_default();
            state.on_lifecycle_end(&task, Utc::now())
        };

        match &action {
            SelfDriveAction::Continue { prompt } => {
                self.events
                    .emit(Event::new(
                        "continuation.self_drive",
                        Some(agent_id.to_string()),
                        json!({ "taskId": task.id, "prompt": prompt }),
                    ))
                    .await;
            }
            SelfDriveAction::Escalate { reason } => {
                self.events
                    .emit(Event::new(
                        "continuation.escalated",
                        Some(agent_id.to_string()),
                        json!({ "taskId": task.id, "reason": format!("{reason:?}") }),
                    ))
                    .await;
            }
            SelfDriveAction::None => {}
        }

        Ok(action)
    }

    /// Records a delegation or tool-call failure for `(agent_id, task_id)`
    /// and returns the delay to wait before the next retry.
    pub async fn record_failure(
        &self,
        agent_id: &str,
        task_id: &str,
        error_text: &str,
    ) -> std::time::Duration {
        let mut failures = self.failures.lock().await;
        failures
            .entry((agent_id.to_string(), task_id.to_string()))
            .or_default()
            .record_failure(error_text)
    }

    pub async fn record_success(&self, agent_id: &str, task_id: &str) {
        let mut failures = self.failures.lock().await;
        if let Some(tracker) = failures.get_mut(&(agent_id.to_string(), task_id.to_string())) {
            tracker.record_success();
        }
    }

    /// One polling sweep (layer D/E) over every non-terminal task belonging
    /// to `agent_id`. `agent_queue_empty` reflects whether that agent has
    /// other queued work competing for its attention.
    pub async fn poll_agent(&self, agent_id: &str, agent_queue_empty: bool) -> Result<Vec<PollAction>> {
        let mut actions = Vec::new();
        let tasks = self.store.list(agent_id, None).await?;
        let now = Utc::now();

        for mut task in tasks {
            if task.status.is_terminal() {
                continue;
            }

            let last_sent = {
                let sent = self.last_continuation_sent.lock().await;
                sent.get(&task.id).copied()
            };

            let action = poll_action(&task, agent_queue_empty, last_sent, now);
            self.apply_poll_action(agent_id, &mut task, &action, now).await?;
            actions.push(action);
        }

        Ok(actions)
    }

    async fn apply_poll_action(
        &self,
        agent_id: &str,
        task: &mut crate::tasks::Task,
        action: &PollAction,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match action {
            PollAction::None => {}
            PollAction::Continue { prompt } => {
                self.last_continuation_sent.lock().await.insert(task.id.clone(), now);
                self.events
                    .emit(Event::new(
                        "continuation.poll",
                        Some(agent_id.to_string()),
                        json!({ "taskId": task.id, "prompt": prompt }),
                    ))
                    .await;
            }
            PollAction::Unblock { next_unblocker } => {
                if let Some(blocking) = &mut task.blocking {
                    blocking.unblock_request_count += 1;
                    blocking.last_unblocker_index =
                        Some(blocking.unblocked_by.iter().position(|id| id == next_unblocker).unwrap_or(0));
                    blocking.last_unblock_request_at = Some(now);
                }
                self.store.write(agent_id, task).await?;
                self.events
                    .emit(Event::new(
                        "continuation.unblock_requested",
                        Some(agent_id.to_string()),
                        json!({ "taskId": task.id, "unblocker": next_unblocker }),
                    ))
                    .await;
            }
            PollAction::UnblockEscalated => {
                if let Some(blocking) = &mut task.blocking {
                    blocking.escalation_state = crate::tasks::EscalationState::Escalated;
                }
                self.store.write(agent_id, task).await?;
                self.events
                    .emit(Event::new(
                        "continuation.unblock_escalated",
                        Some(agent_id.to_string()),
                        json!({ "taskId": task.id }),
                    ))
                    .await;
            }
            PollAction::BacklogRecover { reassign_count } => {
                task.status = TaskStatus::Backlog;
                if let Some(backlog) = &mut task.backlog {
                    backlog.reassign_count = *reassign_count;
                }
                self.store.write(agent_id, task).await?;
                self.store.update_current_task_pointer(agent_id, None).await?;
                self.events
                    .emit(Event::new(
                        "continuation.zombie_recovered",
                        Some(agent_id.to_string()),
                        json!({ "taskId": task.id, "reassignCount": reassign_count }),
                    ))
                    .await;
            }
            PollAction::Abandon => {
                task.status = TaskStatus::Abandoned;
                self.store.write(agent_id, task).await?;
                self.store.update_current_task_pointer(agent_id, None).await?;
                self.events
                    .emit(Event::new(
                        "continuation.zombie_abandoned",
                        Some(agent_id.to_string()),
                        json!({ "taskId": task.id }),
                    ))
                    .await;
            }
        }
        Ok(())
    }
}
