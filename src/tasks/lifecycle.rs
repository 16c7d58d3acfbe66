//! Task lifecycle operations and the Stop Guard.
//!
//! Each operation acquires the per-task lock implicitly through
//! [`TaskStore::write`], re-reads current state, validates the requested
//! transition, persists, emits an event, and updates the `CURRENT_TASK`
//! pointer — mirroring the read-validate-mutate-persist-emit shape of
//! `AgentOrchestrator::execute_task`.

use super::{
    new_task_id, BacklogMetadata, BlockingMetadata, EscalationState, KnownAgents, Outcome,
    Priority, Step, StepStatus, Task, TaskStatus,
};
use crate::events::{Event, EventBus};
use crate::milestone::{sync_with_retry, MilestoneSync};
use crate::tasks::store::TaskStore;
use crate::{FleetError, Result};
use serde_json::json;
use std::sync::Arc;

/// Structured sub-step command for the Update operation.
#[derive(Debug, Clone)]
pub enum StepAction {
    SetSteps { contents: Vec<String> },
    AddStep { content: String },
    CompleteStep { id: String },
    StartStep { id: String },
    SkipStep { id: String },
    ReorderSteps { ids: Vec<String> },
}

/// Outcome of a `complete` call blocked by the Stop Guard.
#[derive(Debug, Clone)]
pub struct StopGuardBlock {
    pub remaining_steps: Vec<String>,
    pub instructions: String,
}

pub struct TaskLifecycle {
    store: TaskStore,
    events: EventBus,
    milestone: Option<Arc<dyn MilestoneSync>>,
}

impl TaskLifecycle {
    pub fn new(store: TaskStore, events: EventBus, milestone: Option<Arc<dyn MilestoneSync>>) -> Self {
        TaskLifecycle { store, events, milestone }
    }

    async fn emit(&self, event_type: &str, agent_id: &str, data: serde_json::Value) {
        self.events
            .emit(Event::new(event_type, Some(agent_id.to_string()), data))
            .await;
    }

    /// Start: creates the task, initial status per `requires_approval`.
    pub async fn start(
        &self,
        agent_id: &str,
        description: String,
        priority: Priority,
        requires_approval: bool,
    ) -> Result<Task> {
        if !requires_approval && self.store.find_active(agent_id).await?.is_some() {
            return Err(FleetError::precondition("an in-progress task already exists"));
        }
        let mut task = Task::new(new_task_id(), description, priority, requires_approval);
        self.store.write(agent_id, &mut task).await?;
        if task.status == TaskStatus::InProgress {
            self.store.update_current_task_pointer(agent_id, Some(&task.id)).await?;
        }
        self.emit("task.started", agent_id, json!({"taskId": task.id, "status": task.status})).await;
        Ok(task)
    }

    /// Update: appends a free-form progress line, or dispatches a step action.
    pub async fn update_progress(&self, agent_id: &str, task_id: &str, line: String) -> Result<Task> {
        let mut task = self.require(agent_id, task_id).await?;
        task.progress.push(line);
        task.touch();
        self.store.write(agent_id, &mut task).await?;
        Ok(task)
    }

    pub async fn update_steps(&self, agent_id: &str, task_id: &str, action: StepAction) -> Result<Task> {
        let mut task = self.require(agent_id, task_id).await?;
        apply_step_action(&mut task, action)?;
        task.touch();
        self.store.write(agent_id, &mut task).await?;
        self.emit("task.step_update", agent_id, json!({"taskId": task.id})).await;
        Ok(task)
    }

    pub async fn approve(&self, agent_id: &str, task_id: &str) -> Result<Task> {
        let mut task = self.require(agent_id, task_id).await?;
        if task.status != TaskStatus::PendingApproval {
            return Err(FleetError::precondition(format!(
                "cannot approve task in status {:?}",
                task.status
            )));
        }
        if self.store.find_active(agent_id).await?.is_some() {
            return Err(FleetError::precondition("an in-progress task already exists"));
        }
        task.status = TaskStatus::InProgress;
        task.progress.push("Task approved".to_string());
        task.touch();
        self.store.write(agent_id, &mut task).await?;
        self.store.update_current_task_pointer(agent_id, Some(&task.id)).await?;
        self.emit("task.approved", agent_id, json!({"taskId": task.id})).await;
        Ok(task)
    }

    pub async fn block(
        &self,
        agent_id: &str,
        task_id: &str,
        blocked_reason: String,
        unblocked_by: Vec<String>,
        known_agents: &KnownAgents,
    ) -> Result<Task> {
        if unblocked_by.is_empty() {
            return Err(FleetError::validation("unblock_by must be nonempty"));
        }
        let mut deduped = Vec::new();
        for id in unblocked_by {
            if id == agent_id {
                return Err(FleetError::validation("task cannot be unblocked by its own owner"));
            }
            if !known_agents.contains(&id) {
                return Err(FleetError::validation(format!("unknown agent id: {id}")));
            }
            if !deduped.contains(&id) {
                deduped.push(id);
            }
        }

        let mut task = self.require(agent_id, task_id).await?;
        task.status = TaskStatus::Blocked;
        task.blocking = Some(BlockingMetadata {
            blocked_reason,
            unblocked_by: deduped,
            unblocked_action: None,
            unblock_request_count: 0,
            last_unblocker_index: None,
            last_unblock_request_at: None,
            escalation_state: EscalationState::None,
            unblock_request_failures: None,
        });
        task.touch();
        self.store.write(agent_id, &mut task).await?;
        self.emit("task.blocked", agent_id, json!({"taskId": task.id})).await;
        Ok(task)
    }

    pub async fn resume(&self, agent_id: &str, task_id: &str) -> Result<Task> {
        let mut task = self.require(agent_id, task_id).await?;
        if task.status != TaskStatus::Blocked {
            return Err(FleetError::precondition("task is not blocked"));
        }
        if self.store.find_active(agent_id).await?.is_some() {
            return Err(FleetError::precondition("an in-progress task already exists"));
        }
        task.status = TaskStatus::InProgress;
        task.blocking = None;
        task.touch();
        self.store.write(agent_id, &mut task).await?;
        self.store.update_current_task_pointer(agent_id, Some(&task.id)).await?;
        self.emit("task.resumed", agent_id, json!({"taskId": task.id})).await;
        Ok(task)
    }

    /// Complete: runs the Stop Guard unless `force_complete`. On pass,
    /// archives to history, deletes the active file, fires milestone sync
    /// (best-effort) if linked.
    pub async fn complete(
        &self,
        agent_id: &str,
        task_id: &str,
        summary: Option<String>,
        force_complete: bool,
    ) -> std::result::Result<Task, StopGuardBlock> {
        let mut task = self
            .require(agent_id, task_id)
            .await
            .map_err(|_| StopGuardBlock { remaining_steps: vec![], instructions: "task not found".into() })?;

        let remaining = task.remaining_step_contents();
        if !remaining.is_empty() && !force_complete {
            task.progress.push(format!(
                "Stop guard blocked completion: {} step(s) remaining",
                remaining.len()
            ));
            task.touch();
            let _ = self.store.write(agent_id, &mut task).await;
            return Err(StopGuardBlock {
                remaining_steps: remaining,
                instructions: "Complete or skip all remaining steps before calling complete, or pass force_complete=true.".to_string(),
            });
        }

        if !remaining.is_empty() && force_complete {
            task.progress.push("Completed with force_complete; steps were left open".to_string());
        }

        task.progress.push("Task completed".to_string());
        task.status = TaskStatus::Completed;
        task.outcome = Some(Outcome::Completed { summary });
        task.touch();

        self.store
            .append_to_history(agent_id, &task)
            .await
            .map_err(|e| StopGuardBlock { remaining_steps: vec![], instructions: e.to_string() })?;
        let _ = self.store.delete(agent_id, &task.id).await;
        let _ = self.store.update_current_task_pointer(agent_id, None).await;

        self.emit("task.completed", agent_id, json!({"taskId": task.id})).await;

        if let (Some(milestone), Some(backlog)) = (&self.milestone, &task.backlog) {
            if let (Some(milestone_id), Some(item_id)) = (&backlog.milestone_id, &backlog.milestone_item_id) {
                let payload = json!({"status": "completed", "taskId": task.id});
                if sync_with_retry(milestone.as_ref(), milestone_id, item_id, payload).await.is_err() {
                    self.emit(
                        "milestone.sync_failed",
                        agent_id,
                        json!({"taskId": task.id, "milestoneId": milestone_id}),
                    )
                    .await;
                }
            }
        }

        Ok(task)
    }

    pub async fn cancel(&self, agent_id: &str, task_id: &str, reason: Option<String>) -> Result<Task> {
        let mut task = self.require(agent_id, task_id).await?;
        if task.status.is_terminal() {
            return Err(FleetError::precondition("task is already terminal"));
        }
        task.progress.push("Task cancelled".to_string());
        task.status = TaskStatus::Cancelled;
        task.outcome = Some(Outcome::Cancelled { reason });
        task.touch();

        self.store.append_to_history(agent_id, &task).await?;
        self.store.delete(agent_id, &task.id).await?;
        self.store.update_current_task_pointer(agent_id, None).await?;

        self.emit("task.cancelled", agent_id, json!({"taskId": task.id})).await;
        Ok(task)
    }

    pub async fn backlog_add(
        &self,
        agent_id: &str,
        description: String,
        priority: Priority,
        assignee: String,
        depends_on: Option<Vec<String>>,
        known_agents: &KnownAgents,
    ) -> Result<Task> {
        if !known_agents.contains(&assignee) {
            return Err(FleetError::validation(format!("unknown assignee: {assignee}")));
        }
        let mut task = Task::new(new_task_id(), description, priority, false);
        task.status = TaskStatus::Backlog;
        task.progress = vec!["Added to backlog".to_string()];
        task.backlog = Some(BacklogMetadata {
            created_by: agent_id.to_string(),
            assignee: assignee.clone(),
            depends_on,
            estimated_effort: None,
            start_date: None,
            due_date: None,
            milestone_id: None,
            milestone_item_id: None,
            reassign_count: 0,
        });
        self.store.write(&assignee, &mut task).await?;
        self.emit("task.backlog_added", &assignee, json!({"taskId": task.id})).await;
        Ok(task)
    }

    /// Pick-Backlog: refuses if an in-progress task already exists;
    /// otherwise picks `task_id` (if pickable) or the highest-priority
    /// pickable backlog task.
    pub async fn pick_backlog(&self, agent_id: &str, task_id: Option<&str>) -> Result<Task> {
        if self.store.find_active(agent_id).await?.is_some() {
            return Err(FleetError::precondition("an in-progress task already exists"));
        }

        let pickable = self.store.find_pickable_backlog(agent_id).await?;
        let mut chosen = match task_id {
            Some(id) => pickable
                .into_iter()
                .find(|t| t.id == id)
                .ok_or_else(|| FleetError::precondition(format!("{id} is not pickable")))?,
            None => pickable
                .into_iter()
                .next()
                .ok_or_else(|| FleetError::precondition("no pickable backlog task"))?,
        };

        chosen.status = TaskStatus::InProgress;
        chosen.progress.push("Picked from backlog".to_string());
        chosen.touch();
        self.store.write(agent_id, &mut chosen).await?;
        self.store.update_current_task_pointer(agent_id, Some(&chosen.id)).await?;
        self.emit("task.picked", agent_id, json!({"taskId": chosen.id})).await;
        Ok(chosen)
    }

    async fn require(&self, agent_id: &str, task_id: &str) -> Result<Task> {
        self.store
            .read(agent_id, task_id)
            .await
            .ok_or_else(|| FleetError::NotFound(format!("task {task_id} for agent {agent_id}")))
    }
}

fn apply_step_action(task: &mut Task, action: StepAction) -> Result<()> {
    match action {
        StepAction::SetSteps { contents } => {
            let mut steps: Vec<Step> = contents
                .into_iter()
                .enumerate()
                .map(|(i, content)| Step {
                    id: format!("s{}", i + 1),
                    content,
                    status: StepStatus::Pending,
                    order: i as u32 + 1,
                })
                .collect();
            if let Some(first) = steps.first_mut() {
                first.status = StepStatus::InProgress;
            }
            task.steps = Some(steps);
        }
        StepAction::AddStep { content } => {
            let steps = task.steps.get_or_insert_with(Vec::new);
            let next_order = steps.iter().map(|s| s.order).max().unwrap_or(0) + 1;
            let next_id = next_step_id(steps);
            steps.push(Step {
                id: next_id,
                content,
                status: StepStatus::Pending,
                order: next_order,
            });
        }
        StepAction::CompleteStep { id } => {
            set_step_status(task, &id, StepStatus::Done)?;
            auto_start_next(task);
        }
        StepAction::SkipStep { id } => {
            set_step_status(task, &id, StepStatus::Skipped)?;
            auto_start_next(task);
        }
        StepAction::StartStep { id } => {
            let steps = task
                .steps
                .as_mut()
                .ok_or_else(|| FleetError::validation("task has no steps"))?;
            if !steps.iter().any(|s| s.id == id) {
                return Err(FleetError::validation(format!("unknown step id: {id}")));
            }
            for step in steps.iter_mut() {
                if step.status == StepStatus::InProgress {
                    step.status = StepStatus::Pending;
                }
            }
            let target = steps.iter_mut().find(|s| s.id == id).unwrap();
            target.status = StepStatus::InProgress;
        }
        StepAction::ReorderSteps { ids } => {
            let steps = task
                .steps
                .as_mut()
                .ok_or_else(|| FleetError::validation("task has no steps"))?;
            for (idx, id) in ids.iter().enumerate() {
                if let Some(step) = steps.iter_mut().find(|s| &s.id == id) {
                    step.order = idx as u32 + 1;
                }
            }
            let mut next_order = ids.len() as u32 + 1;
            for step in steps.iter_mut() {
                if !ids.contains(&step.id) {
                    step.order = next_order;
                    next_order += 1;
                }
            }
        }
    }
    Ok(())
}

fn next_step_id(steps: &[Step]) -> String {
    let max = steps
        .iter()
        .filter_map(|s| s.id.strip_prefix('s').and_then(|n| n.parse::<u32>().ok()))
        .max()
        .unwrap_or(0);
    format!("s{}", max + 1)
}

fn set_step_status(task: &mut Task, id: &str, status: StepStatus) -> Result<()> {
    let steps = task
        .steps
        .as_mut()
        .ok_or_else(|| FleetError::validation("task has no steps"))?;
    let step = steps
        .iter_mut()
        .find(|s| s.id == id)
        .ok_or_else(|| FleetError::validation(format!("unknown step id: {id}")))?;
    step.status = status;
    Ok(())
}

/// When the in-progress step finishes, the lowest-order pending step
/// auto-starts unless none remain.
fn auto_start_next(task: &mut Task) {
    let Some(steps) = task.steps.as_mut() else { return };
    if steps.iter().any(|s| s.status == StepStatus::InProgress) {
        return;
    }
    if let Some(next) = steps
        .iter_mut()
        .filter(|s| s.status == StepStatus::Pending)
        .min_by_key(|s| s.order)
    {
        next.status = StepStatus::InProgress;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use tempfile::TempDir;

    fn lifecycle() -> (TempDir, TaskLifecycle) {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        (dir, TaskLifecycle::new(store, EventBus::new(), None))
    }

    /// Stop-Guard blocks completion while steps remain, then allows it.
    #[tokio::test]
    async fn stop_guard_blocks_then_allows_completion() {
        let (_dir, lc) = lifecycle();
        let task = lc.start("agent-a", "ship it".into(), Priority::High, false).await.unwrap();

        lc.update_steps(
            "agent-a",
            &task.id,
            StepAction::SetSteps { contents: vec!["A".into(), "B".into(), "C".into()] },
        )
        .await
        .unwrap();

        let blocked = lc.complete("agent-a", &task.id, None, false).await;
        let err = blocked.unwrap_err();
        assert_eq!(err.remaining_steps.len(), 3);

        lc.update_steps("agent-a", &task.id, StepAction::CompleteStep { id: "s1".into() }).await.unwrap();
        lc.update_steps("agent-a", &task.id, StepAction::CompleteStep { id: "s2".into() }).await.unwrap();
        lc.update_steps("agent-a", &task.id, StepAction::SkipStep { id: "s3".into() }).await.unwrap();

        let completed = lc.complete("agent-a", &task.id, Some("done".into()), false).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(matches!(completed.outcome, Some(Outcome::Completed { .. })));

        let store = TaskStore::new(lc.store.workspace_root());
        assert!(store.read("agent-a", &task.id).await.is_none());
    }

    #[tokio::test]
    async fn force_complete_bypasses_stop_guard() {
        let (_dir, lc) = lifecycle();
        let task = lc.start("agent-a", "ship it".into(), Priority::High, false).await.unwrap();
        lc.update_steps("agent-a", &task.id, StepAction::SetSteps { contents: vec!["A".into()] }).await.unwrap();

        let completed = lc.complete("agent-a", &task.id, None, true).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn only_one_step_in_progress_at_a_time() {
        let (_dir, lc) = lifecycle();
        let task = lc.start("agent-a", "t".into(), Priority::Low, false).await.unwrap();
        let task = lc
            .update_steps("agent-a", &task.id, StepAction::SetSteps { contents: vec!["A".into(), "B".into()] })
            .await
            .unwrap();
        let task = lc.update_steps("agent-a", &task.id, StepAction::CompleteStep { id: "s1".into() }).await.unwrap();

        let in_progress = task.steps.unwrap().into_iter().filter(|s| s.status == StepStatus::InProgress).count();
        assert_eq!(in_progress, 1);
    }

    #[tokio::test]
    async fn block_requires_known_nonself_agents() {
        let (_dir, lc) = lifecycle();
        let task = lc.start("agent-a", "t".into(), Priority::Low, false).await.unwrap();
        let known = KnownAgents::from_ids(["agent-b".to_string()]);

        let err = lc.block("agent-a", &task.id, "waiting".into(), vec!["agent-a".into()], &known).await;
        assert!(err.is_err());

        let err = lc.block("agent-a", &task.id, "waiting".into(), vec!["agent-x".into()], &known).await;
        assert!(err.is_err());

        let blocked = lc.block("agent-a", &task.id, "waiting".into(), vec!["agent-b".into()], &known).await.unwrap();
        assert_eq!(blocked.status, TaskStatus::Blocked);
    }

    #[tokio::test]
    async fn pick_backlog_refuses_with_active_task() {
        let (_dir, lc) = lifecycle();
        lc.start("agent-a", "active".into(), Priority::Low, false).await.unwrap();
        let err = lc.pick_backlog("agent-a", None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn start_refuses_second_task_while_one_in_progress() {
        let (_dir, lc) = lifecycle();
        lc.start("agent-a", "first".into(), Priority::Low, false).await.unwrap();
        let err = lc.start("agent-a", "second".into(), Priority::Low, false).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn resume_refuses_when_another_task_is_in_progress() {
        let (_dir, lc) = lifecycle();
        let blocked = lc.start("agent-a", "blocked one".into(), Priority::Low, false).await.unwrap();
        let known = KnownAgents::from_ids(["agent-b".to_string()]);
        lc.block("agent-a", &blocked.id, "waiting".into(), vec!["agent-b".into()], &known).await.unwrap();
        lc.start("agent-a", "active one".into(), Priority::Low, false).await.unwrap();

        let err = lc.resume("agent-a", &blocked.id).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn at_most_one_in_progress_task_and_pointer_matches() {
        let (_dir, lc) = lifecycle();
        let task = lc.start("agent-a", "t".into(), Priority::Low, false).await.unwrap();
        let store = TaskStore::new(lc.store.workspace_root());
        let active = store.find_active("agent-a").await.unwrap();
        assert_eq!(active.unwrap().id, task.id);
    }
}
