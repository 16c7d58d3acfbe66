//! Layer D (Polling Continuation) and Layer E (Zombie Recovery).

use crate::constants;
use crate::tasks::{EscalationState, Task, TaskStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollAction {
    None,
    Continue { prompt: String },
    Unblock { next_unblocker: String },
    UnblockEscalated,
    BacklogRecover { reassign_count: u32 },
    Abandon,
}

/// Zombie recovery runs inline during polling, ahead of the ordinary
/// idle/cooldown checks, since it overrides any other action once the task
/// has been untouched past the TTL.
pub fn zombie_check(task: &Task, now: DateTime<Utc>) -> Option<PollAction> {
    let ttl = ChronoDuration::from_std(constants::ZOMBIE_TASK_TTL).unwrap();
    if now - task.last_activity < ttl {
        return None;
    }
    let current_reassigns = task.backlog.as_ref().map(|b| b.reassign_count).unwrap_or(0);
    if current_reassigns < constants::MAX_ZOMBIE_REASSIGNS {
        Some(PollAction::BacklogRecover { reassign_count: current_reassigns + 1 })
    } else {
        Some(PollAction::Abandon)
    }
}

/// `true` when layer D's ordinary idle/cooldown preconditions hold (ignores
/// zombie recovery, which is checked separately and takes priority).
fn eligible_for_ordinary_poll(
    task: &Task,
    agent_queue_empty: bool,
    last_continuation_sent: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if matches!(task.status, TaskStatus::Completed | TaskStatus::PendingApproval) {
        return false;
    }
    if task.status == TaskStatus::Blocked {
        return false;
    }
    if !agent_queue_empty {
        return false;
    }
    let idle = ChronoDuration::from_std(constants::TASK_IDLE_THRESHOLD).unwrap();
    if now - task.last_activity < idle {
        return false;
    }
    if let Some(last) = last_continuation_sent {
        let cooldown = ChronoDuration::from_std(constants::CONTINUATION_COOLDOWN).unwrap();
        if now - last < cooldown {
            return false;
        }
    }
    true
}

pub fn poll_action(
    task: &Task,
    agent_queue_empty: bool,
    last_continuation_sent: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> PollAction {
    if let Some(zombie_action) = zombie_check(task, now) {
        return zombie_action;
    }

    if task.status == TaskStatus::Blocked {
        return unblock_action(task);
    }

    if eligible_for_ordinary_poll(task, agent_queue_empty, last_continuation_sent, now) {
        PollAction::Continue {
            prompt: format!(
                "TASK CONTINUATION: task {} steps={:?} progress={:?}",
                task.id,
                task.remaining_step_contents(),
                task.progress.last()
            ),
        }
    } else {
        PollAction::None
    }
}

fn unblock_action(task: &Task) -> PollAction {
    let Some(blocking) = &task.blocking else {
        return PollAction::None;
    };
    if blocking.escalation_state == EscalationState::Escalated || blocking.unblocked_by.is_empty() {
        return PollAction::None;
    }
    if blocking.unblock_request_count >= constants::MAX_UNBLOCK_REQUESTS {
        return PollAction::UnblockEscalated;
    }
    let next_index = blocking.last_unblocker_index.map(|i| (i + 1) % blocking.unblocked_by.len()).unwrap_or(0);
    PollAction::Unblock { next_unblocker: blocking.unblocked_by[next_index].clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{new_task_id, BlockingMetadata, Priority};

    fn idle_task(minutes_idle: i64) -> Task {
        let mut task = Task::new(new_task_id(), "t".into(), Priority::Medium, false);
        task.last_activity = Utc::now() - ChronoDuration::minutes(minutes_idle);
        task
    }

    /// An idle task gets a continuation nudge, then respects the cooldown
    /// until it's due again.
    #[test]
    fn idle_task_gets_continuation_then_respects_cooldown() {
        let task = idle_task(5);
        let now = Utc::now();

        let first = poll_action(&task, true, None, now);
        assert!(matches!(first, PollAction::Continue { .. }));

        let sent_at = now;
        let now2 = now + ChronoDuration::minutes(2);
        let second = poll_action(&task, true, Some(sent_at), now2);
        assert_eq!(second, PollAction::None);

        let now3 = now + ChronoDuration::minutes(5) + ChronoDuration::seconds(1);
        let third = poll_action(&task, true, Some(sent_at), now3);
        assert!(matches!(third, PollAction::Continue { .. }));
    }

    #[test]
    fn busy_queue_suppresses_continuation() {
        let task = idle_task(10);
        assert_eq!(poll_action(&task, false, None, Utc::now()), PollAction::None);
    }

    /// A zombie task recovers to backlog once, then abandons on the next strike.
    #[test]
    fn zombie_task_recovers_to_backlog_then_abandons() {
        let mut task = idle_task(0);
        task.last_activity = Utc::now() - ChronoDuration::hours(25);
        task.backlog = Some(BlockingBacklogFixture::with_reassigns(1));

        let action = zombie_check(&task, Utc::now()).unwrap();
        assert_eq!(action, PollAction::BacklogRecover { reassign_count: 2 });

        task.backlog = Some(BlockingBacklogFixture::with_reassigns(3));
        let action = zombie_check(&task, Utc::now()).unwrap();
        assert_eq!(action, PollAction::Abandon);
    }

    #[test]
    fn blocked_task_picks_next_unblocker_round_robin() {
        let mut task = idle_task(0);
        task.status = TaskStatus::Blocked;
        task.blocking = Some(BlockingMetadata {
            blocked_reason: "waiting".into(),
            unblocked_by: vec!["agent-b".into(), "agent-c".into()],
            unblocked_action: None,
            unblock_request_count: 0,
            last_unblocker_index: None,
            last_unblock_request_at: None,
            escalation_state: EscalationState::None,
            unblock_request_failures: None,
        });

        let action = poll_action(&task, true, None, Utc::now());
        assert_eq!(action, PollAction::Unblock { next_unblocker: "agent-b".into() });
    }

    #[test]
    fn unblock_escalates_after_max_requests() {
        let mut task = idle_task(0);
        task.status = TaskStatus::Blocked;
        task.blocking = Some(BlockingMetadata {
            blocked_reason: "waiting".into(),
            unblocked_by: vec!["agent-b".into()],
            unblocked_action: None,
            unblock_request_count: constants::MAX_UNBLOCK_REQUESTS,
            last_unblocker_index: Some(0),
            last_unblock_request_at: None,
            escalation_state: EscalationState::None,
            unblock_request_failures: None,
        });

        assert_eq!(poll_action(&task, true, None, Utc::now()), PollAction::UnblockEscalated);
    }

    struct BlockingBacklogFixture;
    impl BlockingBacklogFixture {
        fn with_reassigns(reassign_count: u32) -> crate::tasks::BacklogMetadata {
            crate::tasks::BacklogMetadata {
                created_by: "a".into(),
                assignee: "b".into(),
                depends_on: None,
                estimated_effort: None,
                start_date: None,
                due_date: None,
                milestone_id: None,
                milestone_item_id: None,
                reassign_count,
            }
        }
    }
}
