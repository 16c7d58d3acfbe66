//! Layer B (Self-Driving Loop) and Layer C (Event-based Step-Continuation)
//! of the Continuation Controller.

use crate::constants;
use crate::tasks::Task;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationReason {
    StalledStep,
    ZeroProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelfDriveAction {
    None,
    Continue { prompt: String },
    Escalate { reason: EscalationReason },
}

/// Per-agent tracking state for layer B. Wholly reset by `lifecycle:start`.
#[derive(Debug, Clone, Default)]
pub struct SelfDriveState {
    consecutive_count: u32,
    same_step_count: u32,
    zero_progress_count: u32,
    last_step_id: Option<String>,
    last_done_count: usize,
    escalated: bool,
    last_event_at: Option<DateTime<Utc>>,
}

impl SelfDriveState {
    pub fn new() -> Self {
        SelfDriveState::default()
    }

    /// `lifecycle:start` cancels pending timers and resets all counters.
    pub fn on_lifecycle_start(&mut self) {
        *self = SelfDriveState::default();
    }

    /// `lifecycle:end` on a main session (call only for non-subagent sessions).
    pub fn on_lifecycle_end(&mut self, task: &Task, now: DateTime<Utc>) -> SelfDriveAction {
        let cooldown = ChronoDuration::from_std(constants::SELF_DRIVE_COOLDOWN).unwrap();
        if let Some(last) = self.last_event_at {
            if now - last >= cooldown {
                self.consecutive_count = 0;
            }
        }
        self.last_event_at = Some(now);

        if task.remaining_step_contents().is_empty() {
            return SelfDriveAction::None;
        }

        if self.consecutive_count >= constants::MAX_CONSECUTIVE_SELF_DRIVES {
            return SelfDriveAction::None;
        }

        let current_step_id = task.current_step().map(|s| s.id.clone());
        if current_step_id == self.last_step_id {
            self.same_step_count += 1;
        } else {
            self.same_step_count = 1;
            self.last_step_id = current_step_id;
        }

        let done = task.done_step_count();
        if done > self.last_done_count {
            self.zero_progress_count = 0;
        } else {
            self.zero_progress_count += 1;
        }
        self.last_done_count = done;
        self.consecutive_count += 1;

        if !self.escalated {
            if self.same_step_count >= constants::MAX_STALLS_ON_SAME_STEP {
                self.escalated = true;
                return SelfDriveAction::Escalate { reason: EscalationReason::StalledStep };
            }
            if self.zero_progress_count >= constants::MAX_ZERO_PROGRESS_RUNS {
                self.escalated = true;
                return SelfDriveAction::Escalate { reason: EscalationReason::ZeroProgress };
            }
        }

        SelfDriveAction::Continue {
            prompt: format!(
                "TASK CONTINUATION: do NOT stop. Task {} has {} step(s) remaining.",
                task.id,
                task.remaining_step_contents().len()
            ),
        }
    }

    pub fn same_step_count(&self) -> u32 {
        self.same_step_count
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count
    }
}

/// Layer C prompt, used only when layer B did not fire in the same window
/// (the caller is responsible for that suppression via timer cancellation).
pub fn step_continuation_prompt(task: &Task) -> String {
    let latest_progress = task.progress.last().cloned().unwrap_or_default();
    format!("continue from: {latest_progress}")
}
