//! Core task data model: `Task`, `Step`, blocking/backlog metadata,
//! delegation records, and the terminal `Outcome` union.

pub mod delegation;
pub mod lifecycle;
pub mod markdown;
pub mod store;

pub use delegation::{Delegation, DelegationEvent, DelegationStatus, DelegationSummary};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
}

impl Priority {
    /// Ascending rank used for task-store sort order (urgent sorts first).
    pub fn rank(self) -> u8 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    PendingApproval,
    Backlog,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
    Abandoned,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Abandoned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Skipped,
}

impl StepStatus {
    /// Marker used in the task-file Steps section.
    pub fn marker(self) -> char {
        match self {
            StepStatus::Pending => ' ',
            StepStatus::InProgress => '>',
            StepStatus::Done => 'x',
            StepStatus::Skipped => '-',
        }
    }

    pub fn from_marker(c: char) -> Option<Self> {
        match c {
            ' ' => Some(StepStatus::Pending),
            '>' => Some(StepStatus::InProgress),
            'x' => Some(StepStatus::Done),
            '-' => Some(StepStatus::Skipped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub content: String,
    pub status: StepStatus,
    pub order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EscalationState {
    None,
    Requesting,
    Escalated,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockingMetadata {
    pub blocked_reason: String,
    pub unblocked_by: Vec<String>,
    pub unblocked_action: Option<String>,
    pub unblock_request_count: u32,
    pub last_unblocker_index: Option<usize>,
    pub last_unblock_request_at: Option<chrono::DateTime<chrono::Utc>>,
    pub escalation_state: EscalationState,
    pub unblock_request_failures: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimatedEffort {
    Small,
    Medium,
    Large,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacklogMetadata {
    pub created_by: String,
    pub assignee: String,
    pub depends_on: Option<Vec<String>>,
    pub estimated_effort: Option<EstimatedEffort>,
    pub start_date: Option<chrono::DateTime<chrono::Utc>>,
    pub due_date: Option<chrono::DateTime<chrono::Utc>>,
    pub milestone_id: Option<String>,
    pub milestone_item_id: Option<String>,
    pub reassign_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Outcome {
    Completed { summary: Option<String> },
    Cancelled { reason: Option<String> },
    Error { msg: String, retriable: Option<bool> },
    Interrupted { by: Option<String>, reason: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub status: TaskStatus,
    pub priority: Priority,
    pub description: String,
    pub context: Option<String>,
    pub source: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_activity: chrono::DateTime<chrono::Utc>,
    pub work_session_id: String,
    pub previous_work_session_id: Option<String>,
    pub progress: Vec<String>,
    pub steps: Option<Vec<Step>>,
    pub blocking: Option<BlockingMetadata>,
    pub backlog: Option<BacklogMetadata>,
    pub delegations: Vec<Delegation>,
    pub outcome: Option<Outcome>,
}

impl Task {
    pub fn new(
        id: String,
        description: String,
        priority: Priority,
        requires_approval: bool,
    ) -> Self {
        let now = chrono::Utc::now();
        let status = if requires_approval {
            TaskStatus::PendingApproval
        } else {
            TaskStatus::InProgress
        };
        let progress_line = if requires_approval {
            "Task created - awaiting approval".to_string()
        } else {
            "Task started".to_string()
        };

        Task {
            id,
            status,
            priority,
            description,
            context: None,
            source: None,
            created_at: now,
            last_activity: now,
            work_session_id: format!("ws_{}", uuid::Uuid::new_v4()),
            previous_work_session_id: None,
            progress: vec![progress_line],
            steps: None,
            blocking: None,
            backlog: None,
            delegations: Vec::new(),
            outcome: None,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = chrono::Utc::now();
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps
            .as_ref()
            .and_then(|steps| steps.iter().find(|s| s.status == StepStatus::InProgress))
    }

    pub fn remaining_step_contents(&self) -> Vec<String> {
        self.steps
            .as_ref()
            .map(|steps| {
                steps
                    .iter()
                    .filter(|s| matches!(s.status, StepStatus::Pending | StepStatus::InProgress))
                    .map(|s| s.content.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn done_step_count(&self) -> usize {
        self.steps
            .as_ref()
            .map(|steps| steps.iter().filter(|s| s.status == StepStatus::Done).count())
            .unwrap_or(0)
    }
}

pub type TaskId = String;

/// Generates an opaque `task_<20 hex>` id.
pub fn new_task_id() -> TaskId {
    let full = uuid::Uuid::new_v4().simple().to_string();
    format!("task_{}", &full[..20])
}

/// A known-agents directory consulted when validating agent ids in blocking
/// metadata and backlog assignment. In-process stand-in for whatever agent
/// registry the surrounding system maintains.
#[derive(Debug, Clone, Default)]
pub struct KnownAgents(pub HashMap<String, ()>);

impl KnownAgents {
    pub fn from_ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        KnownAgents(ids.into_iter().map(|id| (id, ())).collect())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }
}
