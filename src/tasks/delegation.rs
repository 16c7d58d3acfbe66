//! Sub-agent delegation records.

use crate::{FleetError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DelegationStatus {
    Spawned,
    Running,
    Completed,
    Failed,
    Verified,
    Rejected,
    Retrying,
    Abandoned,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationEvent {
    pub from: DelegationStatus,
    pub to: DelegationStatus,
    pub at: chrono::DateTime<chrono::Utc>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub delegation_id: String,
    pub run_id: String,
    pub target_agent_id: String,
    pub target_session_key: String,
    pub task: String,
    pub label: Option<String>,
    pub status: DelegationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub previous_errors: Vec<String>,
    pub result_snapshot: Option<String>,
    pub verification_note: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub events: Vec<DelegationEvent>,
}

impl Delegation {
    pub fn new(target_agent_id: String, target_session_key: String, task: String, max_retries: u32) -> Self {
        let now = chrono::Utc::now();
        Delegation {
            delegation_id: format!("del_{}", uuid::Uuid::new_v4().simple()),
            run_id: format!("run_{}", uuid::Uuid::new_v4().simple()),
            target_agent_id,
            target_session_key,
            task,
            label: None,
            status: DelegationStatus::Spawned,
            retry_count: 0,
            max_retries,
            previous_errors: Vec::new(),
            result_snapshot: None,
            verification_note: None,
            created_at: now,
            updated_at: now,
            events: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegationSummary {
    pub total: usize,
    pub spawned: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub verified: usize,
    pub rejected: usize,
    pub retrying: usize,
    pub abandoned: usize,
    pub all_settled: bool,
}

pub fn summarize(delegations: &[Delegation]) -> DelegationSummary {
    let mut summary = DelegationSummary {
        total: delegations.len(),
        ..Default::default()
    };
    for d in delegations {
        match d.status {
            DelegationStatus::Spawned => summary.spawned += 1,
            DelegationStatus::Running => summary.running += 1,
            DelegationStatus::Completed => summary.completed += 1,
            DelegationStatus::Failed => summary.failed += 1,
            DelegationStatus::Verified => summary.verified += 1,
            DelegationStatus::Rejected => summary.rejected += 1,
            DelegationStatus::Retrying => summary.retrying += 1,
            DelegationStatus::Abandoned => summary.abandoned += 1,
        }
    }
    summary.all_settled = delegations.iter().all(|d| {
        matches!(
            d.status,
            DelegationStatus::Verified | DelegationStatus::Rejected | DelegationStatus::Abandoned
        )
    });
    summary
}

/// Validates and applies a delegation status transition, returning the event
/// to append. Pure function: no I/O, callers own persistence.
///
/// Idempotent on the two no-op transitions the design calls out
/// (`rejected -> rejected`, `failed -> failed`) in the sense that both are
/// reported as `FleetError::Precondition` rather than silently duplicating
/// an event.
pub fn update_delegation(
    delegation: &mut Delegation,
    to: DelegationStatus,
    note: Option<String>,
) -> Result<DelegationEvent> {
    use DelegationStatus::*;
    let from = delegation.status;

    let allowed = match (from, to) {
        (Spawned, Running) => true,
        (Running, Completed) | (Running, Failed) => true,
        (Completed, Verified) | (Completed, Rejected) => true,
        (Failed, Verified) | (Failed, Rejected) => true,
        (Rejected, Retrying) => true,
        (Rejected, Abandoned) => true,
        (Retrying, Spawned) => true,
        _ => false,
    };

    if !allowed {
        return Err(FleetError::precondition(format!(
            "invalid delegation transition {from:?} -> {to:?}"
        )));
    }

    if to == Retrying {
        if delegation.retry_count >= delegation.max_retries {
            return Err(FleetError::precondition(
                "retry budget exhausted, transition to abandoned instead",
            ));
        }
        delegation.retry_count += 1;
    }

    delegation.status = to;
    delegation.updated_at = chrono::Utc::now();
    if let Some(note) = &note {
        if matches!(to, Failed | Rejected) {
            delegation.previous_errors.push(note.clone());
        }
    }

    let event = DelegationEvent {
        from,
        to,
        at: delegation.updated_at,
        note,
    };
    delegation.events.push(event.clone());
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_delegation() -> Delegation {
        Delegation::new("agent-b".into(), "session-key".into(), "do thing".into(), 2)
    }

    #[test]
    fn retry_count_never_exceeds_max() {
        let mut d = new_delegation();
        update_delegation(&mut d, DelegationStatus::Running, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Failed, Some("boom".into())).unwrap();
        update_delegation(&mut d, DelegationStatus::Rejected, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Retrying, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Spawned, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Running, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Failed, Some("boom again".into())).unwrap();
        update_delegation(&mut d, DelegationStatus::Rejected, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Retrying, None).unwrap();

        assert_eq!(d.retry_count, 2);
        assert!(d.retry_count <= d.max_retries);

        // Exhausted: a third retry attempt must fail rather than exceed max_retries.
        update_delegation(&mut d, DelegationStatus::Spawned, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Running, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Failed, Some("again".into())).unwrap();
        update_delegation(&mut d, DelegationStatus::Rejected, None).unwrap();
        let err = update_delegation(&mut d, DelegationStatus::Retrying, None);
        assert!(err.is_err());
    }

    #[test]
    fn rejected_to_rejected_is_reported_not_duplicated() {
        let mut d = new_delegation();
        update_delegation(&mut d, DelegationStatus::Running, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Failed, Some("boom".into())).unwrap();
        update_delegation(&mut d, DelegationStatus::Rejected, None).unwrap();
        let events_before = d.events.len();
        let err = update_delegation(&mut d, DelegationStatus::Rejected, None);
        assert!(err.is_err());
        assert_eq!(d.events.len(), events_before);
    }

    #[test]
    fn every_transition_is_monotonic_in_time() {
        let mut d = new_delegation();
        update_delegation(&mut d, DelegationStatus::Running, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Completed, None).unwrap();
        update_delegation(&mut d, DelegationStatus::Verified, None).unwrap();

        for pair in d.events.windows(2) {
            assert!(pair[0].at <= pair[1].at);
        }
    }

    #[test]
    fn summary_all_settled_requires_terminal_status() {
        let mut d1 = new_delegation();
        update_delegation(&mut d1, DelegationStatus::Running, None).unwrap();
        update_delegation(&mut d1, DelegationStatus::Completed, None).unwrap();
        update_delegation(&mut d1, DelegationStatus::Verified, None).unwrap();

        let d2 = new_delegation();

        let summary = summarize(&[d1, d2]);
        assert!(!summary.all_settled);
    }
}
