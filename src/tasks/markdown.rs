//! Task <-> markdown-with-embedded-JSON serialization.
//!
//! Unknown statuses or malformed `Steps` entries must cause the whole file
//! to be treated as missing rather than silently corrupted, so parsing here
//! returns `None` on any structural problem instead of a partially-populated
//! `Task`.

use super::{
    BacklogMetadata, BlockingMetadata, Delegation, Outcome, Priority, Step, StepStatus, Task, TaskStatus,
};
use chrono::{DateTime, Utc};

pub fn render(task: &Task) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Task: {}\n\n", task.id));

    out.push_str("## Metadata\n");
    out.push_str(&format!("- **Status:** {}\n", status_label(task.status)));
    out.push_str(&format!("- **Priority:** {}\n", priority_label(task.priority)));
    out.push_str(&format!("- **Created:** {}\n", task.created_at.to_rfc3339()));
    if let Some(source) = &task.source {
        out.push_str(&format!("- **Source:** {source}\n"));
    }
    out.push_str(&format!("- **Work Session:** {}\n", task.work_session_id));
    if let Some(prev) = &task.previous_work_session_id {
        out.push_str(&format!("- **Previous Work Session:** {prev}\n"));
    }
    out.push('\n');

    out.push_str("## Description\n");
    out.push_str(&task.description);
    out.push_str("\n\n");

    if let Some(context) = &task.context {
        out.push_str("## Context\n");
        out.push_str(context);
        out.push_str("\n\n");
    }

    if let Some(steps) = &task.steps {
        out.push_str("## Steps\n");
        let mut sorted: Vec<&Step> = steps.iter().collect();
        sorted.sort_by_key(|s| s.order);
        for step in sorted {
            out.push_str(&format!(
                "- [{}] ({}) {}       {}\n",
                step.status.marker(),
                step.id,
                step.content,
                step_status_label(step.status)
            ));
        }
        out.push('\n');
    }

    out.push_str("## Progress\n");
    for line in &task.progress {
        out.push_str(&format!("- {line}\n"));
    }
    out.push('\n');

    out.push_str("## Last Activity\n");
    out.push_str(&task.last_activity.to_rfc3339());
    out.push_str("\n\n");

    if let Some(blocking) = &task.blocking {
        out.push_str("## Blocking\n```json\n");
        out.push_str(&serde_json::to_string_pretty(blocking).unwrap_or_default());
        out.push_str("\n```\n\n");
    }

    if let Some(backlog) = &task.backlog {
        out.push_str("## Backlog\n```json\n");
        out.push_str(&serde_json::to_string_pretty(backlog).unwrap_or_default());
        out.push_str("\n```\n\n");
    }

    if let Some(outcome) = &task.outcome {
        out.push_str("## Outcome\n```json\n");
        out.push_str(&serde_json::to_string_pretty(outcome).unwrap_or_default());
        out.push_str("\n```\n\n");
    }

    if !task.delegations.is_empty() {
        out.push_str("## Delegations\n```json\n");
        out.push_str(&serde_json::to_string_pretty(&task.delegations).unwrap_or_default());
        out.push_str("\n```\n\n");
    }

    out.push_str("---\n*Managed by task tools*\n");
    out
}

/// Parses a task file. Returns `None` on any malformed section so callers
/// treat the file the same as "missing".
pub fn parse(id: &str, content: &str) -> Option<Task> {
    let sections = split_sections(content);

    let metadata = sections.get("Metadata")?;
    let status = parse_status(&field(metadata, "Status")?)?;
    let priority = parse_priority(&field(metadata, "Priority")?)?;
    let created_at = parse_rfc3339(&field(metadata, "Created")?)?;
    let source = field(metadata, "Source");
    let work_session_id = field(metadata, "Work Session").unwrap_or_else(|| format!("ws_{}", uuid::Uuid::new_v4()));
    let previous_work_session_id = field(metadata, "Previous Work Session");

    let description = sections.get("Description").cloned().unwrap_or_default().trim().to_string();
    let context = sections.get("Context").map(|s| s.trim().to_string());

    let steps = match sections.get("Steps") {
        Some(raw) => Some(parse_steps(raw)?),
        None => None,
    };

    let progress = sections
        .get("Progress")
        .map(|raw| {
            raw.lines()
                .filter_map(|l| l.trim().strip_prefix("- ").map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let last_activity = sections
        .get("Last Activity")
        .and_then(|raw| parse_rfc3339(raw.trim()))
        .unwrap_or(created_at);

    let blocking = match sections.get("Blocking") {
        Some(raw) => Some(parse_json_block::<BlockingMetadata>(raw)?),
        None => None,
    };
    if blocking.is_some() != (status == TaskStatus::Blocked) {
        return None;
    }

    let backlog = match sections.get("Backlog") {
        Some(raw) => Some(parse_json_block::<BacklogMetadata>(raw)?),
        None => None,
    };

    let outcome = match sections.get("Outcome") {
        Some(raw) => Some(parse_json_block::<Outcome>(raw)?),
        None => None,
    };
    if outcome.is_some() != status.is_terminal() {
        return None;
    }

    let delegations = match sections.get("Delegations") {
        Some(raw) => parse_json_block::<Vec<Delegation>>(raw)?,
        None => Vec::new(),
    };

    Some(Task {
        id: id.to_string(),
        status,
        priority,
        description,
        context,
        source,
        created_at,
        last_activity,
        work_session_id,
        previous_work_session_id,
        progress,
        steps,
        blocking,
        backlog,
        delegations,
        outcome,
    })
}

fn split_sections(content: &str) -> std::collections::HashMap<String, String> {
    let mut sections = std::collections::HashMap::new();
    let mut current: Option<String> = None;
    let mut buf = String::new();

    for line in content.lines() {
        if let Some(name) = line.strip_prefix("## ") {
            if let Some(name) = current.take() {
                sections.insert(name, buf.trim_end().to_string());
            }
            current = Some(name.trim().to_string());
            buf = String::new();
        } else if line.starts_with("---") && current.is_some() {
            let name = current.take().unwrap();
            sections.insert(name, buf.trim_end().to_string());
        } else if current.is_some() {
            buf.push_str(line);
            buf.push('\n');
        }
    }
    if let Some(name) = current {
        sections.insert(name, buf.trim_end().to_string());
    }
    sections
}

fn field(section: &str, key: &str) -> Option<String> {
    let prefix = format!("- **{key}:**");
    section.lines().find_map(|line| {
        line.trim()
            .strip_prefix(&prefix)
            .map(|rest| rest.trim().to_string())
    })
}

fn parse_json_block<T: serde::de::DeserializeOwned>(section: &str) -> Option<T> {
    let start = section.find("```json")?;
    let after = &section[start + "```json".len()..];
    let end = after.find("```")?;
    serde_json::from_str(after[..end].trim()).ok()
}

fn parse_steps(section: &str) -> Option<Vec<Step>> {
    let mut steps = Vec::new();
    for (order, line) in section.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let line = line.trim();
        let rest = line.strip_prefix("- [")?;
        let marker = rest.chars().next()?;
        let status = StepStatus::from_marker(marker)?;
        let rest = &rest[marker.len_utf8()..];
        let rest = rest.strip_prefix("] (")?;
        let id_end = rest.find(')')?;
        let id = rest[..id_end].to_string();
        let rest = rest[id_end + 1..].trim();
        let label = step_status_label(status);
        let content = rest.strip_suffix(label).unwrap_or(rest).trim_end().to_string();
        steps.push(Step {
            id,
            content,
            status,
            order: order as u32 + 1,
        });
    }
    Some(steps)
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::PendingApproval => "pending_approval",
        TaskStatus::Backlog => "backlog",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Completed => "completed",
        TaskStatus::Cancelled => "cancelled",
        TaskStatus::Abandoned => "abandoned",
    }
}

fn parse_status(s: &str) -> Option<TaskStatus> {
    Some(match s {
        "pending_approval" => TaskStatus::PendingApproval,
        "backlog" => TaskStatus::Backlog,
        "in_progress" => TaskStatus::InProgress,
        "blocked" => TaskStatus::Blocked,
        "completed" => TaskStatus::Completed,
        "cancelled" => TaskStatus::Cancelled,
        "abandoned" => TaskStatus::Abandoned,
        _ => return None,
    })
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent => "urgent",
        Priority::High => "high",
        Priority::Medium => "medium",
        Priority::Low => "low",
    }
}

fn parse_priority(s: &str) -> Option<Priority> {
    Some(match s {
        "urgent" => Priority::Urgent,
        "high" => Priority::High,
        "medium" => Priority::Medium,
        "low" => Priority::Low,
        _ => return None,
    })
}

fn step_status_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::InProgress => "in_progress",
        StepStatus::Done => "done",
        StepStatus::Skipped => "skipped",
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
