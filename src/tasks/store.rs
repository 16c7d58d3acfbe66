//! Atomic read-modify-write task store.

use super::{markdown, Task, TaskStatus};
use crate::locking::FileLock;
use crate::{FleetError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct TaskStore {
    workspace_root: PathBuf,
}

impl TaskStore {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        TaskStore {
            workspace_root: workspace_root.into(),
        }
    }

    fn workspace_dir(&self, agent_id: &str) -> PathBuf {
        self.workspace_root.join(format!("workspace-{agent_id}"))
    }

    fn tasks_dir(&self, agent_id: &str) -> PathBuf {
        self.workspace_dir(agent_id).join("tasks")
    }

    fn task_path(&self, agent_id: &str, task_id: &str) -> Result<PathBuf> {
        if task_id.contains('/') || task_id.contains('\\') || task_id.contains("..") {
            return Err(FleetError::validation(format!(
                "task id contains path separators: {task_id}"
            )));
        }
        Ok(self.tasks_dir(agent_id).join(format!("{task_id}.md")))
    }

    fn current_task_path(&self, agent_id: &str) -> PathBuf {
        self.workspace_dir(agent_id).join("CURRENT_TASK.md")
    }

    fn history_dir(&self, agent_id: &str) -> PathBuf {
        self.workspace_dir(agent_id).join("task-history")
    }

    /// Reads a task. Returns `None` for a missing file, an unparsable file,
    /// or a path-unsafe id — callers should not distinguish these cases.
    pub async fn read(&self, agent_id: &str, task_id: &str) -> Option<Task> {
        let path = self.task_path(agent_id, task_id).ok()?;
        let content = tokio::fs::read_to_string(&path).await.ok()?;
        markdown::parse(task_id, &content)
    }

    /// Serializes `task` via tmp-file + rename so a crash mid-write never
    /// leaves a partially-written task file observable.
    pub async fn write(&self, agent_id: &str, task: &mut Task) -> Result<()> {
        let path = self.task_path(agent_id, &task.id)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if task.work_session_id.is_empty() {
            task.work_session_id = format!("ws_{}", uuid::Uuid::new_v4());
        }

        let _lock = FileLock::acquire(&path).await?;
        let rendered = markdown::render(task);
        let tmp_path = path.with_extension("md.tmp");
        tokio::fs::write(&tmp_path, rendered).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        debug!(task_id = %task.id, agent_id, "wrote task file");
        Ok(())
    }

    /// Idempotent: removing an already-absent file is not an error.
    pub async fn delete(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let path = self.task_path(agent_id, task_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Lists all tasks for `agent_id`, optionally filtered by status, sorted
    /// by (priority asc, due_date asc [missing = +inf], start_date asc,
    /// created asc).
    pub async fn list(&self, agent_id: &str, status_filter: Option<TaskStatus>) -> Result<Vec<Task>> {
        let dir = self.tasks_dir(agent_id);
        let mut tasks = Vec::new();

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(tasks),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(task) = self.read(agent_id, stem).await else {
                warn!(path = %path.display(), "skipping unparsable task file");
                continue;
            };
            if status_filter.map(|f| f == task.status).unwrap_or(true) {
                tasks.push(task);
            }
        }

        tasks.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then_with(|| due_date_key(a).cmp(&due_date_key(b)))
                .then_with(|| start_date_key(a).cmp(&start_date_key(b)))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });

        Ok(tasks)
    }

    pub async fn find_active(&self, agent_id: &str) -> Result<Option<Task>> {
        Ok(self
            .list(agent_id, Some(TaskStatus::InProgress))
            .await?
            .into_iter()
            .next())
    }

    pub async fn find_blocked(&self, agent_id: &str) -> Result<Vec<Task>> {
        self.list(agent_id, Some(TaskStatus::Blocked)).await
    }

    pub async fn find_pending_approval(&self, agent_id: &str) -> Result<Vec<Task>> {
        self.list(agent_id, Some(TaskStatus::PendingApproval)).await
    }

    /// Backlog tasks excluding those with a future `start_date`.
    pub async fn find_backlog(&self, agent_id: &str) -> Result<Vec<Task>> {
        let now = chrono::Utc::now();
        Ok(self
            .list(agent_id, Some(TaskStatus::Backlog))
            .await?
            .into_iter()
            .filter(|t| {
                t.backlog
                    .as_ref()
                    .and_then(|b| b.start_date)
                    .map(|start| start <= now)
                    .unwrap_or(true)
            })
            .collect())
    }

    /// Backlog tasks whose dependencies are all met.
    pub async fn find_pickable_backlog(&self, agent_id: &str) -> Result<Vec<Task>> {
        let candidates = self.find_backlog(agent_id).await?;
        let mut pickable = Vec::new();
        for task in candidates {
            if self.check_dependencies_met(agent_id, &task).await? {
                pickable.push(task);
            }
        }
        Ok(pickable)
    }

    /// A missing dependency file counts as met (it was archived as
    /// completed); otherwise the dependency must itself be `completed`.
    pub async fn check_dependencies_met(&self, agent_id: &str, task: &Task) -> Result<bool> {
        let Some(backlog) = &task.backlog else {
            return Ok(true);
        };
        let Some(deps) = &backlog.depends_on else {
            return Ok(true);
        };
        for dep_id in deps {
            match self.read(agent_id, dep_id).await {
                Some(dep) if dep.status != TaskStatus::Completed => return Ok(false),
                Some(_) => {}
                None => {}
            }
        }
        Ok(true)
    }

    pub async fn update_current_task_pointer(
        &self,
        agent_id: &str,
        task_id: Option<&str>,
    ) -> Result<()> {
        let path = self.current_task_path(agent_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = match task_id {
            Some(id) => format!("**Focus:** {id}\n"),
            None => "*(No active focus task)*\n".to_string(),
        };
        let tmp = path.with_extension("md.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Appends a monthly history entry under a per-file (month) lock, adding
    /// the `# Task History - <Month Year>` header on first write.
    pub async fn append_to_history(&self, agent_id: &str, task: &Task) -> Result<()> {
        let now = chrono::Utc::now();
        let month_file = self
            .history_dir(agent_id)
            .join(format!("{}.md", now.format("%Y-%m")));

        if let Some(parent) = month_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let _lock = FileLock::acquire(&month_file).await?;

        let needs_header = !month_file.exists();
        let mut contents = if needs_header {
            format!("# Task History - {}\n\n", now.format("%B %Y"))
        } else {
            String::new()
        };

        contents.push_str(&format!(
            "## [{}] {}\n",
            now.to_rfc3339(),
            task.description
        ));
        if let Some(outcome) = &task.outcome {
            contents.push_str(&format!(
                "```json\n{}\n```\n",
                serde_json::to_string_pretty(outcome).unwrap_or_default()
            ));
        }
        contents.push('\n');

        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&month_file)
            .await?;
        file.write_all(contents.as_bytes()).await?;
        Ok(())
    }

    pub fn tasks_dir_path(&self, agent_id: &str) -> PathBuf {
        self.tasks_dir(agent_id)
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }
}

fn due_date_key(task: &Task) -> chrono::DateTime<chrono::Utc> {
    task.backlog
        .as_ref()
        .and_then(|b| b.due_date)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

fn start_date_key(task: &Task) -> chrono::DateTime<chrono::Utc> {
    task.backlog
        .as_ref()
        .and_then(|b| b.start_date)
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::{new_task_id, Priority};
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let mut task = Task::new(new_task_id(), "do the thing".into(), Priority::High, false);

        store.write("agent-a", &mut task).await.unwrap();
        let read_back = store.read("agent-a", &task.id).await.unwrap();

        assert_eq!(read_back.id, task.id);
        assert_eq!(read_back.description, task.description);
    }

    #[tokio::test]
    async fn rejects_path_traversal_ids() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        assert!(store.read("agent-a", "../etc/passwd").await.is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        store.delete("agent-a", "task_nonexistent").await.unwrap();
        store.delete("agent-a", "task_nonexistent").await.unwrap();
    }

    #[tokio::test]
    async fn list_sorts_by_priority_then_due_date() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());

        let mut low = Task::new(new_task_id(), "low".into(), Priority::Low, false);
        let mut urgent = Task::new(new_task_id(), "urgent".into(), Priority::Urgent, false);
        store.write("agent-a", &mut low).await.unwrap();
        store.write("agent-a", &mut urgent).await.unwrap();

        let listed = store.list("agent-a", None).await.unwrap();
        assert_eq!(listed[0].id, urgent.id);
        assert_eq!(listed[1].id, low.id);
    }

    #[tokio::test]
    async fn missing_dependency_file_counts_as_met() {
        let dir = TempDir::new().unwrap();
        let store = TaskStore::new(dir.path());
        let mut task = Task::new(new_task_id(), "depends".into(), Priority::Medium, false);
        task.status = TaskStatus::Backlog;
        task.backlog = Some(super::super::BacklogMetadata {
            created_by: "a".into(),
            assignee: "b".into(),
            depends_on: Some(vec!["task_missing".into()]),
            estimated_effort: None,
            start_date: None,
            due_date: None,
            milestone_id: None,
            milestone_item_id: None,
            reassign_count: 0,
        });

        assert!(store.check_dependencies_met("agent-a", &task).await.unwrap());
    }
}
