//! A2A Job Store & Reaper: one durable file per job, a finished bucket, and
//! a startup reaper that resumes or abandons in-flight flows.

use crate::constants;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Abandoned,
}

impl JobStatus {
    fn is_incomplete(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Failed | JobStatus::Abandoned)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    pub target_session_key: String,
    pub display_key: String,
    pub message: String,
    pub conversation_id: String,
    pub max_ping_pong_turns: u32,
    pub announce_timeout_ms: u64,
    pub status: JobStatus,
    pub current_turn: u32,
    pub resume_count: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub requester_session_key: Option<String>,
    pub task_id: Option<String>,
    pub work_session_id: Option<String>,
    pub parent_conversation_id: Option<String>,
    pub depth: Option<u32>,
    pub hop: Option<u32>,
    pub skip_ping_pong: Option<bool>,
    pub last_error: Option<String>,
}

impl JobRecord {
    pub fn new(
        job_id: String,
        target_session_key: String,
        display_key: String,
        message: String,
        conversation_id: String,
        max_ping_pong_turns: u32,
    ) -> Self {
        let now = chrono::Utc::now();
        JobRecord {
            job_id,
            target_session_key,
            display_key,
            message,
            conversation_id,
            max_ping_pong_turns,
            announce_timeout_ms: 30_000,
            status: JobStatus::Pending,
            current_turn: 0,
            resume_count: 0,
            created_at: now,
            updated_at: now,
            requester_session_key: None,
            task_id: None,
            work_session_id: None,
            parent_conversation_id: None,
            depth: None,
            hop: None,
            skip_ping_pong: None,
            last_error: None,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct ReaperReport {
    pub reset_to_pending: usize,
    pub abandoned: usize,
    pub cleaned_up: usize,
    pub total_incomplete: usize,
    pub resumable: Vec<String>,
}

#[derive(Clone)]
pub struct JobStore {
    root: PathBuf,
}

impl JobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JobStore { root: root.into() }
    }

    fn active_dir(&self) -> PathBuf {
        self.root.join("a2a-jobs")
    }

    fn finished_dir(&self) -> PathBuf {
        self.active_dir().join("finished")
    }

    fn active_path(&self, job_id: &str) -> PathBuf {
        self.active_dir().join(format!("{job_id}.json"))
    }

    fn finished_path(&self, job_id: &str) -> PathBuf {
        self.finished_dir().join(format!("{job_id}.json"))
    }

    pub async fn create(&self, job: &JobRecord) -> Result<()> {
        self.write_active(job).await
    }

    async fn write_active(&self, job: &JobRecord) -> Result<()> {
        let dir = self.active_dir();
        tokio::fs::create_dir_all(&dir).await?;
        let path = self.active_path(&job.job_id);
        write_atomic(&path, job).await
    }

    pub async fn load(&self, job_id: &str) -> Result<Option<JobRecord>> {
        read_json(&self.active_path(job_id)).await
    }

    /// Updates the record in place. Moves it into the finished bucket once
    /// its status becomes terminal.
    pub async fn save(&self, mut job: JobRecord) -> Result<()> {
        job.updated_at = chrono::Utc::now();
        if job.status.is_terminal() {
            tokio::fs::create_dir_all(self.finished_dir()).await?;
            write_atomic(&self.finished_path(&job.job_id), &job).await?;
            let _ = tokio::fs::remove_file(self.active_path(&job.job_id)).await;
        } else {
            self.write_active(&job).await?;
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<JobRecord>> {
        list_dir_json(&self.active_dir()).await
    }

    /// Deletes finished-bucket files older than the retention window.
    pub async fn cleanup_finished_jobs(&self) -> Result<usize> {
        let dir = self.finished_dir();
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let cutoff = std::time::SystemTime::now()
            .checked_sub(constants::A2A_FINISHED_RETENTION)
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let metadata = entry.metadata().await?;
            let modified = metadata.modified().unwrap_or(std::time::SystemTime::now());
            if modified < cutoff {
                tokio::fs::remove_file(&path).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Run on startup: resumes stale `RUNNING` jobs to `PENDING`, abandons
    /// jobs stale beyond the staleness TTL, and prunes old finished files.
    pub async fn reap(&self) -> Result<ReaperReport> {
        let incomplete = self.list_active().await?;
        let total_incomplete = incomplete.iter().filter(|j| j.status.is_incomplete()).count();

        let mut report = ReaperReport {
            total_incomplete,
            ..Default::default()
        };

        for mut job in incomplete {
            match job.status {
                JobStatus::Running => {
                    let now = chrono::Utc::now();
                    let stale = (now - job.updated_at)
                        > chrono::Duration::from_std(constants::A2A_JOB_STALENESS_TTL).unwrap();
                    if stale {
                        job.status = JobStatus::Abandoned;
                        job.last_error = Some("abandoned by reaper: stale beyond staleness TTL".into());
                        self.save(job.clone()).await?;
                        report.abandoned += 1;
                    } else {
                        job.status = JobStatus::Pending;
                        job.resume_count += 1;
                        self.save(job.clone()).await?;
                        report.reset_to_pending += 1;
                        report.resumable.push(job.job_id);
                    }
                }
                JobStatus::Pending => {
                    report.resumable.push(job.job_id);
                }
                _ => {}
            }
        }

        report.cleaned_up = self.cleanup_finished_jobs().await?;
        Ok(report)
    }
}

async fn write_atomic(path: &Path, job: &JobRecord) -> Result<()> {
    let rendered = serde_json::to_string_pretty(job)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, rendered).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

async fn read_json(path: &Path) -> Result<Option<JobRecord>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn list_dir_json(dir: &Path) -> Result<Vec<JobRecord>> {
    let mut out = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Ok(content) = tokio::fs::read_to_string(&path).await {
            out.push(serde_json::from_str::<JobRecord>(&content)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job(status: JobStatus, updated_minutes_ago: i64) -> JobRecord {
        let mut job = JobRecord::new(
            format!("job_{}", uuid::Uuid::new_v4().simple()),
            "agent:b:main".into(),
            "agent-b".into(),
            "hi".into(),
            "conv_1".into(),
            3,
        );
        job.status = status;
        job.updated_at = chrono::Utc::now() - chrono::Duration::minutes(updated_minutes_ago);
        job
    }

    #[tokio::test]
    async fn create_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let job = job(JobStatus::Pending, 0);
        store.create(&job).await.unwrap();
        let loaded = store.load(&job.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn terminal_save_moves_to_finished_bucket() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());
        let mut job = job(JobStatus::Running, 0);
        store.create(&job).await.unwrap();

        job.status = JobStatus::Done;
        store.save(job.clone()).await.unwrap();

        assert!(store.load(&job.job_id).await.unwrap().is_none());
        assert!(store.finished_path(&job.job_id).exists());
    }

    /// The startup reaper resumes fresh running jobs, abandons stale ones,
    /// and cleans up the finished bucket.
    #[tokio::test]
    async fn reaper_resumes_fresh_running_abandons_stale_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path());

        let fresh_running = job(JobStatus::Running, 1);
        let stale_running = job(JobStatus::Running, 121);
        let pending = job(JobStatus::Pending, 0);
        store.create(&fresh_running).await.unwrap();
        store.create(&stale_running).await.unwrap();
        store.create(&pending).await.unwrap();

        tokio::fs::create_dir_all(store.finished_dir()).await.unwrap();
        for _ in 0..10 {
            let aged = job(JobStatus::Done, 0);
            let path = store.finished_path(&aged.job_id);
            tokio::fs::write(&path, serde_json::to_string(&aged).unwrap()).await.unwrap();
            let old = std::time::SystemTime::now() - constants::A2A_FINISHED_RETENTION - std::time::Duration::from_secs(1);
            let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
            file.set_modified(old).unwrap();
        }

        let report = store.reap().await.unwrap();

        assert_eq!(report.abandoned, 1);
        assert_eq!(report.reset_to_pending, 1);
        assert_eq!(report.cleaned_up, 10);
        assert_eq!(report.total_incomplete, 3);
        assert!(report.resumable.contains(&fresh_running.job_id));
        assert!(report.resumable.contains(&pending.job_id));
    }
}
