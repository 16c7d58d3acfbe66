use crate::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub continuation: ContinuationConfig,
    pub a2a: A2aConfig,
    pub milestone: MilestoneConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory holding `workspace-<agentId>/` subtrees, `team-state.json`,
    /// `logs/`, `plans/`, and `a2a-jobs/`.
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationConfig {
    pub poll_interval_secs: u64,
    pub task_idle_threshold_secs: u64,
    pub continuation_cooldown_secs: u64,
    pub zombie_task_ttl_secs: u64,
    pub max_zombie_reassigns: u32,
    pub max_unblock_requests: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct A2aConfig {
    pub max_concurrent_flows: usize,
    pub queue_timeout_ms: u64,
    pub job_staleness_ttl_secs: u64,
    pub finished_retention_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneConfig {
    /// Base URL for the milestone-sync HTTP collaborator (`TASK_HUB_URL`).
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub enable_auth: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    /// Loads configuration from environment variables (optionally seeded by
    /// a `.env` file), validating required fields and falling back to safe
    /// defaults for tunables the operator hasn't overridden.
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let root = env::var("TASK_MONITOR_WORKSPACE_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs_home()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".openclaw")
            });

        let workspace = WorkspaceConfig { root };

        let continuation = ContinuationConfig {
            poll_interval_secs: env_u64("CONTINUATION_POLL_INTERVAL_SECS", 120),
            task_idle_threshold_secs: env_u64("CONTINUATION_TASK_IDLE_SECS", 180),
            continuation_cooldown_secs: env_u64("CONTINUATION_COOLDOWN_SECS", 300),
            zombie_task_ttl_secs: env_u64("ZOMBIE_TASK_TTL_SECS", 24 * 3600),
            max_zombie_reassigns: env_u64("MAX_ZOMBIE_REASSIGNS", 3) as u32,
            max_unblock_requests: env_u64("MAX_UNBLOCK_REQUESTS", 3) as u32,
        };

        let a2a = A2aConfig {
            max_concurrent_flows: env_u64("A2A_MAX_CONCURRENT_FLOWS", 3) as usize,
            queue_timeout_ms: env_u64("A2A_QUEUE_TIMEOUT_MS", 30_000),
            job_staleness_ttl_secs: env_u64("A2A_JOB_STALENESS_TTL_SECS", 30 * 60),
            finished_retention_secs: env_u64("A2A_FINISHED_RETENTION_SECS", 7 * 24 * 3600),
        };

        let milestone = MilestoneConfig {
            base_url: env::var("TASK_HUB_URL").ok(),
        };

        // Authentication is mandatory for any deployment that binds beyond
        // localhost; require an explicit key rather than silently running open.
        let api_key = env::var("API_KEY").ok();
        if let Some(key) = &api_key {
            if key.trim().is_empty() {
                return Err(FleetError::validation("API_KEY cannot be blank"));
            }
            if key.len() < 32 {
                return Err(FleetError::validation(
                    "API_KEY must be at least 32 characters",
                ));
            }
        }

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000,http://127.0.0.1:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("TASK_MONITOR_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("TASK_MONITOR_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4000),
            enable_auth: api_key.is_some(),
            api_key,
            allowed_origins,
        };

        Ok(Config {
            workspace,
            continuation,
            a2a,
            milestone,
            api,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn dirs_home() -> Option<PathBuf> {
    env::var_os("HOME").map(PathBuf::from)
}
