//! Milestone-sync HTTP collaborator (`TASK_HUB_URL`).
//!
//! Out of scope as a subsystem, but the Task Lifecycle Engine's Complete
//! operation calls into it, so it gets a thin `reqwest`-based client here —
//! grounded on how `claude_code::cli_client` wraps its own outbound calls
//! with a narrow typed surface.

use crate::constants;
use async_trait::async_trait;
use tracing::warn;

#[async_trait]
pub trait MilestoneSync: Send + Sync {
    async fn sync_item(&self, milestone_id: &str, item_id: &str, payload: serde_json::Value) -> Result<(), String>;
}

pub struct HttpMilestoneSync {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMilestoneSync {
    pub fn new(base_url: String) -> Self {
        HttpMilestoneSync {
            client: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl MilestoneSync for HttpMilestoneSync {
    async fn sync_item(&self, milestone_id: &str, item_id: &str, payload: serde_json::Value) -> Result<(), String> {
        let url = format!(
            "{}/milestones/{}/items/{}",
            self.base_url.trim_end_matches('/'),
            milestone_id,
            item_id
        );
        self.client
            .put(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Retries `sync_item` up to `MILESTONE_SYNC_ATTEMPTS` with exponential
/// backoff clamped to `[MILESTONE_SYNC_BACKOFF_MIN, MILESTONE_SYNC_BACKOFF_MAX]`.
/// Returns `Err` only after exhausting the retry budget; callers must not
/// fail task completion on this result.
pub async fn sync_with_retry(
    sync: &dyn MilestoneSync,
    milestone_id: &str,
    item_id: &str,
    payload: serde_json::Value,
) -> Result<(), String> {
    let mut delay = constants::MILESTONE_SYNC_BACKOFF_MIN;
    let mut last_err = String::new();

    for attempt in 0..constants::MILESTONE_SYNC_ATTEMPTS {
        match sync.sync_item(milestone_id, item_id, payload.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => {
                last_err = e;
                if attempt + 1 < constants::MILESTONE_SYNC_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(constants::MILESTONE_SYNC_BACKOFF_MAX);
                }
            }
        }
    }

    warn!(milestone_id, item_id, error = %last_err, "milestone sync failed after retries");
    Err(last_err)
}
