//! Advisory file locking for task and history files.
//!
//! Grounded on the `fs2`-based daemon lock pattern used elsewhere in the
//! agent-orchestration ecosystem (lock file held for the duration of a
//! read-modify-write, with bounded retry rather than blocking indefinitely).

use crate::{constants, FleetError, Result};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

/// A held advisory lock over `path`. Dropping it releases the OS-level lock
/// and removes the `.lock` sidecar file.
pub struct FileLock {
    lock_path: PathBuf,
    writer_id: String,
    file: File,
}

impl FileLock {
    /// Acquires an exclusive lock for `resource_path`, retrying with bounded
    /// backoff. The lock file carries a unique writer suffix so a stale lock
    /// left by a crashed writer can't be mistaken for this acquisition (ABA).
    pub async fn acquire(resource_path: &Path) -> Result<Self> {
        let lock_path = sidecar_path(resource_path);
        let writer_id = Uuid::new_v4().to_string();

        if let Some(parent) = lock_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut delay_ms = constants::LOCK_RETRY_BASE_DELAY_MS;
        for attempt in 0..constants::LOCK_RETRY_ATTEMPTS {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&lock_path)?;

            match file.try_lock_exclusive() {
                Ok(()) => {
                    let mut file = file;
                    file.set_len(0)?;
                    file.seek(SeekFrom::Start(0))?;
                    file.write_all(writer_id.as_bytes())?;
                    file.flush()?;
                    return Ok(FileLock {
                        lock_path,
                        writer_id,
                        file,
                    })
                }
                Err(_) if attempt + 1 < constants::LOCK_RETRY_ATTEMPTS => {
                    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                    delay_ms = (delay_ms * 2).min(1_000);
                }
                Err(_) => {
                    warn!(resource = %resource_path.display(), "lock retry budget exhausted");
                    return Err(FleetError::Locked {
                        resource: resource_path.display().to_string(),
                    });
                }
            }
        }

        Err(FleetError::Locked {
            resource: resource_path.display().to_string(),
        })
    }

    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);

        // Only remove the sidecar if it still carries our writer suffix. A
        // crashed writer's stale lock file, reclaimed and rewritten by a
        // later acquirer, must not be deleted out from under them (ABA).
        let mut contents = String::new();
        let owned_by_us = std::fs::File::open(&self.lock_path)
            .and_then(|mut f| f.read_to_string(&mut contents))
            .map(|_| contents == self.writer_id)
            .unwrap_or(false);
        if owned_by_us {
            let _ = std::fs::remove_file(&self.lock_path);
        }
    }
}

fn sidecar_path(resource_path: &Path) -> PathBuf {
    let mut os = resource_path.as_os_str().to_owned();
    os.push(".lock");
    PathBuf::from(os)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn acquires_and_releases() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("task.md");
        std::fs::write(&target, "x").unwrap();

        let lock = FileLock::acquire(&target).await.unwrap();
        assert!(target.with_extension("md.lock").exists() || sidecar_path(&target).exists());
        drop(lock);
        assert!(!sidecar_path(&target).exists());
    }

    #[tokio::test]
    async fn second_writer_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let target = Arc::new(dir.path().join("task.md"));
        std::fs::write(&*target, "x").unwrap();

        let lock = FileLock::acquire(&target).await.unwrap();
        let target2 = target.clone();
        let handle = tokio::spawn(async move { FileLock::acquire(&target2).await });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        drop(lock);

        let second = handle.await.unwrap();
        assert!(second.is_ok());
    }
}
