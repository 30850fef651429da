//! Durable conversation history.
//!
//! The whole snapshot is rewritten on every save. Loading never fails: a
//! missing or corrupted file yields an empty snapshot so startup is never
//! blocked by bad history data.

use crate::message::Snapshot;
use async_trait::async_trait;
use briggie_common::error::{Error, Result, ResultExt};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Storage backend for conversation snapshots.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Read the persisted snapshot, or an empty one if nothing usable exists.
    async fn load(&self) -> Snapshot;

    /// Replace the persisted snapshot with `snapshot`.
    async fn save(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Single JSON file holding every user's conversation.
///
/// No locking: two processes sharing one file race and the last writer wins.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "chat_history.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl HistoryStore for JsonFileStore {
    async fn load(&self) -> Snapshot {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "No history file, starting empty");
                return Snapshot::new();
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "History file unreadable, starting empty");
                return Snapshot::new();
            }
        };

        match serde_json::from_str::<Snapshot>(&content) {
            Ok(snapshot) => {
                tracing::info!(
                    path = %self.path.display(),
                    users = snapshot.len(),
                    "History loaded"
                );
                snapshot
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "History file corrupted, starting empty");
                Snapshot::new()
            }
        }
    }

    async fn save(&self, snapshot: &Snapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .context(format!("creating {}", parent.display()))?;
            }
        }

        let json = serde_json::to_string_pretty(snapshot)?;

        // Write to a sibling temp file, then rename over the target
        let tmp_path = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .context(format!("creating {}", tmp_path.display()))?;
        file.write_all(json.as_bytes())
            .await
            .context(format!("writing {}", tmp_path.display()))?;
        file.sync_all()
            .await
            .context(format!("syncing {}", tmp_path.display()))?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await.map_err(|e| {
            Error::Storage(format!(
                "Failed to rename '{}' to '{}': {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(path = %self.path.display(), users = snapshot.len(), bytes = json.len(), "History saved");
        Ok(())
    }
}
