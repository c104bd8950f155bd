// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Durable exploration records.
//!
//! Each exploration owns a directory under the explorations root:
//!
//! ```text
//! <root>/<exploration-id>/
//! ├── metadata.json   # the Exploration record
//! ├── state.json      # the record plus last_saved
//! └── shared/         # see shared_volume
//! ```
//!
//! Every mutation is load, patch, save. Saves go through a temporary file and
//! rename, and mutations within one manager are serialized.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::lock::{read_json, write_json_atomic};
use super::shared_volume::{Decision, Insight, SharedVolumeManager};
use super::types::{
    Exploration, ExplorationCheckpoint, ExplorationConfig, ExplorationStatus, ExplorationSummary,
    StatusExtras, WorktreeExploration, WorktreePatch,
};
use super::validation::validate_exploration_id;
use crate::error::{ConfigError, ExploreError};

pub const METADATA_FILE: &str = "metadata.json";
pub const STATE_FILE: &str = "state.json";
pub const SHARED_DIR: &str = "shared";

/// Persists and mutates [`Exploration`] records.
#[derive(Debug)]
pub struct ExplorationStateManager {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl ExplorationStateManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn exploration_dir(&self, id: &str) -> Result<PathBuf, ExploreError> {
        let id = validate_exploration_id(id)?;
        Ok(self.root.join(id))
    }

    pub fn shared_volume_path(&self, id: &str) -> Result<PathBuf, ExploreError> {
        Ok(self.exploration_dir(id)?.join(SHARED_DIR))
    }

    pub fn worktree_data_path(&self, id: &str, index: u32) -> Result<PathBuf, ExploreError> {
        Ok(self.shared_volume_path(id)?.join(format!("worktree-{index}")))
    }

    pub fn shared_volume(&self, id: &str) -> Result<SharedVolumeManager, ExploreError> {
        Ok(SharedVolumeManager::new(id, self.shared_volume_path(id)?))
    }

    pub async fn exploration_exists(&self, id: &str) -> Result<bool, ExploreError> {
        let dir = self.exploration_dir(id)?;
        Ok(tokio::fs::try_exists(dir.join(METADATA_FILE)).await?)
    }

    /// Create and persist a pending exploration.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, config)))]
    pub async fn create_exploration(
        &self,
        task: &str,
        config: ExplorationConfig,
    ) -> Result<Exploration, ExploreError> {
        if task.trim().is_empty() {
            return Err(ExploreError::Config(ConfigError::InvalidValue {
                field: "task".to_string(),
                message: "task must not be empty".to_string(),
            }));
        }
        config.validate().map_err(|message| {
            ExploreError::Config(ConfigError::InvalidValue {
                field: "exploration".to_string(),
                message,
            })
        })?;

        let exploration = Exploration::new(task.trim(), config);
        let _guard = self.write_lock.lock().await;
        self.write(&exploration).await?;
        info!(id = %exploration.id, "Created exploration");
        Ok(exploration)
    }

    /// Load a record, falling back to the checkpoint when the metadata file is
    /// missing or unreadable.
    pub async fn load_exploration(&self, id: &str) -> Result<Exploration, ExploreError> {
        let dir = self.exploration_dir(id)?;
        match read_json::<Exploration>(&dir.join(METADATA_FILE)).await {
            Ok(Some(exploration)) => return Ok(exploration),
            Ok(None) => {}
            Err(e) => warn!("Unreadable metadata for {}: {}", id, e),
        }
        match read_json::<ExplorationCheckpoint>(&dir.join(STATE_FILE)).await? {
            Some(checkpoint) => Ok(checkpoint.exploration),
            None => Err(ExploreError::NotFound(format!("exploration '{id}'"))),
        }
    }

    pub async fn save_exploration(&self, exploration: &Exploration) -> Result<(), ExploreError> {
        let _guard = self.write_lock.lock().await;
        self.write(exploration).await
    }

    async fn write(&self, exploration: &Exploration) -> Result<(), ExploreError> {
        let dir = self.exploration_dir(&exploration.id)?;
        tokio::fs::create_dir_all(&dir).await?;
        write_json_atomic(&dir.join(METADATA_FILE), exploration).await?;
        let checkpoint = ExplorationCheckpoint {
            exploration: exploration.clone(),
            last_saved: Utc::now(),
        };
        write_json_atomic(&dir.join(STATE_FILE), &checkpoint).await?;
        debug!(id = %exploration.id, status = %exploration.status, "Saved exploration");
        Ok(())
    }

    /// Load, transform and save under the manager's write lock.
    async fn mutate<F>(&self, id: &str, f: F) -> Result<Exploration, ExploreError>
    where
        F: FnOnce(&Exploration) -> Result<Exploration, ExploreError> + Send,
    {
        let _guard = self.write_lock.lock().await;
        let current = self.load_exploration(id).await?;
        let next = f(&current)?;
        self.write(&next).await?;
        Ok(next)
    }

    /// Move to `status`, applying any extra fields.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, extras)))]
    pub async fn update_status(
        &self,
        id: &str,
        status: ExplorationStatus,
        extras: StatusExtras,
    ) -> Result<Exploration, ExploreError> {
        let updated = self
            .mutate(id, |current| {
                Ok(current.with_status(status, Utc::now()).with_extras(&extras))
            })
            .await?;
        info!(id, %status, "Exploration status changed");
        Ok(updated)
    }

    pub async fn update_worktree(
        &self,
        id: &str,
        index: u32,
        patch: WorktreePatch,
    ) -> Result<Exploration, ExploreError> {
        self.mutate(id, |current| {
            let worktree = current.worktree(index).ok_or_else(|| {
                ExploreError::NotFound(format!("worktree {index} of exploration '{id}'"))
            })?;
            Ok(current.with_worktree(worktree.patched(&patch)))
        })
        .await
    }

    /// Record a worktree, replacing any entry with the same index.
    pub async fn add_worktree(
        &self,
        id: &str,
        worktree: WorktreeExploration,
    ) -> Result<Exploration, ExploreError> {
        self.mutate(id, |current| Ok(current.with_worktree(worktree))).await
    }

    /// Summaries of every readable exploration, newest first.
    pub async fn list_explorations(&self) -> Result<Vec<ExplorationSummary>, ExploreError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut summaries = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if validate_exploration_id(&name).is_err() {
                continue;
            }
            match read_json::<Exploration>(&entry.path().join(METADATA_FILE)).await {
                Ok(Some(exploration)) => summaries.push(exploration.summary()),
                Ok(None) => debug!("Skipping {} without metadata", name),
                Err(e) => warn!("Skipping corrupt exploration {}: {}", name, e),
            }
        }

        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(summaries)
    }

    /// Remove the whole directory of an exploration.
    pub async fn delete_exploration(&self, id: &str) -> Result<(), ExploreError> {
        let dir = self.exploration_dir(id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(id, "Deleted exploration");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ExploreError::NotFound(format!("exploration '{id}'")))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_insights(&self, id: &str) -> Result<Vec<Insight>, ExploreError> {
        self.shared_volume(id)?.read_insights().await
    }

    pub async fn read_decisions(&self, id: &str) -> Result<Vec<Decision>, ExploreError> {
        self.shared_volume(id)?.read_decisions().await
    }
}
