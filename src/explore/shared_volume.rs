// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The collaboration area shared by every worktree of one exploration.
//!
//! ```text
//! shared/
//! ├── insights-pool.json
//! ├── decisions-pool.json
//! ├── locks/
//! └── worktree-<N>/
//!     ├── progress.json
//!     ├── metrics.json
//!     └── latest-insight.json
//! ```
//!
//! All reads and writes after initialization go through the
//! [`FileLockManager`], so agents in different containers can append to the
//! pools concurrently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::lock::{write_json_atomic, FileLockManager};
use crate::error::ExploreError;

pub const INSIGHTS_POOL: &str = "insights-pool.json";
pub const DECISIONS_POOL: &str = "decisions-pool.json";
pub const LOCKS_DIR: &str = "locks";
pub const PROGRESS_FILE: &str = "progress.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const LATEST_INSIGHT_FILE: &str = "latest-insight.json";

/// One observation shared by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub id: String,
    pub worktree_index: u32,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    pub exploration_id: String,
}

/// One design decision recorded by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub id: String,
    pub worktree_index: u32,
    pub title: String,
    #[serde(default)]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_option: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub exploration_id: String,
}

/// Contents of `insights-pool.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InsightsPool {
    pub exploration_id: String,
    pub insights: Vec<Insight>,
}

/// Contents of `decisions-pool.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionsPool {
    pub exploration_id: String,
    pub decisions: Vec<Decision>,
}

/// Paths created by [`SharedVolumeManager::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedVolumeLayout {
    pub root_path: PathBuf,
    pub insights_pool_path: PathBuf,
    pub decisions_pool_path: PathBuf,
    pub locks_path: PathBuf,
    pub worktree_data_dirs: Vec<PathBuf>,
}

fn new_record_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &suffix[..12])
}

/// Owns one exploration's `shared/` directory.
#[derive(Debug, Clone)]
pub struct SharedVolumeManager {
    exploration_id: String,
    root: PathBuf,
    locks: Arc<FileLockManager>,
}

impl SharedVolumeManager {
    /// Create a manager for `root`, locking through `root/locks`.
    pub fn new(exploration_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let locks = Arc::new(FileLockManager::new(root.join(LOCKS_DIR)));
        Self {
            exploration_id: exploration_id.into(),
            root,
            locks,
        }
    }

    /// Use a preconfigured lock manager (timeout, metrics).
    pub fn with_lock_manager(mut self, locks: Arc<FileLockManager>) -> Self {
        self.locks = locks;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn insights_pool_path(&self) -> PathBuf {
        self.root.join(INSIGHTS_POOL)
    }

    pub fn decisions_pool_path(&self) -> PathBuf {
        self.root.join(DECISIONS_POOL)
    }

    pub fn worktree_dir(&self, index: u32) -> PathBuf {
        self.root.join(format!("worktree-{index}"))
    }

    /// Create the layout for `worktree_count` worktrees.
    ///
    /// Idempotent: existing non-empty pools and per-worktree files are left
    /// untouched.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(exploration = %self.exploration_id)))]
    pub async fn initialize(&self, worktree_count: u32) -> Result<SharedVolumeLayout, ExploreError> {
        let locks_path = self.root.join(LOCKS_DIR);
        tokio::fs::create_dir_all(&locks_path).await?;

        let insights_pool_path = self.insights_pool_path();
        if is_absent_or_empty(&insights_pool_path).await? {
            let pool = InsightsPool {
                exploration_id: self.exploration_id.clone(),
                insights: Vec::new(),
            };
            write_json_atomic(&insights_pool_path, &pool).await?;
        }

        let decisions_pool_path = self.decisions_pool_path();
        if is_absent_or_empty(&decisions_pool_path).await? {
            let pool = DecisionsPool {
                exploration_id: self.exploration_id.clone(),
                decisions: Vec::new(),
            };
            write_json_atomic(&decisions_pool_path, &pool).await?;
        }

        let mut worktree_data_dirs = Vec::with_capacity(worktree_count as usize);
        for index in 1..=worktree_count {
            let dir = self.worktree_dir(index);
            tokio::fs::create_dir_all(&dir).await?;
            for name in [PROGRESS_FILE, METRICS_FILE, LATEST_INSIGHT_FILE] {
                let file = dir.join(name);
                if is_absent_or_empty(&file).await? {
                    tokio::fs::write(&file, "{}").await?;
                }
            }
            worktree_data_dirs.push(dir);
        }

        debug!(
            "Initialized shared volume at {} for {} worktree(s)",
            self.root.display(),
            worktree_count
        );
        Ok(SharedVolumeLayout {
            root_path: self.root.clone(),
            insights_pool_path,
            decisions_pool_path,
            locks_path,
            worktree_data_dirs,
        })
    }

    /// Append an insight to the pool.
    pub async fn add_insight(
        &self,
        worktree_index: u32,
        content: impl Into<String>,
        tags: Vec<String>,
    ) -> Result<Insight, ExploreError> {
        let insight = Insight {
            id: new_record_id("ins"),
            worktree_index,
            content: content.into(),
            tags,
            timestamp: Utc::now(),
            exploration_id: self.exploration_id.clone(),
        };
        let exploration_id = self.exploration_id.clone();
        let record = insight.clone();
        self.locks
            .update_with_lock(
                &self.insights_pool_path(),
                &owner(worktree_index),
                move |mut pool: InsightsPool| {
                    if pool.exploration_id.is_empty() {
                        pool.exploration_id = exploration_id;
                    }
                    pool.insights.push(record);
                    pool
                },
            )
            .await?;
        Ok(insight)
    }

    /// Append a decision to the pool.
    pub async fn add_decision(
        &self,
        worktree_index: u32,
        title: impl Into<String>,
        rationale: impl Into<String>,
        chosen_option: Option<String>,
    ) -> Result<Decision, ExploreError> {
        let decision = Decision {
            id: new_record_id("dec"),
            worktree_index,
            title: title.into(),
            rationale: rationale.into(),
            chosen_option,
            timestamp: Utc::now(),
            exploration_id: self.exploration_id.clone(),
        };
        let exploration_id = self.exploration_id.clone();
        let record = decision.clone();
        self.locks
            .update_with_lock(
                &self.decisions_pool_path(),
                &owner(worktree_index),
                move |mut pool: DecisionsPool| {
                    if pool.exploration_id.is_empty() {
                        pool.exploration_id = exploration_id;
                    }
                    pool.decisions.push(record);
                    pool
                },
            )
            .await?;
        Ok(decision)
    }

    pub async fn read_insights(&self) -> Result<Vec<Insight>, ExploreError> {
        let pool: Option<InsightsPool> = self
            .locks
            .read_with_lock(&self.insights_pool_path(), "reader")
            .await?;
        Ok(pool.map(|p| p.insights).unwrap_or_default())
    }

    pub async fn read_decisions(&self) -> Result<Vec<Decision>, ExploreError> {
        let pool: Option<DecisionsPool> = self
            .locks
            .read_with_lock(&self.decisions_pool_path(), "reader")
            .await?;
        Ok(pool.map(|p| p.decisions).unwrap_or_default())
    }

    pub async fn write_progress(&self, worktree_index: u32, progress: &Value) -> Result<(), ExploreError> {
        let path = self.worktree_dir(worktree_index).join(PROGRESS_FILE);
        self.locks
            .write_with_lock(&path, progress, &owner(worktree_index))
            .await
    }

    /// Progress document of one worktree; `{}` when never written.
    pub async fn read_progress(&self, worktree_index: u32) -> Result<Value, ExploreError> {
        let path = self.worktree_dir(worktree_index).join(PROGRESS_FILE);
        let value: Option<Value> = self.locks.read_with_lock(&path, "reader").await?;
        Ok(value.unwrap_or_else(|| Value::Object(Default::default())))
    }

    pub async fn write_metrics(&self, worktree_index: u32, metrics: &Value) -> Result<(), ExploreError> {
        let path = self.worktree_dir(worktree_index).join(METRICS_FILE);
        self.locks
            .write_with_lock(&path, metrics, &owner(worktree_index))
            .await
    }

    pub async fn set_latest_insight(&self, insight: &Insight) -> Result<(), ExploreError> {
        let path = self.worktree_dir(insight.worktree_index).join(LATEST_INSIGHT_FILE);
        self.locks
            .write_with_lock(&path, insight, &owner(insight.worktree_index))
            .await
    }
}

fn owner(worktree_index: u32) -> String {
    format!("worktree-{worktree_index}")
}

async fn is_absent_or_empty(path: &Path) -> Result<bool, ExploreError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len() == 0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn volume(dir: &TempDir) -> SharedVolumeManager {
        SharedVolumeManager::new("exp-test", dir.path().join("shared"))
    }

    #[tokio::test]
    async fn test_initialize_layout() {
        let dir = TempDir::new().unwrap();
        let layout = volume(&dir).initialize(2).await.unwrap();

        assert!(layout.locks_path.is_dir());
        assert_eq!(layout.worktree_data_dirs.len(), 2);
        for data_dir in &layout.worktree_data_dirs {
            for name in [PROGRESS_FILE, METRICS_FILE, LATEST_INSIGHT_FILE] {
                assert_eq!(std::fs::read_to_string(data_dir.join(name)).unwrap(), "{}");
            }
        }

        let pool: InsightsPool =
            serde_json::from_str(&std::fs::read_to_string(&layout.insights_pool_path).unwrap()).unwrap();
        assert_eq!(pool.exploration_id, "exp-test");
        assert!(pool.insights.is_empty());

        let pool: DecisionsPool =
            serde_json::from_str(&std::fs::read_to_string(&layout.decisions_pool_path).unwrap()).unwrap();
        assert_eq!(pool.exploration_id, "exp-test");
        assert!(pool.decisions.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let volume = volume(&dir);
        volume.initialize(1).await.unwrap();
        volume.add_insight(1, "cache is cold", vec![]).await.unwrap();
        volume.write_progress(1, &json!({"step": 3})).await.unwrap();

        volume.initialize(1).await.unwrap();
        assert_eq!(volume.read_insights().await.unwrap().len(), 1);
        assert_eq!(volume.read_progress(1).await.unwrap(), json!({"step": 3}));
    }

    #[tokio::test]
    async fn test_pools_accumulate() {
        let dir = TempDir::new().unwrap();
        let volume = volume(&dir);
        volume.initialize(2).await.unwrap();

        let insight = volume
            .add_insight(2, "tests pass with sqlite", vec!["db".to_string()])
            .await
            .unwrap();
        volume.set_latest_insight(&insight).await.unwrap();
        volume
            .add_decision(1, "Use sqlite", "simpler", Some("sqlite".to_string()))
            .await
            .unwrap();

        let insights = volume.read_insights().await.unwrap();
        assert_eq!(insights, vec![insight.clone()]);
        assert_eq!(insights[0].exploration_id, "exp-test");

        let decisions = volume.read_decisions().await.unwrap();
        assert_eq!(decisions[0].chosen_option.as_deref(), Some("sqlite"));

        let latest: Insight = serde_json::from_str(
            &std::fs::read_to_string(volume.worktree_dir(2).join(LATEST_INSIGHT_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(latest.id, insight.id);
    }

    #[tokio::test]
    async fn test_concurrent_insights() {
        let dir = TempDir::new().unwrap();
        let volume = Arc::new(volume(&dir));
        volume.initialize(4).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 1..=4u32 {
            let volume = Arc::clone(&volume);
            tasks.spawn(async move {
                for n in 0..5 {
                    volume.add_insight(i, format!("note {n}"), vec![]).await?;
                }
                Ok::<_, ExploreError>(())
            });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        assert_eq!(volume.read_insights().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_metrics_and_missing_progress() {
        let dir = TempDir::new().unwrap();
        let volume = volume(&dir);
        assert_eq!(volume.read_progress(7).await.unwrap(), json!({}));

        volume.write_metrics(1, &json!({"tokens": 120})).await.unwrap();
        let raw = std::fs::read_to_string(volume.worktree_dir(1).join(METRICS_FILE)).unwrap();
        assert!(raw.contains("120"));
    }
}
