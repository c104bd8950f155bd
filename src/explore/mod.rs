// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Parallel exploration engine.
//!
//! Runs several independent attempts at one task, each in its own git
//! worktree and sandbox container, sharing insights through a lock-protected
//! volume.
//!
//! # Components
//!
//! - [`validation`]: input checks for branch names, paths, refs and free text
//! - [`exec`]: shell-free process execution behind [`CommandRunner`]
//! - [`resources`]: port and limit allocation per worktree
//! - [`lock`]: advisory file locks for shared JSON documents
//! - [`worktree`]: git worktree lifecycle with batch rollback
//! - [`container`]: sandbox lifecycle through the engine CLI
//! - [`safety`]: pre-flight checks
//! - [`shared_volume`]: insights/decisions pools and per-worktree data
//! - [`state`]: durable exploration records
//! - [`explorer`]: the composition root
//!
//! # Example
//!
//! ```rust,no_run
//! use delve::config::EngineConfig;
//! use delve::explore::{ExplorationConfig, Explorer};
//!
//! # async fn example() -> Result<(), delve::error::ExploreError> {
//! let explorer = Explorer::new(EngineConfig::for_repo("/path/to/repo"));
//! let exploration = explorer
//!     .start("Add caching to the API client", ExplorationConfig::default())
//!     .await?;
//! explorer.finish(&exploration.id, true).await?;
//! # Ok(())
//! # }
//! ```

pub mod container;
pub mod exec;
pub mod explorer;
pub mod lock;
pub mod resources;
pub mod safety;
pub mod shared_volume;
pub mod state;
pub mod types;
pub mod validation;
pub mod worktree;

pub use container::{ContainerManager, ContainerSpec, ContainerState};
pub use exec::{CommandOutput, CommandRequest, CommandRunner, SafeExecutor};
pub use explorer::{branch_name, container_name, CleanupReport, Explorer};
pub use lock::{FileLockManager, LockGuard};
pub use resources::{AllocationRequest, ResourceAllocation, ResourceAllocator};
pub use safety::{GitState, ResourceAvailability, SafetyReport, SafetyThresholds, SafetyValidator};
pub use shared_volume::{
    Decision, DecisionsPool, Insight, InsightsPool, SharedVolumeLayout, SharedVolumeManager,
};
pub use state::ExplorationStateManager;
pub use types::{
    ExecutionMode, Exploration, ExplorationConfig, ExplorationResults, ExplorationStatus,
    ExplorationSummary, StatusExtras, WorktreeExploration, WorktreePatch, WorktreeStatus,
};
pub use validation::{
    validate_branch_name, validate_exploration_id, validate_git_ref, validate_path,
    validate_reason_text,
};
pub use worktree::{CreatedWorktree, WorktreeInfo, WorktreeManager, WorktreeOptions};
