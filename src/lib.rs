// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delve - parallel exploration engine.
//!
//! Runs several attempts at one coding task side by side. Every attempt gets
//! its own git worktree and branch, its own sandbox container with a unique
//! port, and a shared volume where agents pool insights and decisions.
//!
//! # Architecture
//!
//! The crate is organized into the following modules:
//!
//! - [`error`] - Error types and result aliases
//! - [`config`] - Configuration loading and merging
//! - [`telemetry`] - Tracing setup and command/lock metrics
//! - [`explore`] - Worktrees, containers, shared volume, state and the
//!   [`Explorer`] composition root
//!
//! # Example
//!
//! ```rust,ignore
//! use delve::config::{load_config, CliOptions};
//! use delve::Explorer;
//!
//! let config = load_config(repo_root, CliOptions::default())?;
//! let explorer = Explorer::new(config.clone());
//! let exploration = explorer.start("Try three caching designs", config.exploration).await?;
//! ```

pub mod config;
pub mod error;
pub mod explore;
pub mod telemetry;

// Re-export commonly used types at crate root
pub use config::{CliOptions, EngineConfig};
pub use error::{ConfigError, ExecError, ExploreError, Result, ValidationError};
pub use explore::{
    Exploration, ExplorationConfig, ExplorationStatus, ExplorationSummary, Explorer,
    WorktreeExploration, WorktreeStatus,
};

/// Delve version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
