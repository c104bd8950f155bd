// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration type definitions.
//!
//! [`WorkspaceConfig`] is what a config file may contain; every field is
//! optional. [`EngineConfig`] is the fully resolved result.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::explore::exec::{DEFAULT_COMMAND_TIMEOUT, DEFAULT_MAX_OUTPUT_BYTES};
use crate::explore::lock::DEFAULT_LOCK_TIMEOUT;
use crate::explore::safety::{DEFAULT_MIN_CORES_PER_WORKTREE, DEFAULT_MIN_MEMORY_PER_WORKTREE};
use crate::explore::{ExecutionMode, ExplorationConfig};

/// Directory (relative to the repository) holding engine state.
pub const STATE_DIR: &str = ".delve";

/// Default upper bound on worktrees in the repository.
pub const DEFAULT_MAX_WORKTREES: usize = 20;

/// Configuration as written in `.delve.json` and friends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceConfig {
    /// Where exploration records live. Relative paths resolve against the repo.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explorations_root: Option<PathBuf>,

    /// Where exploration worktrees are created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worktree_root: Option<PathBuf>,

    /// Container engine CLI (`docker`, `podman`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_engine: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_timeout_ms: Option<u64>,

    /// Per-stream output cap for external commands.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_bytes: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_memory_per_worktree_mb: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_cores_per_worktree: Option<f64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_worktrees: Option<usize>,

    /// Defaults for new explorations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exploration: Option<ExplorationDefaults>,
}

/// Partial [`ExplorationConfig`] for config files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorationDefaults {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branches: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategies: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_merge: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_cleanup: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_start: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_end: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<ExecutionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl ExplorationDefaults {
    pub(crate) fn apply_to(&self, config: &mut ExplorationConfig) {
        if let Some(branches) = self.branches {
            config.branches = branches;
        }
        if let Some(ref strategies) = self.strategies {
            config.strategies = strategies.clone();
        }
        if let Some(minutes) = self.timeout_minutes {
            config.timeout_minutes = minutes;
        }
        if let Some(ref image) = self.docker_image {
            config.docker_image = image.clone();
        }
        if let Some(ref cpu) = self.cpu_limit {
            config.cpu_limit = cpu.clone();
        }
        if let Some(ref memory) = self.memory_limit {
            config.memory_limit = memory.clone();
        }
        if let Some(auto_merge) = self.auto_merge {
            config.auto_merge = auto_merge;
        }
        if let Some(no_cleanup) = self.no_cleanup {
            config.no_cleanup = no_cleanup;
        }
        if let Some(start) = self.port_range_start {
            config.port_range_start = start;
        }
        if let Some(end) = self.port_range_end {
            config.port_range_end = end;
        }
        if let Some(mode) = self.mode {
            config.mode = mode;
        }
        if let Some(ref command) = self.command {
            config.command = command.clone();
        }
    }
}

/// Fully resolved engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub repo_root: PathBuf,
    pub explorations_root: PathBuf,
    pub worktree_root: PathBuf,
    pub container_engine: String,
    pub command_timeout: Duration,
    pub max_output_bytes: usize,
    pub lock_timeout: Duration,
    /// Bytes.
    pub min_memory_per_worktree: u64,
    pub min_cores_per_worktree: f64,
    pub max_worktrees: usize,
    pub exploration: ExplorationConfig,
}

impl EngineConfig {
    /// Defaults for a repository at `repo_root`.
    pub fn for_repo(repo_root: impl AsRef<Path>) -> Self {
        let repo_root = repo_root.as_ref().to_path_buf();
        let state_dir = repo_root.join(STATE_DIR);
        Self {
            explorations_root: state_dir.join("explorations"),
            worktree_root: state_dir.join("worktrees"),
            repo_root,
            container_engine: "docker".to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            min_memory_per_worktree: DEFAULT_MIN_MEMORY_PER_WORKTREE,
            min_cores_per_worktree: DEFAULT_MIN_CORES_PER_WORKTREE,
            max_worktrees: DEFAULT_MAX_WORKTREES,
            exploration: ExplorationConfig::default(),
        }
    }

    /// Resolve a configured path against the repository root.
    pub(crate) fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_config_camel_case() {
        let json = r#"{
            "explorationsRoot": "/data/exp",
            "containerEngine": "podman",
            "lockTimeoutMs": 2500,
            "exploration": {"branches": 5, "dockerImage": "rust:1", "mode": "sequential"}
        }"#;
        let config: WorkspaceConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.explorations_root, Some(PathBuf::from("/data/exp")));
        assert_eq!(config.container_engine.as_deref(), Some("podman"));
        let exploration = config.exploration.unwrap();
        assert_eq!(exploration.branches, Some(5));
        assert_eq!(exploration.mode, Some(ExecutionMode::Sequential));
    }

    #[test]
    fn test_yaml_workspace_config() {
        let yaml = "containerEngine: podman\nmaxWorktrees: 4\nexploration:\n  memoryLimit: 2g\n";
        let config: WorkspaceConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.max_worktrees, Some(4));
        assert_eq!(
            config.exploration.and_then(|e| e.memory_limit).as_deref(),
            Some("2g")
        );
    }

    #[test]
    fn test_sandbox_command_from_yaml() {
        let yaml = "exploration:\n  autoMerge: true\n  command: [npm, run, agent]\n";
        let config: WorkspaceConfig = serde_yaml::from_str(yaml).unwrap();
        let mut exploration = ExplorationConfig::default();
        config.exploration.unwrap().apply_to(&mut exploration);
        assert!(exploration.auto_merge);
        assert_eq!(exploration.command, vec!["npm", "run", "agent"]);
    }

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::for_repo("/repo");
        assert_eq!(config.explorations_root, PathBuf::from("/repo/.delve/explorations"));
        assert_eq!(config.worktree_root, PathBuf::from("/repo/.delve/worktrees"));
        assert_eq!(config.container_engine, "docker");
        assert_eq!(config.resolve_path(Path::new("x")), PathBuf::from("/repo/x"));
        assert_eq!(config.resolve_path(Path::new("/abs")), PathBuf::from("/abs"));
    }

    #[test]
    fn test_defaults_apply() {
        let mut config = ExplorationConfig::default();
        ExplorationDefaults {
            branches: Some(2),
            no_cleanup: Some(true),
            ..Default::default()
        }
        .apply_to(&mut config);
        assert_eq!(config.branches, 2);
        assert!(config.no_cleanup);
        assert_eq!(config.docker_image, "node:20-bookworm");
    }
}
