// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Handles merging configurations from different sources with proper precedence.

use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::explore::ExecutionMode;

use super::types::{EngineConfig, WorkspaceConfig};

/// CLI options that can override configuration.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub container_engine: Option<String>,
    pub branches: Option<u32>,
    pub strategies: Option<Vec<String>>,
    pub mode: Option<ExecutionMode>,
    pub docker_image: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
    pub timeout_minutes: Option<u32>,
    pub no_cleanup: Option<bool>,
}

/// Merge multiple configurations with precedence.
///
/// Precedence (highest to lowest):
/// 1. CLI options
/// 2. Local config (.delve.local.json)
/// 3. Workspace config (.delve.json, .delve/config.json, .delve/config.yaml)
/// 4. Global config (~/.delve/config.json)
/// 5. Default values
pub fn merge_config(
    repo_root: &Path,
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> Result<EngineConfig, ConfigError> {
    let mut result = EngineConfig::for_repo(repo_root);

    for config in [global, workspace, local].into_iter().flatten() {
        apply_workspace_config(&mut result, &config);
    }

    apply_cli_options(&mut result, &cli);
    validate(&result)?;

    Ok(result)
}

fn apply_workspace_config(result: &mut EngineConfig, config: &WorkspaceConfig) {
    if let Some(ref root) = config.explorations_root {
        result.explorations_root = result.resolve_path(root);
    }

    if let Some(ref root) = config.worktree_root {
        result.worktree_root = result.resolve_path(root);
    }

    if let Some(ref engine) = config.container_engine {
        result.container_engine = engine.clone();
    }

    if let Some(ms) = config.command_timeout_ms {
        result.command_timeout = Duration::from_millis(ms);
    }

    if let Some(bytes) = config.max_output_bytes {
        result.max_output_bytes = bytes;
    }

    if let Some(ms) = config.lock_timeout_ms {
        result.lock_timeout = Duration::from_millis(ms);
    }

    if let Some(mb) = config.min_memory_per_worktree_mb {
        result.min_memory_per_worktree = mb.saturating_mul(1024 * 1024);
    }

    if let Some(cores) = config.min_cores_per_worktree {
        result.min_cores_per_worktree = cores;
    }

    if let Some(max) = config.max_worktrees {
        result.max_worktrees = max;
    }

    if let Some(ref exploration) = config.exploration {
        exploration.apply_to(&mut result.exploration);
    }
}

fn apply_cli_options(result: &mut EngineConfig, cli: &CliOptions) {
    if let Some(ref engine) = cli.container_engine {
        result.container_engine = engine.clone();
    }

    let exploration = &mut result.exploration;
    if let Some(branches) = cli.branches {
        exploration.branches = branches;
    }
    if let Some(ref strategies) = cli.strategies {
        exploration.strategies = strategies.clone();
    }
    if let Some(mode) = cli.mode {
        exploration.mode = mode;
    }
    if let Some(ref image) = cli.docker_image {
        exploration.docker_image = image.clone();
    }
    if let Some(ref cpu) = cli.cpu_limit {
        exploration.cpu_limit = cpu.clone();
    }
    if let Some(ref memory) = cli.memory_limit {
        exploration.memory_limit = memory.clone();
    }
    if let Some(minutes) = cli.timeout_minutes {
        exploration.timeout_minutes = minutes;
    }
    if let Some(no_cleanup) = cli.no_cleanup {
        exploration.no_cleanup = no_cleanup;
    }
}

fn validate(config: &EngineConfig) -> Result<(), ConfigError> {
    let invalid = |field: &str, message: String| ConfigError::InvalidValue {
        field: field.to_string(),
        message,
    };

    if config.container_engine.trim().is_empty() {
        return Err(invalid("containerEngine", "must not be empty".to_string()));
    }
    if config.command_timeout.is_zero() {
        return Err(invalid("commandTimeoutMs", "must be positive".to_string()));
    }
    if config.max_output_bytes == 0 {
        return Err(invalid("maxOutputBytes", "must be positive".to_string()));
    }
    if config.lock_timeout.is_zero() {
        return Err(invalid("lockTimeoutMs", "must be positive".to_string()));
    }
    if config.min_cores_per_worktree.is_nan() || config.min_cores_per_worktree < 0.0 {
        return Err(invalid(
            "minCoresPerWorktree",
            format!("must be non-negative, got {}", config.min_cores_per_worktree),
        ));
    }
    config
        .exploration
        .validate()
        .map_err(|message| invalid("exploration", message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::ExplorationDefaults;
    use std::path::PathBuf;

    #[test]
    fn test_default_config() {
        let config = merge_config(Path::new("/repo"), None, None, None, CliOptions::default()).unwrap();
        assert_eq!(config, EngineConfig::for_repo("/repo"));
    }

    #[test]
    fn test_merge_config_precedence() {
        let global = WorkspaceConfig {
            container_engine: Some("podman".to_string()),
            max_worktrees: Some(5),
            exploration: Some(ExplorationDefaults {
                docker_image: Some("global:1".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let workspace = WorkspaceConfig {
            max_worktrees: Some(7),
            exploration: Some(ExplorationDefaults {
                docker_image: Some("workspace:1".to_string()),
                branches: Some(4),
                ..Default::default()
            }),
            ..Default::default()
        };

        let local = WorkspaceConfig {
            max_worktrees: Some(9),
            ..Default::default()
        };

        let cli = CliOptions {
            container_engine: Some("docker".to_string()),
            branches: Some(2),
            ..Default::default()
        };

        let result = merge_config(Path::new("/repo"), Some(global), Some(workspace), Some(local), cli).unwrap();

        assert_eq!(result.container_engine, "docker");
        assert_eq!(result.max_worktrees, 9);
        assert_eq!(result.exploration.docker_image, "workspace:1");
        assert_eq!(result.exploration.branches, 2);
    }

    #[test]
    fn test_relative_roots_resolve_against_repo() {
        let workspace = WorkspaceConfig {
            explorations_root: Some(PathBuf::from("state/exp")),
            worktree_root: Some(PathBuf::from("/scratch/wt")),
            min_memory_per_worktree_mb: Some(256),
            ..Default::default()
        };
        let result = merge_config(Path::new("/repo"), None, Some(workspace), None, CliOptions::default()).unwrap();
        assert_eq!(result.explorations_root, PathBuf::from("/repo/state/exp"));
        assert_eq!(result.worktree_root, PathBuf::from("/scratch/wt"));
        assert_eq!(result.min_memory_per_worktree, 256 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let workspace = WorkspaceConfig {
            lock_timeout_ms: Some(0),
            ..Default::default()
        };
        assert!(merge_config(Path::new("/repo"), None, Some(workspace), None, CliOptions::default()).is_err());

        let cli = CliOptions {
            branches: Some(0),
            ..Default::default()
        };
        let err = merge_config(Path::new("/repo"), None, None, None, cli).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_cli_options_override() {
        let workspace = WorkspaceConfig {
            exploration: Some(ExplorationDefaults {
                no_cleanup: Some(false),
                mode: Some(ExecutionMode::Parallel),
                ..Default::default()
            }),
            ..Default::default()
        };

        let cli = CliOptions {
            no_cleanup: Some(true),
            mode: Some(ExecutionMode::Sequential),
            memory_limit: Some("8g".to_string()),
            ..Default::default()
        };

        let result = merge_config(Path::new("/repo"), None, Some(workspace), None, cli).unwrap();

        assert!(result.exploration.no_cleanup);
        assert_eq!(result.exploration.mode, ExecutionMode::Sequential);
        assert_eq!(result.exploration.memory_limit, "8g");
    }
}
