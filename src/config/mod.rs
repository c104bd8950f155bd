// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration module for delve.
//!
//! Handles loading, merging, and validation of configuration from multiple sources:
//! - Global config: ~/.delve/config.json
//! - Workspace config: .delve.json, .delve/config.json, or .delve/config.yaml
//! - Local config: .delve.local.json (gitignored, for personal overrides)
//! - CLI options: command-line arguments
//!
//! Configuration is merged with precedence (CLI > local > workspace > global > defaults).

mod loader;
mod merger;
mod types;

pub use loader::{
    find_repo_root, get_global_config_dir, get_global_config_path, load_config_file,
    load_global_config, load_local_config, load_workspace_config, CONFIG_FILES, GLOBAL_CONFIG_DIR,
    GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};

pub use merger::{merge_config, CliOptions};

pub use types::{EngineConfig, ExplorationDefaults, WorkspaceConfig, DEFAULT_MAX_WORKTREES, STATE_DIR};

use crate::error::ConfigError;
use std::path::Path;

/// Load and merge all configuration sources for a repository.
pub fn load_config(repo_root: &Path, cli_options: CliOptions) -> Result<EngineConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(repo_root)?;
    let local = load_local_config(repo_root)?;

    merge_config(repo_root, global, workspace, local, cli_options)
}
