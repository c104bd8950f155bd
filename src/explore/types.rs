// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Core types for explorations.
//!
//! An [`Exploration`] is a value record. Updates produce a new record through
//! the `with_*` functions and the whole record is saved again, so a record on
//! disk is always either the old or the new version.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Configuration
// ============================================================================

/// How worktree/container pairs are started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    Sequential,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parallel => write!(f, "parallel"),
            Self::Sequential => write!(f, "sequential"),
        }
    }
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(Self::Parallel),
            "sequential" => Ok(Self::Sequential),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

/// Per-exploration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorationConfig {
    /// Number of parallel worktrees.
    #[serde(default = "default_branches")]
    pub branches: u32,
    /// Optional per-branch strategy labels, matched by position.
    #[serde(default)]
    pub strategies: Vec<String>,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    #[serde(default = "default_cpu_limit")]
    pub cpu_limit: String,
    #[serde(default = "default_memory_limit")]
    pub memory_limit: String,
    /// Tells the sandboxed agents they may merge a winning branch themselves.
    #[serde(default)]
    pub auto_merge: bool,
    #[serde(default)]
    pub no_cleanup: bool,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Command each sandbox runs; empty keeps the sandbox idle for `exec`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

fn default_branches() -> u32 {
    3
}

fn default_timeout_minutes() -> u32 {
    30
}

fn default_docker_image() -> String {
    "node:20-bookworm".to_string()
}

fn default_cpu_limit() -> String {
    "2".to_string()
}

fn default_memory_limit() -> String {
    "4g".to_string()
}

fn default_port_range_start() -> u16 {
    3000
}

fn default_port_range_end() -> u16 {
    3099
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        Self {
            branches: default_branches(),
            strategies: Vec::new(),
            timeout_minutes: default_timeout_minutes(),
            docker_image: default_docker_image(),
            cpu_limit: default_cpu_limit(),
            memory_limit: default_memory_limit(),
            auto_merge: false,
            no_cleanup: false,
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            mode: ExecutionMode::default(),
            command: Vec::new(),
        }
    }
}

impl ExplorationConfig {
    /// Strategy label for a 1-based worktree index.
    pub fn strategy_for(&self, index: u32) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.strategies.get(i as usize))
            .map(String::as_str)
    }

    /// Check the settings for internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.branches == 0 {
            return Err("branches must be at least 1".to_string());
        }
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(format!(
                "invalid port range {}-{}",
                self.port_range_start, self.port_range_end
            ));
        }
        let range = u32::from(self.port_range_end - self.port_range_start) + 1;
        if range < self.branches {
            return Err(format!(
                "port range {}-{} is too small for {} branches",
                self.port_range_start, self.port_range_end, self.branches
            ));
        }
        if parse_memory_limit(&self.memory_limit).is_none() {
            return Err(format!("invalid memory limit: {}", self.memory_limit));
        }
        match self.cpu_limit.parse::<f64>() {
            Ok(cpus) if cpus > 0.0 => {}
            _ => return Err(format!("invalid cpu limit: {}", self.cpu_limit)),
        }
        Ok(())
    }
}

/// Parse a container-engine style memory limit (`512m`, `4g`, `1024`) into bytes.
pub fn parse_memory_limit(limit: &str) -> Option<u64> {
    let limit = limit.trim().to_ascii_lowercase();
    let limit = limit.strip_suffix('b').unwrap_or(&limit);
    let (digits, multiplier) = match limit.chars().last()? {
        'k' => (&limit[..limit.len() - 1], 1024u64),
        'm' => (&limit[..limit.len() - 1], 1024 * 1024),
        'g' => (&limit[..limit.len() - 1], 1024 * 1024 * 1024),
        c if c.is_ascii_digit() => (limit, 1),
        _ => return None,
    };
    let value: u64 = digits.parse().ok()?;
    if value == 0 {
        return None;
    }
    value.checked_mul(multiplier)
}

// ============================================================================
// Status
// ============================================================================

/// Lifecycle status of an exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplorationStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl ExplorationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl std::fmt::Display for ExplorationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Status of one worktree within an exploration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorktreeStatus {
    Created,
    Running,
    Completed,
    Failed,
}

impl std::fmt::Display for WorktreeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Records
// ============================================================================

/// One branch/attempt within an exploration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorktreeExploration {
    /// 1-based index, stable for the life of the exploration.
    pub index: u32,
    pub branch: String,
    pub path: PathBuf,
    pub status: WorktreeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorktreeExploration {
    pub fn new(index: u32, branch: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            index,
            branch: branch.into(),
            path: path.into(),
            status: WorktreeStatus::Created,
            strategy: None,
            container_id: None,
            port: None,
            error: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Option<String>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Apply a patch, returning the updated record.
    pub fn patched(&self, patch: &WorktreePatch) -> Self {
        let mut next = self.clone();
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(container_id) = &patch.container_id {
            next.container_id = Some(container_id.clone());
        }
        if let Some(port) = patch.port {
            next.port = Some(port);
        }
        if let Some(error) = &patch.error {
            next.error = Some(error.clone());
        }
        next
    }
}

/// Partial update for a [`WorktreeExploration`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorktreePatch {
    pub status: Option<WorktreeStatus>,
    pub container_id: Option<String>,
    pub port: Option<u16>,
    pub error: Option<String>,
}

impl WorktreePatch {
    pub fn status(status: WorktreeStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_container(mut self, container_id: impl Into<String>, port: u16) -> Self {
        self.container_id = Some(container_id.into());
        self.port = Some(port);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Aggregated outcome of an exploration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExplorationResults {
    pub insights_collected: usize,
    #[serde(default)]
    pub decisions_collected: usize,
    #[serde(default)]
    pub successful_worktrees: usize,
    #[serde(default)]
    pub failed_worktrees: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// Extra fields applied together with a status change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusExtras {
    pub results: Option<ExplorationResults>,
    pub error: Option<String>,
}

/// Root record of one exploration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exploration {
    pub id: String,
    pub task: String,
    pub config: ExplorationConfig,
    pub status: ExplorationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub worktrees: Vec<WorktreeExploration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ExplorationResults>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Exploration {
    /// Create a pending exploration with a freshly generated id.
    pub fn new(task: impl Into<String>, config: ExplorationConfig) -> Self {
        let now = Utc::now();
        Self {
            id: generate_exploration_id(now),
            task: task.into(),
            config,
            status: ExplorationStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            worktrees: Vec::new(),
            results: None,
            error: None,
        }
    }

    /// Transition to `status` at time `now`.
    ///
    /// `started_at` is set only on the first move into `running` and
    /// `completed_at` only on the first move into a terminal status; existing
    /// timestamps are never overwritten.
    pub fn with_status(&self, status: ExplorationStatus, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.status = status;
        if status == ExplorationStatus::Running && next.started_at.is_none() {
            next.started_at = Some(now);
        }
        if status.is_terminal() && next.completed_at.is_none() {
            next.completed_at = Some(now);
        }
        next
    }

    pub fn with_extras(&self, extras: &StatusExtras) -> Self {
        let mut next = self.clone();
        if let Some(results) = &extras.results {
            next.results = Some(results.clone());
        }
        if let Some(error) = &extras.error {
            next.error = Some(error.clone());
        }
        next
    }

    /// Replace the worktree with the same index, or append a new one.
    pub fn with_worktree(&self, worktree: WorktreeExploration) -> Self {
        let mut next = self.clone();
        match next.worktrees.iter_mut().find(|w| w.index == worktree.index) {
            Some(existing) => *existing = worktree,
            None => next.worktrees.push(worktree),
        }
        next
    }

    pub fn worktree(&self, index: u32) -> Option<&WorktreeExploration> {
        self.worktrees.iter().find(|w| w.index == index)
    }

    pub fn summary(&self) -> ExplorationSummary {
        ExplorationSummary {
            id: self.id.clone(),
            task: self.task.clone(),
            status: self.status,
            branches: self.config.branches,
            worktree_count: self.worktrees.len(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Lightweight listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorationSummary {
    pub id: String,
    pub task: String,
    pub status: ExplorationStatus,
    pub branches: u32,
    pub worktree_count: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Runtime checkpoint stored next to the metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorationCheckpoint {
    #[serde(flatten)]
    pub exploration: Exploration,
    pub last_saved: DateTime<Utc>,
}

/// Generate an id of the form `exp-<yyyymmddHHMMSSmmm>-<8 hex>`.
pub fn generate_exploration_id(now: DateTime<Utc>) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("exp-{}-{}", now.format("%Y%m%d%H%M%S%3f"), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_exploration_id_format() {
        let id = generate_exploration_id(Utc::now());
        assert!(id.starts_with("exp-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 17);
        assert_eq!(parts[2].len(), 8);
        assert!(crate::explore::validation::validate_exploration_id(&id).is_ok());
    }

    #[test]
    fn test_status_timestamps_set_once() {
        let t0 = Utc::now();
        let t1 = t0 + Duration::seconds(5);
        let t2 = t0 + Duration::seconds(10);

        let exp = Exploration::new("task", ExplorationConfig::default());
        let running = exp.with_status(ExplorationStatus::Running, t0);
        assert_eq!(running.started_at, Some(t0));

        let again = running.with_status(ExplorationStatus::Running, t1);
        assert_eq!(again.started_at, Some(t0));
        assert!(again.completed_at.is_none());

        let done = again.with_status(ExplorationStatus::Completed, t1);
        assert_eq!(done.completed_at, Some(t1));
        let failed_later = done.with_status(ExplorationStatus::Failed, t2);
        assert_eq!(failed_later.completed_at, Some(t1));
        assert_eq!(failed_later.started_at, Some(t0));
    }

    #[test]
    fn test_with_worktree_replaces_by_index() {
        let exp = Exploration::new("task", ExplorationConfig::default())
            .with_worktree(WorktreeExploration::new(2, "b", "/w/2"))
            .with_worktree(WorktreeExploration::new(1, "a", "/w/1"));

        let patched = exp.worktree(1).unwrap().patched(&WorktreePatch::status(WorktreeStatus::Running));
        let exp = exp.with_worktree(patched);

        assert_eq!(exp.worktrees.len(), 2);
        assert_eq!(exp.worktrees[0].index, 2);
        assert_eq!(exp.worktrees[0].status, WorktreeStatus::Created);
        assert_eq!(exp.worktrees[1].status, WorktreeStatus::Running);
    }

    #[test]
    fn test_config_validation() {
        assert!(ExplorationConfig::default().validate().is_ok());

        let config = ExplorationConfig {
            branches: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ExplorationConfig {
            branches: 5,
            port_range_start: 4000,
            port_range_end: 4002,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ExplorationConfig {
            memory_limit: "lots".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("4g"), Some(4 * 1024 * 1024 * 1024));
        assert_eq!(parse_memory_limit("512m"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("512MB"), Some(512 * 1024 * 1024));
        assert_eq!(parse_memory_limit("1024"), Some(1024));
        assert_eq!(parse_memory_limit("0g"), None);
        assert_eq!(parse_memory_limit("g"), None);
        assert_eq!(parse_memory_limit(""), None);
    }

    #[test]
    fn test_strategy_for() {
        let config = ExplorationConfig {
            strategies: vec!["minimal".to_string(), "rewrite".to_string()],
            ..Default::default()
        };
        assert_eq!(config.strategy_for(1), Some("minimal"));
        assert_eq!(config.strategy_for(2), Some("rewrite"));
        assert_eq!(config.strategy_for(3), None);
        assert_eq!(config.strategy_for(0), None);
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: ExplorationConfig =
            serde_json::from_str(r#"{"branches": 2, "mode": "sequential"}"#).unwrap();
        assert_eq!(config.branches, 2);
        assert_eq!(config.mode, ExecutionMode::Sequential);
        assert_eq!(config.docker_image, "node:20-bookworm");
    }
}
