// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pre-flight checks run before an exploration provisions anything.
//!
//! The verdict is advisory. Errors mean the exploration cannot run; warnings
//! are reported and the caller decides.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::debug;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::exec::{run_checked, CommandRequest, CommandRunner};

/// Default memory a worktree's sandbox needs, in bytes.
pub const DEFAULT_MIN_MEMORY_PER_WORKTREE: u64 = 1024 * 1024 * 1024;
/// Default CPU cores a worktree's sandbox needs.
pub const DEFAULT_MIN_CORES_PER_WORKTREE: f64 = 0.5;

/// Repository state at validation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitState {
    pub is_repo: bool,
    /// `None` on a detached head.
    pub current_branch: Option<String>,
    /// `None` when `git status` could not be read.
    pub uncommitted_changes: Option<usize>,
    pub is_clean: bool,
    pub head_commit: Option<String>,
}

/// Host capacity at validation time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceAvailability {
    pub available_memory: u64,
    pub total_memory: u64,
    pub cpu_cores: usize,
    pub engine_available: bool,
    pub engine_version: Option<String>,
}

/// Outcome of [`SafetyValidator::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyReport {
    pub passed: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub git_state: GitState,
    pub resources: ResourceAvailability,
}

/// Thresholds used to judge host capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SafetyThresholds {
    pub min_memory_per_worktree: u64,
    pub min_cores_per_worktree: f64,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            min_memory_per_worktree: DEFAULT_MIN_MEMORY_PER_WORKTREE,
            min_cores_per_worktree: DEFAULT_MIN_CORES_PER_WORKTREE,
        }
    }
}

/// Probes git, the host and the container engine.
pub struct SafetyValidator {
    repo_root: PathBuf,
    engine: String,
    thresholds: SafetyThresholds,
    runner: Arc<dyn CommandRunner>,
}

impl SafetyValidator {
    pub fn new(repo_root: impl Into<PathBuf>, engine: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            repo_root: repo_root.into(),
            engine: engine.into(),
            thresholds: SafetyThresholds::default(),
            runner,
        }
    }

    pub fn with_thresholds(mut self, thresholds: SafetyThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    async fn git(&self, args: &[&str]) -> Option<String> {
        let request = CommandRequest::new("git")
            .args(args.iter().copied())
            .current_dir(&self.repo_root);
        run_checked(self.runner.as_ref(), &request)
            .await
            .ok()
            .map(|output| output.stdout_trimmed().to_string())
    }

    /// Inspect the repository. A directory that is not a repository yields
    /// `is_repo: false` rather than an error.
    pub async fn get_git_state(&self) -> GitState {
        let inside = self.git(&["rev-parse", "--is-inside-work-tree"]).await;
        if inside.as_deref() != Some("true") {
            return GitState::default();
        }

        let current_branch = self
            .git(&["symbolic-ref", "--quiet", "--short", "HEAD"])
            .await
            .filter(|b| !b.is_empty());
        let head_commit = self.git(&["rev-parse", "HEAD"]).await;
        let uncommitted_changes = self
            .git(&["status", "--porcelain"])
            .await
            .map(|s| s.lines().filter(|l| !l.trim().is_empty()).count());

        GitState {
            is_repo: true,
            current_branch,
            uncommitted_changes,
            is_clean: uncommitted_changes == Some(0),
            head_commit,
        }
    }

    /// Measure host memory, CPU cores and engine reachability.
    pub async fn get_resource_availability(&self) -> ResourceAvailability {
        let (available_memory, total_memory) = {
            let mut system = System::new();
            system.refresh_memory();
            (system.available_memory(), system.total_memory())
        };
        let cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        let request = CommandRequest::new(self.engine.clone())
            .args(["version", "--format", "{{.Server.Version}}"]);
        let engine_version = match run_checked(self.runner.as_ref(), &request).await {
            Ok(output) => Some(output.stdout_trimmed().to_string()),
            Err(e) => {
                debug!("Container engine '{}' unreachable: {}", self.engine, e);
                None
            }
        };

        ResourceAvailability {
            available_memory,
            total_memory,
            cpu_cores,
            engine_available: engine_version.is_some(),
            engine_version,
        }
    }

    /// Run every check for `planned_worktrees` parallel worktrees.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn validate(&self, planned_worktrees: u32) -> SafetyReport {
        let git_state = self.get_git_state().await;
        let resources = self.get_resource_availability().await;
        evaluate(planned_worktrees, git_state, resources, &self.thresholds)
    }
}

/// Turn raw probe results into a verdict.
pub fn evaluate(
    planned_worktrees: u32,
    git_state: GitState,
    resources: ResourceAvailability,
    thresholds: &SafetyThresholds,
) -> SafetyReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if planned_worktrees == 0 {
        errors.push("at least one worktree must be planned".to_string());
    }

    if !git_state.is_repo {
        errors.push("not a git repository".to_string());
    } else {
        if git_state.current_branch.is_none() {
            warnings.push("HEAD is detached".to_string());
        }
        match git_state.uncommitted_changes {
            None => warnings.push("could not read working tree status".to_string()),
            Some(0) => {}
            Some(changes) => warnings.push(format!(
                "working tree has {changes} uncommitted change(s); they will not be visible in worktrees"
            )),
        }
    }

    let count = u64::from(planned_worktrees);
    let needed_memory = thresholds.min_memory_per_worktree.saturating_mul(count);
    if resources.available_memory < needed_memory {
        errors.push(format!(
            "insufficient memory: {} MiB available, {} MiB needed for {} worktree(s)",
            resources.available_memory / (1024 * 1024),
            needed_memory / (1024 * 1024),
            planned_worktrees
        ));
    }

    let needed_cores = thresholds.min_cores_per_worktree * f64::from(planned_worktrees);
    if (resources.cpu_cores as f64) < needed_cores {
        errors.push(format!(
            "insufficient CPU: {} core(s) available, {:.1} needed for {} worktree(s)",
            resources.cpu_cores, needed_cores, planned_worktrees
        ));
    }

    if !resources.engine_available {
        errors.push("container engine is not reachable".to_string());
    }

    SafetyReport {
        passed: errors.is_empty(),
        errors,
        warnings,
        git_state,
        resources,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecError;
    use crate::explore::exec::{CommandOutput, MockCommandRunner};

    fn healthy_git() -> GitState {
        GitState {
            is_repo: true,
            current_branch: Some("main".to_string()),
            uncommitted_changes: Some(0),
            is_clean: true,
            head_commit: Some("abc".to_string()),
        }
    }

    fn roomy_host() -> ResourceAvailability {
        ResourceAvailability {
            available_memory: 64 * 1024 * 1024 * 1024,
            total_memory: 64 * 1024 * 1024 * 1024,
            cpu_cores: 16,
            engine_available: true,
            engine_version: Some("27.0.1".to_string()),
        }
    }

    #[test]
    fn test_healthy_passes() {
        let report = evaluate(3, healthy_git(), roomy_host(), &SafetyThresholds::default());
        assert!(report.passed);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_dirty_tree_is_warning_only() {
        let git = GitState {
            uncommitted_changes: Some(2),
            is_clean: false,
            current_branch: None,
            ..healthy_git()
        };
        let report = evaluate(1, git, roomy_host(), &SafetyThresholds::default());
        assert!(report.passed);
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_resource_shortfalls_are_errors() {
        let host = ResourceAvailability {
            available_memory: 512 * 1024 * 1024,
            cpu_cores: 1,
            engine_available: false,
            engine_version: None,
            ..roomy_host()
        };
        let report = evaluate(4, GitState::default(), host, &SafetyThresholds::default());
        assert!(!report.passed);
        assert_eq!(report.errors.len(), 4);
    }

    #[test]
    fn test_zero_worktrees_fails() {
        let report = evaluate(0, healthy_git(), roomy_host(), &SafetyThresholds::default());
        assert!(!report.passed);
    }

    #[tokio::test]
    async fn test_probes_through_runner() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|req| {
            let args: Vec<&str> = req.args.iter().map(String::as_str).collect();
            match (req.program.as_str(), args.as_slice()) {
                ("git", ["rev-parse", "--is-inside-work-tree"]) => Ok(CommandOutput::ok("true\n")),
                ("git", ["symbolic-ref", ..]) => Ok(CommandOutput::ok("main\n")),
                ("git", ["rev-parse", "HEAD"]) => Ok(CommandOutput::ok("deadbeef\n")),
                ("git", ["status", "--porcelain"]) => Ok(CommandOutput::ok(" M a.rs\n?? b.rs\n")),
                ("docker", ["version", ..]) => Err(ExecError::Timeout {
                    program: "docker".to_string(),
                    timeout_ms: 10,
                }),
                _ => Ok(CommandOutput::failed(1, "unexpected")),
            }
        });

        let validator = SafetyValidator::new("/repo", "docker", Arc::new(runner)).with_thresholds(
            SafetyThresholds {
                min_memory_per_worktree: 0,
                min_cores_per_worktree: 0.0,
            },
        );
        let report = validator.validate(2).await;

        assert_eq!(report.git_state.current_branch.as_deref(), Some("main"));
        assert_eq!(report.git_state.uncommitted_changes, Some(2));
        assert!(!report.git_state.is_clean);
        assert!(!report.resources.engine_available);
        assert!(!report.passed);
        assert_eq!(report.errors, vec!["container engine is not reachable".to_string()]);
    }

    #[tokio::test]
    async fn test_unreadable_status_is_not_clean() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|req| {
            let args: Vec<&str> = req.args.iter().map(String::as_str).collect();
            match args.as_slice() {
                ["rev-parse", "--is-inside-work-tree"] => Ok(CommandOutput::ok("true\n")),
                ["symbolic-ref", ..] => Ok(CommandOutput::ok("main\n")),
                ["rev-parse", "HEAD"] => Ok(CommandOutput::ok("deadbeef\n")),
                _ => Ok(CommandOutput::failed(128, "fatal: index file corrupt")),
            }
        });
        let validator = SafetyValidator::new("/repo", "docker", Arc::new(runner));
        let state = validator.get_git_state().await;
        assert!(state.is_repo);
        assert_eq!(state.uncommitted_changes, None);
        assert!(!state.is_clean);

        let report = evaluate(1, state, roomy_host(), &SafetyThresholds::default());
        assert!(report
            .warnings
            .contains(&"could not read working tree status".to_string()));
    }

    #[tokio::test]
    async fn test_not_a_repo() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Ok(CommandOutput::failed(128, "fatal: not a git repository")));
        let validator = SafetyValidator::new("/tmp", "docker", Arc::new(runner));
        let state = validator.get_git_state().await;
        assert!(!state.is_repo);
        assert!(!state.is_clean);
    }
}
