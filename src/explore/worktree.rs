// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Git worktree lifecycle for exploration branches.
//!
//! Every worktree lives under one configured root, one directory per
//! exploration attempt:
//!
//! ```text
//! /project/                          # Main repo
//! ├── .git/
//! └── .delve/worktrees/
//!     └── exp-20260101120000000-1a2b3c4d/
//!         ├── wt-1/                  # branch delve/<id>/wt-1
//!         └── wt-2/                  # branch delve/<id>/wt-2
//! ```
//!
//! Batch creation is all-or-nothing: when one worktree fails, the ones created
//! earlier in the same batch are removed again in reverse order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::exec::{run_checked, CommandRequest, CommandRunner};
use super::validation::{validate_branch_name, validate_git_ref, validate_path, validate_reason_text};
use crate::error::{ExecError, ExploreError};

/// Options for creating one worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeOptions {
    /// Branch to check out, created unless it exists and reuse is allowed.
    pub branch: String,
    /// Absolute path, or path relative to the worktree root.
    pub path: PathBuf,
    /// Ref to branch from; `HEAD` when unset.
    pub base_ref: Option<String>,
    /// Check out `branch` when it already exists instead of failing.
    pub reuse_branch: bool,
}

impl WorktreeOptions {
    pub fn new(branch: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            branch: branch.into(),
            path: path.into(),
            base_ref: None,
            reuse_branch: false,
        }
    }

    pub fn with_base_ref(mut self, base_ref: impl Into<String>) -> Self {
        self.base_ref = Some(base_ref.into());
        self
    }

    pub fn with_existing_branch(mut self) -> Self {
        self.reuse_branch = true;
        self
    }
}

/// One entry of `git worktree list --porcelain`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub is_bare: bool,
    pub is_detached: bool,
    pub is_locked: bool,
    pub lock_reason: Option<String>,
}

/// A worktree created by this manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedWorktree {
    pub branch: String,
    pub path: PathBuf,
    /// False when the branch already existed before creation.
    pub branch_created: bool,
}

/// Compensating action recorded while a batch is being built.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RollbackStep {
    RemoveWorktree(PathBuf),
    DeleteBranch(String),
}

/// Creates and removes git worktrees under a single root.
pub struct WorktreeManager {
    repo_root: PathBuf,
    worktree_root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl WorktreeManager {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        worktree_root: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            repo_root: repo_root.into(),
            worktree_root: worktree_root.into(),
            runner,
        }
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn worktree_root(&self) -> &Path {
        &self.worktree_root
    }

    /// Run a git command in the main repository and return trimmed stdout.
    async fn git(&self, args: &[&str]) -> Result<String, ExecError> {
        let request = CommandRequest::new("git")
            .args(args.iter().copied())
            .current_dir(&self.repo_root);
        let output = run_checked(self.runner.as_ref(), &request).await?;
        Ok(output.stdout_trimmed().to_string())
    }

    async fn branch_exists(&self, branch: &str) -> bool {
        let reference = format!("refs/heads/{branch}");
        self.git(&["rev-parse", "--verify", "--quiet", &reference])
            .await
            .is_ok()
    }

    /// True when no local branch with this name exists.
    pub async fn is_branch_name_available(&self, name: &str) -> Result<bool, ExploreError> {
        let branch = validate_branch_name(name)?;
        Ok(!self.branch_exists(&branch).await)
    }

    /// True when git knows a worktree at `path`.
    pub async fn worktree_exists(&self, path: &Path) -> Result<bool, ExploreError> {
        let path = validate_path(path, &self.worktree_root)?;
        let worktrees = self.list_worktrees().await?;
        Ok(worktrees.iter().any(|w| same_path(&w.path, &path)))
    }

    /// List all worktrees, including the main one.
    pub async fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, ExploreError> {
        let output = self
            .git(&["worktree", "list", "--porcelain"])
            .await
            .map_err(|e| ExploreError::git("list worktrees", e))?;
        Ok(parse_worktree_list(&output))
    }

    /// Fail when `max` worktrees (or more) already exist.
    pub async fn check_worktree_limit(&self, max: usize) -> Result<(), ExploreError> {
        let count = self.list_worktrees().await?.len();
        if count >= max {
            return Err(ExploreError::ResourceExhaustion(format!(
                "worktree limit reached: {count} of {max}"
            )));
        }
        Ok(())
    }

    /// Create a worktree, on a new branch unless an existing one may be reused.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(branch = %options.branch)))]
    pub async fn create_worktree(&self, options: &WorktreeOptions) -> Result<CreatedWorktree, ExploreError> {
        let branch = validate_branch_name(&options.branch)?;
        let path = validate_path(&options.path, &self.worktree_root)?;
        let base = match &options.base_ref {
            Some(base) => validate_git_ref(base)?,
            None => "HEAD".to_string(),
        };

        let existed = self.branch_exists(&branch).await;
        if existed && !options.reuse_branch {
            return Err(ExploreError::Conflict(format!("branch '{branch}' already exists")));
        }
        if path.exists() {
            return Err(ExploreError::Conflict(format!(
                "path already exists: {}",
                path.display()
            )));
        }
        let made_dirs = match path.parent() {
            Some(parent) => create_missing_dirs(parent).await?,
            None => Vec::new(),
        };

        info!("Creating worktree for {} at {}", branch, path.display());
        let path_str = path.to_string_lossy().to_string();
        let added = if existed {
            self.git(&["worktree", "add", &path_str, &branch]).await
        } else {
            self.git(&["worktree", "add", "-b", &branch, &path_str, &base]).await
        };
        if let Err(e) = added {
            for dir in made_dirs.iter().rev() {
                if let Err(e) = tokio::fs::remove_dir(dir).await {
                    debug!("Could not remove {}: {}", dir.display(), e);
                }
            }
            return Err(ExploreError::git(format!("create worktree for '{branch}'"), e));
        }

        debug!("Created worktree for {} at {}", branch, path.display());
        Ok(CreatedWorktree {
            branch,
            path,
            branch_created: !existed,
        })
    }

    /// Remove a worktree.
    ///
    /// When git refuses and `force` is set, the directory is deleted by hand and
    /// stale worktree records are pruned.
    #[cfg_attr(feature = "telemetry", instrument(skip(self), fields(path = %path.display())))]
    pub async fn remove_worktree(&self, path: &Path, force: bool) -> Result<(), ExploreError> {
        let path = validate_path(path, &self.worktree_root)?;
        let path_str = path.to_string_lossy().to_string();
        info!("Removing worktree at {}", path.display());

        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(&path_str);

        match self.git(&args).await {
            Ok(_) => Ok(()),
            Err(e) if force => {
                warn!("Failed to remove worktree via git: {}", e);
                if path.exists() {
                    tokio::fs::remove_dir_all(&path).await?;
                }
                if let Err(e) = self.git(&["worktree", "prune"]).await {
                    warn!("Failed to prune worktrees: {}", e);
                }
                Ok(())
            }
            Err(e) => Err(ExploreError::git(format!("remove worktree {}", path.display()), e)),
        }
    }

    pub async fn lock_worktree(&self, path: &Path, reason: &str) -> Result<(), ExploreError> {
        let path = validate_path(path, &self.worktree_root)?;
        let reason = validate_reason_text(reason);
        let path_str = path.to_string_lossy().to_string();

        let mut args = vec!["worktree", "lock"];
        if !reason.is_empty() {
            args.push("--reason");
            args.push(&reason);
        }
        args.push(&path_str);
        self.git(&args)
            .await
            .map_err(|e| ExploreError::git(format!("lock worktree {}", path.display()), e))?;
        Ok(())
    }

    pub async fn unlock_worktree(&self, path: &Path) -> Result<(), ExploreError> {
        let path = validate_path(path, &self.worktree_root)?;
        let path_str = path.to_string_lossy().to_string();
        self.git(&["worktree", "unlock", &path_str])
            .await
            .map_err(|e| ExploreError::git(format!("unlock worktree {}", path.display()), e))?;
        Ok(())
    }

    pub async fn delete_branch(&self, name: &str, force: bool) -> Result<(), ExploreError> {
        let branch = validate_branch_name(name)?;
        let flag = if force { "-D" } else { "-d" };
        self.git(&["branch", flag, &branch])
            .await
            .map_err(|e| ExploreError::git(format!("delete branch '{branch}'"), e))?;
        Ok(())
    }

    /// Create several worktrees in order, all or nothing.
    ///
    /// On the first failure every worktree created earlier in the batch is
    /// force-removed in reverse order and the branches this call created are
    /// force-deleted. Rollback problems are logged and never replace the
    /// original error. When anything was rolled back, the error is wrapped in
    /// [`ExploreError::PartialFailure`].
    #[cfg_attr(feature = "telemetry", instrument(skip(self, options), fields(count = options.len())))]
    pub async fn create_multiple_worktrees(
        &self,
        options: &[WorktreeOptions],
    ) -> Result<Vec<CreatedWorktree>, ExploreError> {
        let mut created = Vec::with_capacity(options.len());
        let mut steps: Vec<RollbackStep> = Vec::new();

        for option in options {
            match self.create_worktree(option).await {
                Ok(worktree) => {
                    if worktree.branch_created {
                        steps.push(RollbackStep::DeleteBranch(worktree.branch.clone()));
                    }
                    steps.push(RollbackStep::RemoveWorktree(worktree.path.clone()));
                    created.push(worktree);
                }
                Err(err) => {
                    let rolled_back = created.len();
                    warn!(
                        "Worktree batch failed at '{}', rolling back {} worktree(s)",
                        option.branch, rolled_back
                    );
                    self.rollback(steps).await;

                    if rolled_back == 0 {
                        return Err(err);
                    }
                    return Err(ExploreError::PartialFailure {
                        failed_branch: option.branch.clone(),
                        rolled_back,
                        source: Box::new(err),
                    });
                }
            }
        }

        Ok(created)
    }

    async fn rollback(&self, steps: Vec<RollbackStep>) {
        for step in steps.into_iter().rev() {
            let result = match &step {
                RollbackStep::RemoveWorktree(path) => self.remove_worktree(path, true).await,
                RollbackStep::DeleteBranch(branch) => self.delete_branch(branch, true).await,
            };
            if let Err(e) = result {
                warn!("Rollback step {:?} failed: {}", step, e);
            }
        }
    }
}

/// Create `dir` and its missing ancestors, returning the directories that
/// were created, outermost first.
async fn create_missing_dirs(dir: &Path) -> Result<Vec<PathBuf>, ExploreError> {
    let mut missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|ancestor| !ancestor.exists())
        .map(Path::to_path_buf)
        .collect();
    missing.reverse();
    tokio::fs::create_dir_all(dir).await?;
    Ok(missing)
}

fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Parse `git worktree list --porcelain` output.
pub fn parse_worktree_list(output: &str) -> Vec<WorktreeInfo> {
    let mut worktrees = Vec::new();
    let mut current = WorktreeInfo::default();

    for line in output.lines() {
        if let Some(path) = line.strip_prefix("worktree ") {
            if !current.path.as_os_str().is_empty() {
                worktrees.push(std::mem::take(&mut current));
            }
            current.path = PathBuf::from(path);
        } else if let Some(head) = line.strip_prefix("HEAD ") {
            current.head = head.to_string();
        } else if let Some(branch) = line.strip_prefix("branch ") {
            let branch = branch.strip_prefix("refs/heads/").unwrap_or(branch);
            current.branch = Some(branch.to_string());
        } else if line == "bare" {
            current.is_bare = true;
        } else if line == "detached" {
            current.is_detached = true;
        } else if line == "locked" {
            current.is_locked = true;
        } else if let Some(reason) = line.strip_prefix("locked ") {
            current.is_locked = true;
            current.lock_reason = Some(reason.to_string());
        }
    }

    if !current.path.as_os_str().is_empty() {
        worktrees.push(current);
    }

    worktrees
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::explore::exec::SafeExecutor;
    use tempfile::TempDir;

    // ========================================================================
    // Porcelain parsing
    // ========================================================================

    #[test]
    fn test_parse_worktree_list() {
        let output = "worktree /repo\nHEAD abc123\nbranch refs/heads/main\n\n\
                      worktree /repo/.delve/worktrees/exp/wt-1\nHEAD def456\nbranch refs/heads/delve/exp/wt-1\nlocked agent running\n\n\
                      worktree /tmp/detached\nHEAD 789\ndetached\nlocked\n";
        let list = parse_worktree_list(output);
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].branch.as_deref(), Some("main"));
        assert!(!list[0].is_locked);
        assert_eq!(list[1].branch.as_deref(), Some("delve/exp/wt-1"));
        assert_eq!(list[1].lock_reason.as_deref(), Some("agent running"));
        assert!(list[2].is_detached);
        assert!(list[2].is_locked);
        assert!(list[2].lock_reason.is_none());
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_worktree_list("").is_empty());
    }

    // ========================================================================
    // Real git repositories
    // ========================================================================

    fn git_sync(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .expect("git should run");
        assert!(status.status.success(), "git {:?} failed: {:?}", args, status);
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        git_sync(dir.path(), &["init", "-q", "-b", "main"]);
        git_sync(dir.path(), &["config", "user.email", "test@example.com"]);
        git_sync(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "hello\n").unwrap();
        git_sync(dir.path(), &["add", "."]);
        git_sync(dir.path(), &["commit", "-q", "-m", "init"]);
        dir
    }

    fn manager(repo: &TempDir) -> WorktreeManager {
        WorktreeManager::new(
            repo.path(),
            repo.path().join(".delve/worktrees"),
            Arc::new(SafeExecutor::new()),
        )
    }

    fn wt(repo: &TempDir, branch: &str, dir: &str) -> WorktreeOptions {
        WorktreeOptions::new(branch, repo.path().join(".delve/worktrees").join(dir))
    }

    #[tokio::test]
    async fn test_create_list_remove() {
        let repo = init_repo();
        let manager = manager(&repo);
        let options = wt(&repo, "feature/x", "one");

        let created = manager.create_worktree(&options).await.unwrap();
        assert!(created.path.join("README.md").exists());
        assert!(manager.worktree_exists(&created.path).await.unwrap());
        assert!(!manager.is_branch_name_available("feature/x").await.unwrap());

        let list = manager.list_worktrees().await.unwrap();
        assert!(list.iter().any(|w| w.branch.as_deref() == Some("feature/x")));

        manager.remove_worktree(&created.path, false).await.unwrap();
        assert!(!created.path.exists());
        manager.delete_branch("feature/x", false).await.unwrap();
        assert!(manager.is_branch_name_available("feature/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_relative_path_is_joined_to_root() {
        let repo = init_repo();
        let manager = manager(&repo);
        let created = manager
            .create_worktree(&WorktreeOptions::new("rel", "exp/wt-1"))
            .await
            .unwrap();
        assert_eq!(created.path, repo.path().join(".delve/worktrees/exp/wt-1"));
    }

    #[tokio::test]
    async fn test_invalid_inputs_have_no_side_effects() {
        let repo = init_repo();
        let manager = manager(&repo);

        let err = manager
            .create_worktree(&wt(&repo, "bad;rm -rf", "bad"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExploreError::Validation(_)));

        let err = manager
            .create_worktree(&WorktreeOptions::new("ok", repo.path().join("outside")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExploreError::Validation(_)));

        assert_eq!(manager.list_worktrees().await.unwrap().len(), 1);
        assert!(!repo.path().join("outside").exists());
    }

    #[tokio::test]
    async fn test_existing_branch_conflicts() {
        let repo = init_repo();
        let manager = manager(&repo);
        git_sync(repo.path(), &["branch", "taken"]);

        let err = manager.create_worktree(&wt(&repo, "taken", "t")).await.unwrap_err();
        assert!(matches!(err, ExploreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_existing_branch_can_be_reused() {
        let repo = init_repo();
        let manager = manager(&repo);
        git_sync(repo.path(), &["branch", "shared-base"]);

        let created = manager
            .create_worktree(&wt(&repo, "shared-base", "reuse").with_existing_branch())
            .await
            .unwrap();
        assert!(!created.branch_created);
        assert!(created.path.join("README.md").exists());

        let fresh = manager
            .create_worktree(&wt(&repo, "brand-new", "new").with_existing_branch())
            .await
            .unwrap();
        assert!(fresh.branch_created);
    }

    #[tokio::test]
    async fn test_failed_add_leaves_no_empty_directories() {
        let repo = init_repo();
        let manager = manager(&repo);
        let options = wt(&repo, "from-nowhere", "exp-x/wt-1").with_base_ref("no-such-ref");

        let err = manager.create_worktree(&options).await.unwrap_err();
        assert!(matches!(err, ExploreError::GitOperation { .. }), "got {err:?}");
        assert!(!repo.path().join(".delve/worktrees/exp-x").exists());
        assert!(!repo.path().join(".delve").exists());
        assert!(manager.is_branch_name_available("from-nowhere").await.unwrap());
    }

    #[tokio::test]
    async fn test_worktree_limit() {
        let repo = init_repo();
        let manager = manager(&repo);
        assert!(manager.check_worktree_limit(0).await.is_err());
        assert!(manager.check_worktree_limit(1).await.is_err());
        assert!(manager.check_worktree_limit(100).await.is_ok());
    }

    #[tokio::test]
    async fn test_lock_and_unlock() {
        let repo = init_repo();
        let manager = manager(&repo);
        let created = manager.create_worktree(&wt(&repo, "locked", "l")).await.unwrap();

        manager
            .lock_worktree(&created.path, "agent; running $(now)")
            .await
            .unwrap();
        let list = manager.list_worktrees().await.unwrap();
        let entry = list.iter().find(|w| w.branch.as_deref() == Some("locked")).unwrap();
        assert!(entry.is_locked);
        let reason = entry.lock_reason.clone().unwrap_or_default();
        assert!(!reason.contains(';'));
        assert!(!reason.contains('$'));

        manager.unlock_worktree(&created.path).await.unwrap();
        let list = manager.list_worktrees().await.unwrap();
        let entry = list.iter().find(|w| w.branch.as_deref() == Some("locked")).unwrap();
        assert!(!entry.is_locked);
    }

    #[tokio::test]
    async fn test_batch_success() {
        let repo = init_repo();
        let manager = manager(&repo);
        let created = manager
            .create_multiple_worktrees(&[wt(&repo, "a", "a"), wt(&repo, "b", "b")])
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert!(created.iter().all(|w| w.path.exists()));
    }

    #[tokio::test]
    async fn test_batch_rollback_on_duplicate() {
        let repo = init_repo();
        let manager = manager(&repo);
        let a = wt(&repo, "a", "a");
        let b = wt(&repo, "b", "b");
        let dup = wt(&repo, "a", "c");

        let err = manager
            .create_multiple_worktrees(&[a.clone(), b.clone(), dup])
            .await
            .unwrap_err();
        match &err {
            ExploreError::PartialFailure {
                failed_branch,
                rolled_back,
                source,
            } => {
                assert_eq!(failed_branch, "a");
                assert_eq!(*rolled_back, 2);
                assert!(matches!(**source, ExploreError::Conflict(_)));
            }
            other => panic!("unexpected error: {other}"),
        }

        assert!(!a.path.exists());
        assert!(!b.path.exists());
        assert!(manager.is_branch_name_available("a").await.unwrap());
        assert!(manager.is_branch_name_available("b").await.unwrap());
        assert_eq!(manager.list_worktrees().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_batch_first_failure_returns_original_error() {
        let repo = init_repo();
        let manager = manager(&repo);
        let err = manager
            .create_multiple_worktrees(&[wt(&repo, "..bad", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, ExploreError::Validation(_)));
    }

    #[tokio::test]
    async fn test_rollback_keeps_reused_branch() {
        let repo = init_repo();
        let manager = manager(&repo);
        git_sync(repo.path(), &["branch", "reused"]);

        let err = manager
            .create_multiple_worktrees(&[
                wt(&repo, "reused", "reused").with_existing_branch(),
                wt(&repo, "..bad", "bad"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ExploreError::PartialFailure { rolled_back: 1, .. }));

        assert!(!repo.path().join(".delve/worktrees/reused").exists());
        assert!(!manager.is_branch_name_available("reused").await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_never_deletes_preexisting_branch() {
        let repo = init_repo();
        let manager = manager(&repo);
        git_sync(repo.path(), &["branch", "keep-me"]);

        let err = manager
            .create_multiple_worktrees(&[wt(&repo, "fresh", "fresh"), wt(&repo, "keep-me", "keep")])
            .await
            .unwrap_err();
        assert!(matches!(err, ExploreError::PartialFailure { rolled_back: 1, .. }));

        assert!(!manager.is_branch_name_available("keep-me").await.unwrap());
        assert!(manager.is_branch_name_available("fresh").await.unwrap());
    }
}
