// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Composition root: one instance of every component, wired together.
//!
//! [`Explorer::start`] runs the full provisioning sequence:
//!
//! 1. Safety gate (errors abort, warnings are logged)
//! 2. Persist a pending exploration
//! 3. Create one worktree per branch, all or nothing
//! 4. Initialize the shared volume
//! 5. Allocate a port and limits per worktree
//! 6. Pull the image and start one container per worktree
//! 7. Mark the exploration running
//!
//! A failure after step 3 tears down everything created so far and marks the
//! exploration failed.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{info, warn};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::container::{ContainerManager, ContainerSpec};
use super::exec::{CommandRunner, SafeExecutor};
use super::lock::FileLockManager;
use super::resources::{AllocationRequest, ResourceAllocation, ResourceAllocator};
use super::safety::{SafetyReport, SafetyThresholds, SafetyValidator};
use super::shared_volume::{Decision, Insight, SharedVolumeManager, LOCKS_DIR};
use super::state::ExplorationStateManager;
use super::types::{
    ExecutionMode, Exploration, ExplorationConfig, ExplorationResults, ExplorationStatus,
    ExplorationSummary, StatusExtras, WorktreeExploration, WorktreePatch, WorktreeStatus,
};
use super::worktree::{WorktreeManager, WorktreeOptions};
use crate::config::EngineConfig;
use crate::error::ExploreError;
use crate::telemetry::Metrics;

/// Command used when an exploration configures none, keeping the sandbox up
/// for `exec`.
const IDLE_COMMAND: [&str; 2] = ["sleep", "infinity"];

/// Branch name of one exploration worktree.
pub fn branch_name(exploration_id: &str, index: u32) -> String {
    format!("delve/{exploration_id}/wt-{index}")
}

/// Container name of one exploration worktree.
pub fn container_name(exploration_id: &str, index: u32) -> String {
    format!("delve-{exploration_id}-wt-{index}")
}

/// What [`Explorer::cleanup`] managed to remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub containers_removed: usize,
    pub worktrees_removed: usize,
    pub branches_deleted: usize,
    pub released_ports: Vec<u16>,
    /// Problems that did not stop the cleanup.
    pub errors: Vec<String>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Drives explorations from start to cleanup.
pub struct Explorer {
    config: EngineConfig,
    metrics: Arc<Metrics>,
    allocator: ResourceAllocator,
    worktrees: WorktreeManager,
    containers: Arc<ContainerManager>,
    safety: SafetyValidator,
    states: ExplorationStateManager,
}

impl Explorer {
    /// Wire an explorer that runs real processes.
    pub fn new(config: EngineConfig) -> Self {
        let metrics = Arc::new(Metrics::new());
        let executor = SafeExecutor::new()
            .with_timeout(config.command_timeout)
            .with_max_output_bytes(config.max_output_bytes)
            .with_metrics(Arc::clone(&metrics));
        Self::with_runner(config, Arc::new(executor), metrics)
    }

    /// Wire an explorer around a given command runner.
    pub fn with_runner(config: EngineConfig, runner: Arc<dyn CommandRunner>, metrics: Arc<Metrics>) -> Self {
        let allocator = ResourceAllocator::new(
            config.exploration.port_range_start,
            config.exploration.port_range_end,
        );
        let worktrees = WorktreeManager::new(
            config.repo_root.clone(),
            config.worktree_root.clone(),
            Arc::clone(&runner),
        );
        let containers = Arc::new(ContainerManager::new(
            config.container_engine.clone(),
            Arc::clone(&runner),
        ));
        let safety = SafetyValidator::new(
            config.repo_root.clone(),
            config.container_engine.clone(),
            Arc::clone(&runner),
        )
        .with_thresholds(SafetyThresholds {
            min_memory_per_worktree: config.min_memory_per_worktree,
            min_cores_per_worktree: config.min_cores_per_worktree,
        });
        let states = ExplorationStateManager::new(config.explorations_root.clone());

        Self {
            config,
            metrics,
            allocator,
            worktrees,
            containers,
            safety,
            states,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn states(&self) -> &ExplorationStateManager {
        &self.states
    }

    pub fn worktrees(&self) -> &WorktreeManager {
        &self.worktrees
    }

    pub fn containers(&self) -> &ContainerManager {
        &self.containers
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    /// Pre-flight report for `branches` worktrees.
    pub async fn validate(&self, branches: u32) -> SafetyReport {
        self.safety.validate(branches).await
    }

    pub async fn list(&self) -> Result<Vec<ExplorationSummary>, ExploreError> {
        self.states.list_explorations().await
    }

    pub async fn load(&self, id: &str) -> Result<Exploration, ExploreError> {
        self.states.load_exploration(id).await
    }

    pub async fn insights(&self, id: &str) -> Result<Vec<Insight>, ExploreError> {
        self.states.read_insights(id).await
    }

    pub async fn decisions(&self, id: &str) -> Result<Vec<Decision>, ExploreError> {
        self.states.read_decisions(id).await
    }

    /// Reserve the ports of explorations started by other processes.
    ///
    /// Allocations live in memory, so each new process re-reads the ports
    /// recorded for pending and running explorations before handing out
    /// new ones. Returns the number of ports reserved.
    pub async fn restore_allocations(&self) -> Result<usize, ExploreError> {
        let mut reserved = 0;
        for summary in self.states.list_explorations().await? {
            if summary.status.is_terminal() {
                continue;
            }
            let exploration = match self.states.load_exploration(&summary.id).await {
                Ok(exploration) => exploration,
                Err(e) => {
                    warn!("Skipping ports of {}: {}", summary.id, e);
                    continue;
                }
            };
            for worktree in &exploration.worktrees {
                let Some(port) = worktree.port else { continue };
                let allocation = ResourceAllocation {
                    exploration_id: exploration.id.clone(),
                    worktree_index: worktree.index,
                    port,
                    cpu_limit: exploration.config.cpu_limit.clone(),
                    memory_limit: exploration.config.memory_limit.clone(),
                };
                if self.allocator.reserve(allocation) {
                    reserved += 1;
                }
            }
        }
        Ok(reserved)
    }

    fn shared_volume(&self, id: &str) -> Result<SharedVolumeManager, ExploreError> {
        let root = self.states.shared_volume_path(id)?;
        let locks = FileLockManager::new(root.join(LOCKS_DIR))
            .with_timeout(self.config.lock_timeout)
            .with_metrics(Arc::clone(&self.metrics));
        Ok(SharedVolumeManager::new(id, root).with_lock_manager(Arc::new(locks)))
    }

    /// Provision and start a new exploration.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, config), fields(branches = config.branches)))]
    pub async fn start(&self, task: &str, config: ExplorationConfig) -> Result<Exploration, ExploreError> {
        let report = self.safety.validate(config.branches).await;
        for warning in &report.warnings {
            warn!("Safety warning: {}", warning);
        }
        if !report.passed {
            return Err(ExploreError::SafetyCheck(report.errors.join("; ")));
        }

        // Room for every planned worktree, not just one more.
        let headroom = self
            .config
            .max_worktrees
            .saturating_sub(config.branches as usize)
            .saturating_add(1);
        self.worktrees.check_worktree_limit(headroom).await?;
        self.restore_allocations().await?;

        let exploration = self.states.create_exploration(task, config).await?;
        let id = exploration.id.clone();
        info!(id = %id, task, "Starting exploration");

        let options: Vec<WorktreeOptions> = (1..=exploration.config.branches)
            .map(|index| {
                WorktreeOptions::new(
                    branch_name(&id, index),
                    self.config.worktree_root.join(&id).join(format!("wt-{index}")),
                )
            })
            .collect();

        let created = match self.worktrees.create_multiple_worktrees(&options).await {
            Ok(created) => created,
            Err(err) => {
                self.mark_failed(&id, &err).await;
                return Err(err);
            }
        };

        // Teardown works from this in-memory copy, which knows every created
        // worktree even when persisting them fails.
        let records: Vec<WorktreeExploration> = (1u32..)
            .zip(&created)
            .map(|(index, worktree)| {
                WorktreeExploration::new(index, worktree.branch.clone(), worktree.path.clone())
                    .with_strategy(exploration.config.strategy_for(index).map(str::to_string))
            })
            .collect();
        let provisioned = records
            .iter()
            .fold(exploration.clone(), |acc, record| acc.with_worktree(record.clone()));

        for record in records {
            if let Err(err) = self.states.add_worktree(&id, record).await {
                return Err(self.abort(&provisioned, err).await);
            }
        }

        match self.provision(&id, task, &exploration.config).await {
            Ok(()) => {
                let running = self
                    .states
                    .update_status(&id, ExplorationStatus::Running, StatusExtras::default())
                    .await;
                match running {
                    Ok(running) => {
                        info!(id = %id, "Exploration running");
                        Ok(running)
                    }
                    Err(err) => Err(self.abort(&provisioned, err).await),
                }
            }
            Err(err) => Err(self.abort(&provisioned, err).await),
        }
    }

    /// Shared volume, allocations, image and containers.
    async fn provision(&self, id: &str, task: &str, config: &ExplorationConfig) -> Result<(), ExploreError> {
        let layout = self.shared_volume(id)?.initialize(config.branches).await?;

        let mut allocations = Vec::with_capacity(config.branches as usize);
        for index in 1..=config.branches {
            let request = AllocationRequest::new(id, index)
                .with_limits(config.cpu_limit.clone(), config.memory_limit.clone())
                .with_port_range(config.port_range_start, config.port_range_end);
            allocations.push(self.allocator.allocate(request)?);
        }

        self.containers.pull_image_if_needed(&config.docker_image).await?;

        let command: Vec<String> = if config.command.is_empty() {
            IDLE_COMMAND.iter().map(|s| s.to_string()).collect()
        } else {
            config.command.clone()
        };

        let specs: Vec<(ResourceAllocation, ContainerSpec)> = allocations
            .into_iter()
            .map(|allocation| {
                let index = allocation.worktree_index;
                let mut spec = ContainerSpec::new(
                    container_name(id, index),
                    config.docker_image.clone(),
                    self.config.worktree_root.join(id).join(format!("wt-{index}")),
                    layout.root_path.clone(),
                )
                .with_limits(allocation.cpu_limit.clone(), allocation.memory_limit.clone())
                .with_port(allocation.port)
                .with_env("EXPLORATION_ID", id)
                .with_env("EXPLORATION_TASK", task)
                .with_env("WORKTREE_INDEX", index.to_string())
                .with_env("EXPLORATION_TIMEOUT_MINUTES", config.timeout_minutes.to_string())
                .with_env("EXPLORATION_AUTO_MERGE", config.auto_merge.to_string())
                .with_command(command.clone());
                if let Some(strategy) = config.strategy_for(index) {
                    spec = spec.with_env("EXPLORATION_STRATEGY", strategy);
                }
                (allocation, spec)
            })
            .collect();

        match config.mode {
            ExecutionMode::Sequential => {
                for (allocation, spec) in specs {
                    let container_id = self.containers.create_container(&spec).await?;
                    self.record_container(id, &allocation, container_id).await?;
                }
            }
            ExecutionMode::Parallel => {
                let mut tasks = JoinSet::new();
                for (allocation, spec) in specs {
                    let containers = Arc::clone(&self.containers);
                    tasks.spawn(async move {
                        let result = containers.create_container(&spec).await;
                        (allocation, result)
                    });
                }

                // Record every container that did start so teardown finds it.
                let mut first_error = None;
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok((allocation, Ok(container_id))) => {
                            if let Err(err) = self.record_container(id, &allocation, container_id).await {
                                first_error.get_or_insert(err);
                            }
                        }
                        Ok((allocation, Err(err))) => {
                            warn!("Container for worktree {} failed: {}", allocation.worktree_index, err);
                            first_error.get_or_insert(err);
                        }
                        Err(join_err) => {
                            first_error.get_or_insert(ExploreError::Io(std::io::Error::other(
                                join_err.to_string(),
                            )));
                        }
                    }
                }
                if let Some(err) = first_error {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn record_container(
        &self,
        id: &str,
        allocation: &ResourceAllocation,
        container_id: String,
    ) -> Result<(), ExploreError> {
        let patch = WorktreePatch::status(WorktreeStatus::Running).with_container(container_id, allocation.port);
        self.states
            .update_worktree(id, allocation.worktree_index, patch)
            .await?;
        Ok(())
    }

    /// Tear down after a failed start and record the failure.
    ///
    /// `provisioned` is the in-memory record holding every worktree the
    /// start created; containers are removed by name, recorded or not.
    async fn abort(&self, provisioned: &Exploration, err: ExploreError) -> ExploreError {
        let id = provisioned.id.as_str();
        warn!(id, "Exploration start failed, tearing down: {}", err);
        let report = self.teardown(provisioned).await;
        for problem in &report.errors {
            warn!(id, "Teardown problem: {}", problem);
        }
        self.mark_failed(id, &err).await;
        err
    }

    async fn mark_failed(&self, id: &str, err: &ExploreError) {
        let extras = StatusExtras {
            error: Some(err.to_string()),
            ..Default::default()
        };
        if let Err(e) = self.states.update_status(id, ExplorationStatus::Failed, extras).await {
            warn!(id, "Could not record failure: {}", e);
        }
    }

    /// Stop every container and release resources. Worktrees are kept.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn stop(&self, id: &str) -> Result<Exploration, ExploreError> {
        let exploration = self.states.load_exploration(id).await?;
        for worktree in &exploration.worktrees {
            let name = container_name(id, worktree.index);
            if worktree.container_id.is_some() {
                if let Err(e) = self.containers.stop_container(&name).await {
                    warn!("Failed to stop {}: {}", name, e);
                }
            }
            // A container can exist without a recorded id when its start failed.
            if let Err(e) = self.containers.remove_container(&name).await {
                warn!("Failed to remove {}: {}", name, e);
            }
        }
        self.allocator.release_all(id);
        self.states
            .update_status(id, ExplorationStatus::Stopped, StatusExtras::default())
            .await
    }

    /// Record the outcome, collect pool counts and tear down unless the
    /// exploration asked to keep its resources.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn finish(&self, id: &str, success: bool) -> Result<Exploration, ExploreError> {
        let exploration = self.states.load_exploration(id).await?;
        let final_status = if success {
            WorktreeStatus::Completed
        } else {
            WorktreeStatus::Failed
        };
        for worktree in &exploration.worktrees {
            if matches!(worktree.status, WorktreeStatus::Created | WorktreeStatus::Running) {
                self.states
                    .update_worktree(id, worktree.index, WorktreePatch::status(final_status))
                    .await?;
            }
        }

        let volume = self.shared_volume(id)?;
        let insights = volume.read_insights().await?;
        let decisions = volume.read_decisions().await?;
        let exploration = self.states.load_exploration(id).await?;
        let successful = exploration
            .worktrees
            .iter()
            .filter(|w| w.status == WorktreeStatus::Completed)
            .count();
        let results = ExplorationResults {
            insights_collected: insights.len(),
            decisions_collected: decisions.len(),
            successful_worktrees: successful,
            failed_worktrees: exploration.worktrees.len() - successful,
            summary: insights.last().map(|i| i.content.clone()),
        };

        let status = if success {
            ExplorationStatus::Completed
        } else {
            ExplorationStatus::Failed
        };
        let finished = self
            .states
            .update_status(
                id,
                status,
                StatusExtras {
                    results: Some(results),
                    ..Default::default()
                },
            )
            .await?;
        info!(id, %status, "Exploration finished");

        if !finished.config.no_cleanup {
            let report = self.teardown(&finished).await;
            for problem in &report.errors {
                warn!(id, "Cleanup problem: {}", problem);
            }
        }
        Ok(finished)
    }

    /// Remove containers, worktrees and branches of an exploration.
    #[cfg_attr(feature = "telemetry", instrument(skip(self)))]
    pub async fn cleanup(&self, id: &str) -> Result<CleanupReport, ExploreError> {
        let exploration = self.states.load_exploration(id).await?;
        let report = self.teardown(&exploration).await;
        if exploration.status == ExplorationStatus::Running {
            self.states
                .update_status(id, ExplorationStatus::Stopped, StatusExtras::default())
                .await?;
        }
        Ok(report)
    }

    /// Clean up and remove the exploration's record.
    pub async fn delete(&self, id: &str) -> Result<CleanupReport, ExploreError> {
        let report = self.cleanup(id).await?;
        self.states.delete_exploration(id).await?;
        Ok(report)
    }

    async fn teardown(&self, exploration: &Exploration) -> CleanupReport {
        let id = &exploration.id;
        let mut report = CleanupReport::default();

        // Removal of a missing container succeeds, so every name is tried.
        for worktree in &exploration.worktrees {
            let name = container_name(id, worktree.index);
            match self.containers.remove_container(&name).await {
                Ok(()) => {
                    if worktree.container_id.is_some() {
                        report.containers_removed += 1;
                    }
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        report.released_ports = self
            .allocator
            .release_all(id)
            .into_iter()
            .map(|a| a.port)
            .collect();

        for worktree in exploration.worktrees.iter().rev() {
            if worktree.path.exists() {
                match self.worktrees.remove_worktree(&worktree.path, true).await {
                    Ok(()) => report.worktrees_removed += 1,
                    Err(e) => report.errors.push(e.to_string()),
                }
            }
            // Only branches this engine named for the exploration.
            if worktree.branch != branch_name(id, worktree.index) {
                continue;
            }
            match self.worktrees.is_branch_name_available(&worktree.branch).await {
                Ok(false) => match self.worktrees.delete_branch(&worktree.branch, true).await {
                    Ok(()) => report.branches_deleted += 1,
                    Err(e) => report.errors.push(e.to_string()),
                },
                Ok(true) => {}
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let exploration_dir = self.config.worktree_root.join(id);
        if let Ok(mut entries) = tokio::fs::read_dir(&exploration_dir).await {
            if matches!(entries.next_entry().await, Ok(None)) {
                let _ = tokio::fs::remove_dir(&exploration_dir).await;
            }
        }

        info!(
            id = %id,
            containers = report.containers_removed,
            worktrees = report.worktrees_removed,
            branches = report.branches_deleted,
            "Teardown complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names() {
        assert_eq!(branch_name("exp-1-ab", 2), "delve/exp-1-ab/wt-2");
        assert_eq!(container_name("exp-1-ab", 2), "delve-exp-1-ab-wt-2");
        assert!(crate::explore::validation::validate_branch_name(&branch_name("exp-1", 1)).is_ok());
    }

    #[test]
    fn test_cleanup_report() {
        let mut report = CleanupReport::default();
        assert!(report.is_clean());
        report.errors.push("x".to_string());
        assert!(!report.is_clean());
    }
}
