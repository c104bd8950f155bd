// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Sandbox containers bound to one worktree.
//!
//! Containers are driven through the engine CLI (`docker` by default, or any
//! CLI-compatible engine such as `podman`). Each container mounts its worktree
//! at `/workspace` and the exploration's shared volume at `/shared`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

#[cfg(feature = "telemetry")]
use tracing::instrument;

use super::exec::{run_checked, CommandOutput, CommandRequest, CommandRunner};
use super::types::parse_memory_limit;
use crate::error::{ExecError, ExploreError};

/// Mount point of the worktree inside the container.
pub const WORKSPACE_MOUNT: &str = "/workspace";
/// Mount point of the shared volume inside the container.
pub const SHARED_MOUNT: &str = "/shared";

const PULL_TIMEOUT: Duration = Duration::from_secs(600);
const STOP_GRACE_SECONDS: &str = "10";

static CONTAINER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,127}$").unwrap());
static IMAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._/:@-]{0,254}$").unwrap());
static ENV_KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

/// Everything needed to start one sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub worktree_path: PathBuf,
    pub shared_volume_path: PathBuf,
    pub cpu_limit: String,
    pub memory_limit: String,
    pub port: u16,
    pub env: Vec<(String, String)>,
    /// Command to run instead of the image default.
    pub command: Vec<String>,
}

impl ContainerSpec {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        worktree_path: impl Into<PathBuf>,
        shared_volume_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            worktree_path: worktree_path.into(),
            shared_volume_path: shared_volume_path.into(),
            cpu_limit: "2".to_string(),
            memory_limit: "4g".to_string(),
            port: 3000,
            env: Vec::new(),
            command: Vec::new(),
        }
    }

    pub fn with_limits(mut self, cpu_limit: impl Into<String>, memory_limit: impl Into<String>) -> Self {
        self.cpu_limit = cpu_limit.into();
        self.memory_limit = memory_limit.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// Reject names, images, limits and environment entries the engine would
    /// misinterpret.
    pub fn validate(&self) -> Result<(), ExploreError> {
        validate_container_name(&self.name)?;
        if !IMAGE_NAME.is_match(&self.image) {
            return Err(ExploreError::ContainerSpec(format!("invalid image '{}'", self.image)));
        }
        match self.cpu_limit.parse::<f64>() {
            Ok(cpus) if cpus > 0.0 && cpus.is_finite() => {}
            _ => {
                return Err(ExploreError::ContainerSpec(format!(
                    "invalid cpu limit '{}'",
                    self.cpu_limit
                )))
            }
        }
        if parse_memory_limit(&self.memory_limit).is_none() {
            return Err(ExploreError::ContainerSpec(format!(
                "invalid memory limit '{}'",
                self.memory_limit
            )));
        }
        if self.port == 0 {
            return Err(ExploreError::ContainerSpec("port must be non-zero".to_string()));
        }
        for (key, value) in &self.env {
            if !ENV_KEY.is_match(key) {
                return Err(ExploreError::ContainerSpec(format!("invalid environment key '{key}'")));
            }
            if value.chars().any(|c| c == '\0' || c == '\n' || c == '\r') {
                return Err(ExploreError::ContainerSpec(format!(
                    "environment value for '{key}' contains control characters"
                )));
            }
        }
        for path in [&self.worktree_path, &self.shared_volume_path] {
            if !path.is_absolute() || path.to_string_lossy().contains(':') {
                return Err(ExploreError::ContainerSpec(format!(
                    "mount source must be an absolute path without ':': {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    /// Arguments for `<engine> run`.
    pub fn run_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--cpus".to_string(),
            self.cpu_limit.clone(),
            "--memory".to_string(),
            self.memory_limit.clone(),
            "-p".to_string(),
            format!("{0}:{0}", self.port),
            "-v".to_string(),
            format!("{}:{}", self.worktree_path.display(), WORKSPACE_MOUNT),
            "-v".to_string(),
            format!("{}:{}", self.shared_volume_path.display(), SHARED_MOUNT),
            "-w".to_string(),
            WORKSPACE_MOUNT.to_string(),
        ];
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("-e".to_string());
        args.push(format!("EXPLORATION_SHARED={SHARED_MOUNT}"));
        args.push("-e".to_string());
        args.push(format!("PORT={}", self.port));
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

fn validate_container_name(name: &str) -> Result<(), ExploreError> {
    if CONTAINER_NAME.is_match(name) {
        Ok(())
    } else {
        Err(ExploreError::ContainerSpec(format!("invalid container name '{name}'")))
    }
}

/// State reported by the engine for a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Other(String),
}

impl ContainerState {
    fn parse(s: &str) -> Self {
        match s.trim() {
            "created" => Self::Created,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

fn is_missing(err: &ExecError) -> bool {
    err.stderr()
        .map(|s| {
            let s = s.to_ascii_lowercase();
            s.contains("no such") || s.contains("not found")
        })
        .unwrap_or(false)
}

/// Drives container lifecycle through the engine CLI.
pub struct ContainerManager {
    engine: String,
    runner: Arc<dyn CommandRunner>,
}

impl ContainerManager {
    pub fn new(engine: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            engine: engine.into(),
            runner,
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    fn request<I, S>(&self, args: I) -> CommandRequest
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CommandRequest::new(self.engine.clone()).args(args)
    }

    /// Create and start a container, returning its id.
    #[cfg_attr(feature = "telemetry", instrument(skip(self, spec), fields(name = %spec.name, image = %spec.image)))]
    pub async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ExploreError> {
        spec.validate()?;
        info!("Starting container {} from {}", spec.name, spec.image);

        let output = run_checked(self.runner.as_ref(), &self.request(spec.run_args()))
            .await
            .map_err(|e| ExploreError::container(format!("create container '{}'", spec.name), e))?;

        let id = output.stdout_trimmed().lines().last().unwrap_or_default().to_string();
        if id.is_empty() {
            return Err(ExploreError::Container {
                context: format!("create container '{}'", spec.name),
                source: ExecError::Failed {
                    program: self.engine.clone(),
                    code: output.exit_code,
                    stderr: "engine returned no container id".to_string(),
                },
            });
        }
        debug!("Container {} started with id {}", spec.name, id);
        Ok(id)
    }

    pub async fn stop_container(&self, name: &str) -> Result<(), ExploreError> {
        validate_container_name(name)?;
        run_checked(
            self.runner.as_ref(),
            &self.request(["stop", "-t", STOP_GRACE_SECONDS, name]),
        )
        .await
        .map_err(|e| ExploreError::container(format!("stop container '{name}'"), e))?;
        Ok(())
    }

    /// Force-remove a container. A container that no longer exists counts as
    /// removed.
    pub async fn remove_container(&self, name: &str) -> Result<(), ExploreError> {
        validate_container_name(name)?;
        match run_checked(self.runner.as_ref(), &self.request(["rm", "-f", name])).await {
            Ok(_) => Ok(()),
            Err(e) if is_missing(&e) => Ok(()),
            Err(e) => Err(ExploreError::container(format!("remove container '{name}'"), e)),
        }
    }

    /// Pull `image` unless it is already present. Returns true when pulled.
    pub async fn pull_image_if_needed(&self, image: &str) -> Result<bool, ExploreError> {
        if !IMAGE_NAME.is_match(image) {
            return Err(ExploreError::ContainerSpec(format!("invalid image '{image}'")));
        }
        let inspect = self
            .runner
            .run(&self.request(["image", "inspect", image]))
            .await
            .map_err(|e| ExploreError::container(format!("inspect image '{image}'"), e))?;
        if inspect.success() {
            return Ok(false);
        }

        info!("Pulling image {}", image);
        run_checked(
            self.runner.as_ref(),
            &self.request(["pull", image]).timeout(PULL_TIMEOUT),
        )
        .await
        .map_err(|e| ExploreError::container(format!("pull image '{image}'"), e))?;
        Ok(true)
    }

    /// Run a command in a running container. A non-zero exit is returned in the
    /// output, not as an error.
    pub async fn exec(&self, container_id: &str, argv: &[String]) -> Result<CommandOutput, ExploreError> {
        validate_container_name(container_id)?;
        if argv.is_empty() {
            return Err(ExploreError::ContainerSpec("exec needs a command".to_string()));
        }
        let mut args = vec!["exec".to_string(), container_id.to_string()];
        args.extend(argv.iter().cloned());
        self.runner
            .run(&self.request(args))
            .await
            .map_err(|e| ExploreError::container(format!("exec in '{container_id}'"), e))
    }

    /// Current state, or `None` when the container does not exist.
    pub async fn container_status(&self, name: &str) -> Result<Option<ContainerState>, ExploreError> {
        validate_container_name(name)?;
        match run_checked(
            self.runner.as_ref(),
            &self.request(["inspect", "--format", "{{.State.Status}}", name]),
        )
        .await
        {
            Ok(output) => Ok(Some(ContainerState::parse(output.stdout_trimmed()))),
            Err(e) if is_missing(&e) => Ok(None),
            Err(e) => Err(ExploreError::container(format!("inspect container '{name}'"), e)),
        }
    }

    /// Server version of the engine; fails when the daemon is unreachable.
    pub async fn engine_version(&self) -> Result<String, ExploreError> {
        let output = run_checked(
            self.runner.as_ref(),
            &self.request(["version", "--format", "{{.Server.Version}}"]),
        )
        .await
        .map_err(|e| ExploreError::container("query engine version", e))?;
        Ok(output.stdout_trimmed().to_string())
    }
}
