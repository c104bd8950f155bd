// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the exploration engine.
//!
//! This module provides strongly-typed errors for the different layers of the
//! engine, using `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation at the binary boundary.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by input validation.
///
/// Validation errors are deterministic: retrying with the same input always
/// fails the same way, and a call that fails validation has no side effects.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid branch name '{name}': {reason}")]
    BranchName { name: String, reason: String },

    #[error("Invalid path '{path}': {reason}")]
    Path { path: String, reason: String },

    #[error("Invalid git reference '{reference}': {reason}")]
    GitRef { reference: String, reason: String },

    #[error("Invalid exploration id '{id}': {reason}")]
    ExplorationId { id: String, reason: String },
}

impl ValidationError {
    pub(crate) fn branch(name: &str, reason: impl Into<String>) -> Self {
        Self::BranchName {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn path(path: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::Path {
            path: path.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn git_ref(reference: &str, reason: impl Into<String>) -> Self {
        Self::GitRef {
            reference: reference.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors that can occur while running an external process.
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' timed out after {timeout_ms}ms")]
    Timeout { program: String, timeout_ms: u64 },

    #[error("'{program}' exceeded the output limit of {limit} bytes")]
    OutputOverflow { program: String, limit: usize },

    #[error("'{program}' exited with {}: {stderr}", .code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("IO error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// Check if the process was killed because it ran past its timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if a caller could reasonably retry the command with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Captured stderr of a failed command, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Failed { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Errors that can occur during configuration loading.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("IO error reading config: {0}")]
    IoError(String),

    #[error("YAML parsing error: {0}")]
    YamlError(String),

    #[error("JSON parsing error: {0}")]
    JsonError(String),
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            _ => Self::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        Self::JsonError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::YamlError(err.to_string())
    }
}

/// Errors raised by the exploration engine.
#[derive(Error, Debug)]
pub enum ExploreError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("Git operation failed ({context}): {source}")]
    GitOperation {
        context: String,
        #[source]
        source: ExecError,
    },

    #[error("Container operation failed ({context}): {source}")]
    Container {
        context: String,
        #[source]
        source: ExecError,
    },

    #[error("Invalid container request: {0}")]
    ContainerSpec(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Timed out after {timeout_ms}ms waiting for lock on {} (owner: {owner})", .path.display())]
    LockTimeout {
        path: PathBuf,
        owner: String,
        timeout_ms: u64,
    },

    #[error("{} was modified outside of its lock", .0.display())]
    ConcurrentModification(PathBuf),

    #[error("Batch failed at '{failed_branch}', rolled back {rolled_back} worktree(s): {source}")]
    PartialFailure {
        failed_branch: String,
        rolled_back: usize,
        #[source]
        source: Box<ExploreError>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Safety check failed: {0}")]
    SafetyCheck(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl ExploreError {
    pub(crate) fn git(context: impl Into<String>, source: ExecError) -> Self {
        Self::GitOperation {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn container(context: impl Into<String>, source: ExecError) -> Self {
        Self::Container {
            context: context.into(),
            source,
        }
    }

    /// Check if this error comes from a transient cause.
    ///
    /// Validation and resource errors are never retryable. Git failures are
    /// retryable only when the command timed out; container failures also
    /// when the engine daemon could not be reached.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::GitOperation { source, .. } => source.is_retryable(),
            Self::Container { source, .. } => source.is_retryable() || engine_unreachable(source),
            Self::LockTimeout { .. } => true,
            Self::PartialFailure { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// The error that started a failed batch, looking through `PartialFailure`.
    pub fn root_cause(&self) -> &ExploreError {
        match self {
            Self::PartialFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

fn engine_unreachable(err: &ExecError) -> bool {
    err.stderr().is_some_and(|stderr| {
        let stderr = stderr.to_ascii_lowercase();
        stderr.contains("cannot connect to the docker daemon")
            || stderr.contains("is the docker daemon running")
            || stderr.contains("cannot connect to podman")
    })
}

/// Result type alias using anyhow for flexible error handling.
pub type Result<T> = anyhow::Result<T>;
