// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Input validation for everything that reaches git, the container engine,
//! or the filesystem.
//!
//! Branch names, paths and git references are rejected outright when they
//! look hostile. Free-form reason text is sanitized instead, because it only
//! ever ends up as worktree lock metadata.

use std::path::{Component, Path, PathBuf};

use crate::error::ValidationError;

/// Maximum accepted branch name length.
pub const MAX_BRANCH_NAME_LENGTH: usize = 250;

/// Maximum length of sanitized reason text.
pub const MAX_REASON_LENGTH: usize = 500;

/// Maximum accepted git reference length.
const MAX_GIT_REF_LENGTH: usize = 250;

/// Characters with meaning to a POSIX shell.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '<', '>'];

/// Characters stripped from reason text.
const REASON_DENYLIST: &[char] = &[
    ';', '"', '\'', '/', '\\', '`', '$', '&', '|', '<', '>', '(', ')', '{', '}',
];

fn find_metacharacter(input: &str) -> Option<char> {
    input.chars().find(|c| SHELL_METACHARACTERS.contains(c))
}

/// Validate a branch name before it is handed to git.
///
/// Rejects shell metacharacters, `..`, a leading `.` or `-`, a trailing
/// `.lock`, control characters and names longer than
/// [`MAX_BRANCH_NAME_LENGTH`]. Slash-separated names such as `feature/x`
/// are accepted.
pub fn validate_branch_name(name: &str) -> Result<String, ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::branch(name, "branch name is empty"));
    }
    if name.chars().count() > MAX_BRANCH_NAME_LENGTH {
        return Err(ValidationError::branch(
            name,
            format!("longer than {MAX_BRANCH_NAME_LENGTH} characters"),
        ));
    }
    if let Some(c) = find_metacharacter(name) {
        return Err(ValidationError::branch(
            name,
            format!("contains shell metacharacter '{c}'"),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(ValidationError::branch(name, "contains control characters"));
    }
    if name.contains("..") {
        return Err(ValidationError::branch(name, "contains path traversal '..'"));
    }
    if name.starts_with('.') {
        return Err(ValidationError::branch(name, "starts with '.'"));
    }
    if name.starts_with('-') {
        return Err(ValidationError::branch(name, "starts with '-'"));
    }
    if name.ends_with(".lock") {
        return Err(ValidationError::branch(name, "ends with '.lock'"));
    }
    Ok(name.to_string())
}

/// Validate a path and resolve it against `allowed_root`.
///
/// Relative paths are joined to the root. The result is normalized lexically
/// and must be the root itself or one of its descendants. Metacharacters are
/// only rejected below the root, so a repository may live under any path.
pub fn validate_path(path: &Path, allowed_root: &Path) -> Result<PathBuf, ValidationError> {
    let display = path.display().to_string();
    let raw = path.to_string_lossy();

    if raw.is_empty() {
        return Err(ValidationError::path(&display, "path is empty"));
    }
    if raw.contains('\0') {
        return Err(ValidationError::path(&display, "contains a null byte"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ValidationError::path(&display, "contains path traversal '..'"));
    }

    let root = normalize(allowed_root);
    let candidate = if path.is_absolute() {
        normalize(path)
    } else {
        normalize(&root.join(path))
    };

    let below_root = match candidate.strip_prefix(&root) {
        Ok(rest) => rest.to_string_lossy(),
        Err(_) => {
            return Err(ValidationError::path(
                &display,
                format!("resolves outside of {}", root.display()),
            ))
        }
    };
    if let Some(c) = find_metacharacter(&below_root) {
        return Err(ValidationError::path(
            &display,
            format!("contains shell metacharacter '{c}'"),
        ));
    }
    if below_root.chars().any(char::is_control) {
        return Err(ValidationError::path(&display, "contains control characters"));
    }
    Ok(candidate)
}

/// Validate a git reference (branch, tag, symbolic ref or object id).
pub fn validate_git_ref(reference: &str) -> Result<String, ValidationError> {
    if reference.is_empty() {
        return Err(ValidationError::git_ref(reference, "reference is empty"));
    }
    if reference.len() > MAX_GIT_REF_LENGTH {
        return Err(ValidationError::git_ref(
            reference,
            format!("longer than {MAX_GIT_REF_LENGTH} characters"),
        ));
    }
    if let Some(c) = find_metacharacter(reference) {
        return Err(ValidationError::git_ref(
            reference,
            format!("contains shell metacharacter '{c}'"),
        ));
    }
    if reference
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::git_ref(
            reference,
            "contains whitespace or control characters",
        ));
    }
    if reference.contains("..") {
        return Err(ValidationError::git_ref(reference, "contains '..'"));
    }
    if reference.starts_with('-') {
        return Err(ValidationError::git_ref(reference, "starts with '-'"));
    }
    Ok(reference.to_string())
}

/// Sanitize free-form text used as lock metadata.
///
/// Never fails: denylisted characters are removed, control characters become
/// spaces and the result is truncated to [`MAX_REASON_LENGTH`] characters.
pub fn validate_reason_text(text: &str) -> String {
    let cleaned: String = text
        .chars()
        .filter(|c| !REASON_DENYLIST.contains(c))
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect();

    cleaned.trim().chars().take(MAX_REASON_LENGTH).collect()
}

/// Validate an exploration id before it is used as a directory name.
pub fn validate_exploration_id(id: &str) -> Result<String, ValidationError> {
    let invalid = |reason: &str| ValidationError::ExplorationId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("id is empty"));
    }
    if id.len() > 128 {
        return Err(invalid("id is too long"));
    }
    if id.starts_with('.') || id.starts_with('-') {
        return Err(invalid("id must start with an alphanumeric character"));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid("only ASCII letters, digits, '-' and '_' are allowed"));
    }
    Ok(id.to_string())
}

/// Lexically normalize a path, dropping `.` components.
///
/// `..` components are resolved against what came before them; callers that
/// must refuse traversal check for them first.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOSTILE: &[&str] = &[
        "feat;rm -rf",
        "feat&&echo",
        "feat|cat",
        "feat`id`",
        "feat$(id)",
        "../escape",
        "a/../../b",
    ];

    #[test]
    fn test_branch_name_accepts_common_names() {
        assert_eq!(validate_branch_name("feature/x").unwrap(), "feature/x");
        assert_eq!(
            validate_branch_name("bugfix/issue-123").unwrap(),
            "bugfix/issue-123"
        );
        assert!(validate_branch_name("main").is_ok());
        assert!(validate_branch_name("delve/exp-1/wt-1").is_ok());
    }

    #[test]
    fn test_branch_name_rejects_hostile_input() {
        for name in HOSTILE {
            assert!(validate_branch_name(name).is_err(), "accepted {name:?}");
        }
    }

    #[test]
    fn test_branch_name_rejects_git_specific_forms() {
        assert!(validate_branch_name("").is_err());
        assert!(validate_branch_name(".hidden").is_err());
        assert!(validate_branch_name("-D").is_err());
        assert!(validate_branch_name("feature.lock").is_err());
        assert!(validate_branch_name("line\nbreak").is_err());
        assert!(validate_branch_name(&"a".repeat(251)).is_err());
        assert!(validate_branch_name(&"a".repeat(250)).is_ok());
    }

    #[test]
    fn test_path_accepts_descendants() {
        let root = Path::new("/repo/.delve/worktrees");
        let resolved = validate_path(Path::new("exp-1/wt-1"), root).unwrap();
        assert_eq!(resolved, PathBuf::from("/repo/.delve/worktrees/exp-1/wt-1"));

        let absolute = validate_path(Path::new("/repo/.delve/worktrees/./exp-1"), root).unwrap();
        assert_eq!(absolute, PathBuf::from("/repo/.delve/worktrees/exp-1"));
    }

    #[test]
    fn test_path_rejects_hostile_input() {
        let root = Path::new("/repo/.delve/worktrees");
        for input in HOSTILE {
            assert!(
                validate_path(Path::new(input), root).is_err(),
                "accepted {input:?}"
            );
        }
        assert!(validate_path(Path::new("wt\0evil"), root).is_err());
        assert!(validate_path(Path::new(""), root).is_err());
    }

    #[test]
    fn test_path_allows_metacharacters_in_root() {
        let root = Path::new("/home/dev/My Projects (old)/app/.delve/worktrees");
        let resolved = validate_path(Path::new("exp-1/wt-1"), root).unwrap();
        assert_eq!(resolved, root.join("exp-1/wt-1"));
        assert!(validate_path(&root.join("exp-1"), root).is_ok());

        assert!(validate_path(Path::new("exp-1/wt (2)"), root).is_err());
        assert!(validate_path(&root.join("exp;1"), root).is_err());
    }

    #[test]
    fn test_path_rejects_absolute_outside_root() {
        let root = Path::new("/repo/.delve/worktrees");
        assert!(validate_path(Path::new("/etc/passwd"), root).is_err());
        assert!(validate_path(Path::new("/repo/.delve/worktrees-evil"), root).is_err());
        if let Some(home) = dirs::home_dir() {
            assert!(validate_path(&home, root).is_err());
        }
    }

    #[test]
    fn test_git_ref_accepts_refs_and_ids() {
        for reference in [
            "HEAD",
            "main",
            "refs/heads/feature/x",
            "refs/tags/v1.0.0",
            "origin/main",
            "HEAD~1",
            "3f2a9c1d8e7b6a5f4e3d2c1b0a9f8e7d6c5b4a39",
        ] {
            assert!(validate_git_ref(reference).is_ok(), "rejected {reference:?}");
        }
    }

    #[test]
    fn test_git_ref_rejects_hostile_input() {
        for reference in HOSTILE {
            assert!(validate_git_ref(reference).is_err(), "accepted {reference:?}");
        }
        assert!(validate_git_ref("main..evil").is_err());
        assert!(validate_git_ref("--upload-pack=x").is_err());
        assert!(validate_git_ref("two words").is_err());
    }

    #[test]
    fn test_reason_text_is_sanitized() {
        let reason = validate_reason_text(r#"busy; rm -rf / "now" `id` $(whoami)"#);
        assert!(!reason.contains(';'));
        assert!(!reason.contains('"'));
        assert!(!reason.contains('/'));
        assert!(!reason.contains('`'));
        assert!(!reason.contains('$'));
        assert!(reason.starts_with("busy"));
    }

    #[test]
    fn test_reason_text_is_truncated() {
        let reason = validate_reason_text(&"x".repeat(5_000));
        assert_eq!(reason.chars().count(), MAX_REASON_LENGTH);

        let mixed = validate_reason_text(&";/\"a".repeat(1_000));
        assert!(mixed.chars().count() <= MAX_REASON_LENGTH);
        assert!(mixed.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_reason_text_flattens_newlines() {
        assert_eq!(validate_reason_text("agent\nrunning"), "agent running");
    }

    #[test]
    fn test_exploration_id() {
        assert!(validate_exploration_id("exp-20260101120000000-1a2b3c4d").is_ok());
        assert!(validate_exploration_id("../etc").is_err());
        assert!(validate_exploration_id("exp/1").is_err());
        assert!(validate_exploration_id("").is_err());
    }
}
