//! Path validation for catalog entries and patch targets.
//!
//! Task ids become directory names and patch targets become file paths
//! inside a sandbox, so both are checked before they touch the filesystem.

use std::path::{Component, Path, PathBuf};

use anyhow::Result;

/// Validate a task id.
///
/// Uses an **allowlist**: alphanumeric characters plus `-`, `_` and `.`.
/// Rejects separators, `..` and empty ids.
pub fn validate_task_id(id: &str) -> Result<()> {
    if id.is_empty() {
        anyhow::bail!("task id must not be empty");
    }
    if id == "." || id.contains("..") {
        anyhow::bail!("task id must not contain '..': '{}'", id);
    }
    for ch in id.chars() {
        if !ch.is_alphanumeric() && ch != '-' && ch != '_' && ch != '.' {
            anyhow::bail!("task id contains invalid character '{}': '{}'", ch, id);
        }
    }
    Ok(())
}

/// Validate a path that must stay below some root directory.
///
/// Rejects absolute paths, parent-directory components and NUL bytes.
pub fn validate_relative_path(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        anyhow::bail!("path must not be empty");
    }
    if path.contains('\0') {
        anyhow::bail!("path contains a NUL byte: '{}'", path.escape_debug());
    }
    for component in Path::new(path).components() {
        match component {
            Component::ParentDir => {
                anyhow::bail!("path must not contain '..': '{}'", path);
            }
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("path must be relative, got '{}'", path);
            }
            Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

/// Join `rel` onto `root` after validating it.
pub fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf> {
    validate_relative_path(rel)?;
    Ok(root.join(rel))
}
