//! Per-attempt private workspace.
//!
//! Every attempt gets its own temporary copy of the task workspace, with
//! the task's tests copied under `workspace/tests` and its
//! `requirements.txt`, if any, at the workspace root. The directory is
//! removed on [`Sandbox::release`] or, failing that, when the handle drops.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::catalog::TaskDefinition;

/// Dependency list a task may ship next to its workspace.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Error types for sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Workspace missing for task {task_id}: {path}")]
    MissingWorkspace { task_id: String, path: String },

    #[error("Copy task panicked: {0}")]
    Join(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A private working copy owned by exactly one attempt.
#[derive(Debug)]
pub struct Sandbox {
    task_id: String,
    dir: Option<TempDir>,
    root: PathBuf,
}

impl Sandbox {
    /// Copy the task's workspace and tests into a fresh temporary directory.
    ///
    /// The copy runs on the blocking pool.
    pub async fn acquire(task: &TaskDefinition) -> Result<Self, SandboxError> {
        if !task.workspace_path.is_dir() {
            return Err(SandboxError::MissingWorkspace {
                task_id: task.id.clone(),
                path: task.workspace_path.display().to_string(),
            });
        }

        let task_id = task.id.clone();
        let workspace = task.workspace_path.clone();
        let tests = task.tests_path.clone();
        let requirements = task.task_dir.join(REQUIREMENTS_FILE);

        let dir = tokio::task::spawn_blocking(move || -> Result<TempDir, SandboxError> {
            let dir = tempfile::Builder::new()
                .prefix(&format!("{}_", task_id))
                .tempdir()?;
            let root = dir.path().join("workspace");
            copy_dir_recursive(&workspace, &root)?;
            if let Some(tests) = tests {
                copy_dir_recursive(&tests, &root.join("tests"))?;
            }
            if requirements.is_file() {
                fs::copy(&requirements, root.join(REQUIREMENTS_FILE))?;
            }
            Ok(dir)
        })
        .await
        .map_err(|e| SandboxError::Join(e.to_string()))??;

        let root = dir.path().join("workspace");
        debug!(task_id = %task.id, root = %root.display(), "Sandbox ready");
        Ok(Self {
            task_id: task.id.clone(),
            dir: Some(dir),
            root,
        })
    }

    /// Directory the model's patch and the eval command operate in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Remove the sandbox now, reporting cleanup failures.
    pub async fn release(mut self) -> Result<(), SandboxError> {
        let Some(dir) = self.dir.take() else {
            return Ok(());
        };
        tokio::task::spawn_blocking(move || dir.close())
            .await
            .map_err(|e| SandboxError::Join(e.to_string()))??;
        debug!(task_id = %self.task_id, "Sandbox released");
        Ok(())
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!(task_id = %self.task_id, path = %path.display(), error = %e, "Failed to remove sandbox");
            }
        }
    }
}

/// Recursively copies a directory, skipping symlinks that leave it.
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<(), SandboxError> {
    fs::create_dir_all(dst)?;
    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| SandboxError::Setup(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| SandboxError::Setup(e.to_string()))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            match fs::canonicalize(entry.path()) {
                Ok(resolved) if resolved.starts_with(fs::canonicalize(src)?) && resolved.is_file() => {
                    fs::copy(&resolved, &target)?;
                }
                _ => debug!(path = %entry.path().display(), "Skipping symlink"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{TaskMetadata, METADATA_FILE};

    fn make_task(root: &Path, with_tests: bool) -> TaskDefinition {
        let dir = root.join("t1");
        fs::create_dir_all(dir.join("workspace/pkg")).unwrap();
        fs::write(dir.join("workspace/main.py"), "x = 1\n").unwrap();
        fs::write(dir.join("workspace/pkg/mod.py"), "y = 2\n").unwrap();
        if with_tests {
            fs::create_dir_all(dir.join("tests")).unwrap();
            fs::write(dir.join("tests/test_main.py"), "def test(): pass\n").unwrap();
        }
        fs::write(dir.join("instructions.md"), "Do it").unwrap();
        let raw = r#"{"instructions_file": "instructions.md", "eval": {"command": ["true"]}}"#;
        fs::write(dir.join(METADATA_FILE), raw).unwrap();
        let metadata: TaskMetadata = serde_json::from_str(raw).unwrap();
        TaskDefinition::from_metadata("t1", &dir, metadata).unwrap()
    }

    #[tokio::test]
    async fn test_acquire_copies_workspace_and_tests() {
        let tmp = tempfile::TempDir::new().unwrap();
        let task = make_task(tmp.path(), true);

        let sandbox = Sandbox::acquire(&task).await.unwrap();
        assert!(sandbox.root().ends_with("workspace"));
        assert_eq!(fs::read_to_string(sandbox.root().join("main.py")).unwrap(), "x = 1\n");
        assert!(sandbox.root().join("pkg/mod.py").is_file());
        assert!(sandbox.root().join("tests/test_main.py").is_file());

        let name = sandbox.root().parent().unwrap().file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("t1_"));
    }

    #[tokio::test]
    async fn test_mutations_do_not_touch_task() {
        let tmp = tempfile::TempDir::new().unwrap();
        let task = make_task(tmp.path(), false);

        let sandbox = Sandbox::acquire(&task).await.unwrap();
        fs::write(sandbox.root().join("main.py"), "x = 99\n").unwrap();
        assert_eq!(fs::read_to_string(task.workspace_path.join("main.py")).unwrap(), "x = 1\n");
    }

    #[tokio::test]
    async fn test_release_and_drop_remove_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let task = make_task(tmp.path(), false);

        let sandbox = Sandbox::acquire(&task).await.unwrap();
        let path = sandbox.root().to_path_buf();
        sandbox.release().await.unwrap();
        assert!(!path.exists());

        let sandbox = Sandbox::acquire(&task).await.unwrap();
        let path = sandbox.root().to_path_buf();
        drop(sandbox);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_sandboxes_are_independent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let task = make_task(tmp.path(), false);

        let a = Sandbox::acquire(&task).await.unwrap();
        let b = Sandbox::acquire(&task).await.unwrap();
        assert_ne!(a.root(), b.root());
        fs::write(a.root().join("main.py"), "changed\n").unwrap();
        assert_eq!(fs::read_to_string(b.root().join("main.py")).unwrap(), "x = 1\n");
    }

    #[tokio::test]
    async fn test_requirements_copied_to_workspace_root() {
        let tmp = tempfile::TempDir::new().unwrap();
        let task = make_task(tmp.path(), false);
        fs::write(task.task_dir.join(REQUIREMENTS_FILE), "requests==2.31.0\n").unwrap();

        let sandbox = Sandbox::acquire(&task).await.unwrap();
        let copied = sandbox.root().join(REQUIREMENTS_FILE);
        assert_eq!(fs::read_to_string(copied).unwrap(), "requests==2.31.0\n");
        assert!(!sandbox.root().parent().unwrap().join(REQUIREMENTS_FILE).exists());
    }
}
