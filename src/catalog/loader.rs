//! Filesystem-backed task catalog.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::task::{TaskDefinition, TaskMetadata, METADATA_FILE};
use crate::error::CatalogError;
use crate::utils::validate_task_id;

/// Which tasks a run covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectionRepr", into = "SelectionRepr")]
pub enum TaskSelection {
    /// Every task discovered under the catalog root.
    All,
    /// An explicit list of task ids.
    Ids(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum SelectionRepr {
    Keyword(String),
    Ids(Vec<String>),
}

impl TryFrom<SelectionRepr> for TaskSelection {
    type Error = String;

    fn try_from(repr: SelectionRepr) -> Result<Self, Self::Error> {
        match repr {
            SelectionRepr::Keyword(word) => Ok(TaskSelection::parse(&word)),
            SelectionRepr::Ids(ids) if ids.is_empty() => Err("task list is empty".to_string()),
            SelectionRepr::Ids(ids) => Ok(TaskSelection::Ids(ids)),
        }
    }
}

impl From<TaskSelection> for SelectionRepr {
    fn from(selection: TaskSelection) -> Self {
        match selection {
            TaskSelection::All => SelectionRepr::Keyword("all".to_string()),
            TaskSelection::Ids(ids) => SelectionRepr::Ids(ids),
        }
    }
}

impl TaskSelection {
    /// Parse `"all"` or a comma-separated list of ids.
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return TaskSelection::All;
        }
        TaskSelection::Ids(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        )
    }
}

impl fmt::Display for TaskSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskSelection::All => write!(f, "all"),
            TaskSelection::Ids(ids) => write!(f, "{}", ids.join(",")),
        }
    }
}

/// Read-only view of a directory of tasks, one subdirectory per task.
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    root: PathBuf,
}

impl TaskCatalog {
    /// Create a catalog without checking the root exists.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Open a catalog, failing if the root is not a directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let root = root.into();
        if !root.is_dir() {
            return Err(CatalogError::MissingRoot(root.display().to_string()));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List task ids with a metadata file, sorted.
    pub fn discover(&self) -> Result<Vec<String>, CatalogError> {
        if !self.root.is_dir() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !path.join(METADATA_FILE).is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if validate_task_id(name).is_ok() {
                    ids.push(name.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Load a single task definition.
    pub fn load(&self, task_id: &str) -> Result<TaskDefinition, CatalogError> {
        validate_task_id(task_id).map_err(|e| CatalogError::InvalidTaskId {
            id: task_id.to_string(),
            reason: e.to_string(),
        })?;

        let task_dir = self.root.join(task_id);
        let metadata_path = task_dir.join(METADATA_FILE);
        if !metadata_path.is_file() {
            return Err(CatalogError::TaskNotFound(task_id.to_string()));
        }

        let raw = fs::read_to_string(&metadata_path)?;
        let metadata: TaskMetadata =
            serde_json::from_str(&raw).map_err(|e| CatalogError::InvalidMetadata {
                task_id: task_id.to_string(),
                reason: e.to_string(),
            })?;

        let task = TaskDefinition::from_metadata(task_id, &task_dir, metadata)?;
        debug!(task_id = %task.id, language = %task.language, "Loaded task definition");
        Ok(task)
    }

    /// Resolve a selection into definitions sorted by id.
    ///
    /// Any id that cannot be loaded fails the whole resolution.
    pub fn resolve(&self, selection: &TaskSelection) -> Result<Vec<TaskDefinition>, CatalogError> {
        let ids: BTreeSet<String> = match selection {
            TaskSelection::All => self.discover()?.into_iter().collect(),
            TaskSelection::Ids(ids) => ids.iter().cloned().collect(),
        };
        if ids.is_empty() {
            return Err(CatalogError::EmptySelection);
        }
        ids.iter().map(|id| self.load(id)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_task(root: &Path, id: &str) {
        let dir = root.join(id);
        fs::create_dir_all(dir.join("workspace")).unwrap();
        fs::write(dir.join("instructions.md"), "Fix it").unwrap();
        fs::write(
            dir.join(METADATA_FILE),
            r#"{"instructions_file": "instructions.md", "eval": {"command": ["true"]}}"#,
        )
        .unwrap();
    }

    #[test]
    fn test_selection_parse() {
        assert_eq!(TaskSelection::parse("all"), TaskSelection::All);
        assert_eq!(TaskSelection::parse(" ALL "), TaskSelection::All);
        assert_eq!(
            TaskSelection::parse("t1, t2,,"),
            TaskSelection::Ids(vec!["t1".to_string(), "t2".to_string()])
        );
    }

    #[test]
    fn test_selection_serde() {
        let all: TaskSelection = serde_yaml::from_str("all").unwrap();
        assert_eq!(all, TaskSelection::All);
        let ids: TaskSelection = serde_yaml::from_str("[t1, t2]").unwrap();
        assert_eq!(ids, TaskSelection::Ids(vec!["t1".into(), "t2".into()]));
        assert!(serde_json::from_str::<TaskSelection>("[]").is_err());
        assert_eq!(serde_json::to_string(&TaskSelection::All).unwrap(), "\"all\"");
    }

    #[test]
    fn test_discover_sorted_and_filtered() {
        let tmp = TempDir::new().unwrap();
        write_task(tmp.path(), "b_task");
        write_task(tmp.path(), "a_task");
        fs::create_dir_all(tmp.path().join("no_metadata")).unwrap();

        let catalog = TaskCatalog::open(tmp.path()).unwrap();
        assert_eq!(catalog.discover().unwrap(), vec!["a_task", "b_task"]);
    }

    #[test]
    fn test_resolve_all_and_ids() {
        let tmp = TempDir::new().unwrap();
        write_task(tmp.path(), "t2");
        write_task(tmp.path(), "t1");
        let catalog = TaskCatalog::open(tmp.path()).unwrap();

        let all = catalog.resolve(&TaskSelection::All).unwrap();
        assert_eq!(all.iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), ["t1", "t2"]);

        let one = catalog
            .resolve(&TaskSelection::Ids(vec!["t2".into(), "t2".into()]))
            .unwrap();
        assert_eq!(one.len(), 1);
    }

    #[test]
    fn test_resolve_missing_task() {
        let tmp = TempDir::new().unwrap();
        write_task(tmp.path(), "t1");
        let catalog = TaskCatalog::open(tmp.path()).unwrap();

        let err = catalog
            .resolve(&TaskSelection::Ids(vec!["missing_task".into()]))
            .unwrap_err();
        assert!(matches!(err, CatalogError::TaskNotFound(id) if id == "missing_task"));
    }

    #[test]
    fn test_resolve_empty_catalog() {
        let tmp = TempDir::new().unwrap();
        let catalog = TaskCatalog::open(tmp.path()).unwrap();
        assert!(matches!(
            catalog.resolve(&TaskSelection::All),
            Err(CatalogError::EmptySelection)
        ));
    }

    #[test]
    fn test_load_rejects_traversal_id() {
        let tmp = TempDir::new().unwrap();
        let catalog = TaskCatalog::open(tmp.path()).unwrap();
        assert!(matches!(
            catalog.load("../etc"),
            Err(CatalogError::InvalidTaskId { .. })
        ));
    }

    #[test]
    fn test_open_missing_root() {
        assert!(TaskCatalog::open("/definitely/not/a/real/dir").is_err());
    }
}
