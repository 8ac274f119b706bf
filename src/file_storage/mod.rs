//! File-based storage for orchestrator state
//!
//! Project-local storage (`.orchestrator/` in the repository root):
//! - `sessions.json` - Session records with their workspaces
//! - `worktrees/` - Per-agent worktrees (gitignored)
//! - `config.toml` - Project configuration

pub mod sessions;

use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Unsupported store version {found} (expected at most {supported})")]
    UnsupportedVersion { found: u32, supported: u32 },
}

/// Common file operations result type
pub type FileResult<T> = Result<T, StorageError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Ensure a directory exists, creating it if necessary
pub fn ensure_dir(path: &Path) -> FileResult<()> {
    if !path.exists() {
        fs::create_dir_all(path).map_err(io_err(path))?;
    }
    Ok(())
}

/// Write data to a file atomically (temp file + rename)
pub fn atomic_write(path: &Path, content: &str) -> FileResult<()> {
    let temp_path = path.with_extension("tmp");

    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }

    fs::write(&temp_path, content).map_err(io_err(&temp_path))?;
    fs::rename(&temp_path, path).map_err(io_err(path))?;

    Ok(())
}

/// Read a JSON file and deserialize it
pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> FileResult<T> {
    let content = fs::read_to_string(path).map_err(io_err(path))?;

    serde_json::from_str(&content).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })
}

/// Write data as pretty-printed JSON atomically
pub fn write_json<T: serde::Serialize>(path: &Path, data: &T) -> FileResult<()> {
    let content = serde_json::to_string_pretty(data).map_err(|source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    atomic_write(path, &content)
}

/// Initialize the .orchestrator directory with a .gitignore for runtime files
pub fn init_orchestrator_dir(project_path: &Path) -> FileResult<PathBuf> {
    let dir = crate::utils::orchestrator_dir(project_path);
    ensure_dir(&dir)?;

    let gitignore_path = dir.join(".gitignore");
    if !gitignore_path.exists() {
        let gitignore_content = "# Runtime files (not for sharing)\n*.tmp\nworktrees/\nsessions.json\n";
        fs::write(&gitignore_path, gitignore_content).map_err(io_err(&gitignore_path))?;
    }

    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_dir() {
        let temp_dir = TempDir::new().unwrap();
        let nested_path = temp_dir.path().join("a").join("b").join("c");

        assert!(!nested_path.exists());
        ensure_dir(&nested_path).unwrap();
        assert!(nested_path.exists());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("state.json");

        atomic_write(&file_path, "{}").unwrap();

        assert_eq!(fs::read_to_string(&file_path).unwrap(), "{}");
        assert!(!temp_dir.path().join("state.tmp").exists());
    }

    #[test]
    fn test_read_write_json() {
        use serde::{Deserialize, Serialize};

        #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
        struct TestData {
            name: String,
            value: i32,
        }

        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("test.json");

        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        write_json(&file_path, &data).unwrap();
        let read_data: TestData = read_json(&file_path).unwrap();

        assert_eq!(data, read_data);
    }

    #[test]
    fn test_read_json_reports_parse_errors() {
        let temp_dir = TempDir::new().unwrap();
        let file_path = temp_dir.path().join("bad.json");
        fs::write(&file_path, "not json").unwrap();

        let result: FileResult<serde_json::Value> = read_json(&file_path);
        assert!(matches!(result, Err(StorageError::Json { .. })));
    }

    #[test]
    fn test_init_orchestrator_dir() {
        let temp_dir = TempDir::new().unwrap();
        let dir = init_orchestrator_dir(temp_dir.path()).unwrap();

        assert!(dir.exists());
        let gitignore = fs::read_to_string(dir.join(".gitignore")).unwrap();
        assert!(gitignore.contains("worktrees/"));
    }
}
