//! Session snapshots: file contents captured for later rollback

use super::{ConflictError, ConflictResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    /// Relative path -> content; None when the file did not exist
    pub files: BTreeMap<String, Option<String>>,
}

/// Read the current content of each path under `root`
pub fn capture<'a, I>(root: &Path, paths: I) -> ConflictResult<BTreeMap<String, Option<String>>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut files = BTreeMap::new();
    for rel in paths {
        files.insert(rel.to_string(), read_optional(root, rel)?);
    }
    Ok(files)
}

/// Write every captured file back; files absent at capture time are removed
pub fn restore(root: &Path, snapshot: &Snapshot) -> ConflictResult<usize> {
    let mut restored = 0;
    for (rel, content) in &snapshot.files {
        let full = root.join(rel);
        match content {
            Some(text) => {
                write_file(root, rel, text)?;
                restored += 1;
            }
            None if full.exists() => {
                std::fs::remove_file(&full).map_err(|e| ConflictError::io(&full, e))?;
                restored += 1;
            }
            None => {}
        }
    }
    Ok(restored)
}

pub(crate) fn read_optional(root: &Path, rel: &str) -> ConflictResult<Option<String>> {
    let full = root.join(rel);
    match std::fs::read_to_string(&full) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConflictError::io(&full, e)),
    }
}

pub(crate) fn write_file(root: &Path, rel: &str, content: &str) -> ConflictResult<()> {
    let full = root.join(rel);
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConflictError::io(parent, e))?;
    }
    std::fs::write(&full, content).map_err(|e| ConflictError::io(&full, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_capture_and_restore() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        write_file(root, "a.txt", "one").unwrap();

        let files = capture(root, ["a.txt", "dir/new.txt"]).unwrap();
        assert_eq!(files["a.txt"].as_deref(), Some("one"));
        assert_eq!(files["dir/new.txt"], None);

        let snapshot = Snapshot {
            id: "snap-1".to_string(),
            session_id: "s1".to_string(),
            created_at: Utc::now(),
            files,
        };

        write_file(root, "a.txt", "two").unwrap();
        write_file(root, "dir/new.txt", "created later").unwrap();

        assert_eq!(restore(root, &snapshot).unwrap(), 2);
        assert_eq!(std::fs::read_to_string(root.join("a.txt")).unwrap(), "one");
        assert!(!root.join("dir/new.txt").exists());
    }
}
