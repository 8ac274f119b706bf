//! Session store
//!
//! All sessions and their workspaces live in a single JSON document that is
//! rewritten atomically on every mutation.

use super::{read_json, write_json, FileResult, StorageError};
use crate::models::{Session, Workspace};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Version of the session store format
pub const SESSIONS_FILE_VERSION: u32 = 1;

/// One persisted session together with the workspaces it owns
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session: Session,
    pub workspaces: Vec<Workspace>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionsFile {
    /// File format version
    pub version: u32,
    /// When this file was last written
    pub updated_at: DateTime<Utc>,
    pub sessions: Vec<SessionRecord>,
}

impl SessionsFile {
    pub fn new(sessions: Vec<SessionRecord>) -> Self {
        Self {
            version: SESSIONS_FILE_VERSION,
            updated_at: Utc::now(),
            sessions,
        }
    }
}

/// Load the session store; a missing file is an empty store
pub fn load_sessions(path: &Path) -> FileResult<SessionsFile> {
    if !path.exists() {
        return Ok(SessionsFile::new(Vec::new()));
    }

    let file: SessionsFile = read_json(path)?;
    if file.version > SESSIONS_FILE_VERSION {
        return Err(StorageError::UnsupportedVersion {
            found: file.version,
            supported: SESSIONS_FILE_VERSION,
        });
    }

    log::debug!(
        "[SessionStore] Loaded {} sessions from {:?}",
        file.sessions.len(),
        path
    );
    Ok(file)
}

/// Persist the session store, sorted by start time for stable diffs
pub fn save_sessions(path: &Path, mut sessions: Vec<SessionRecord>) -> FileResult<()> {
    sessions.sort_by(|a, b| {
        a.session
            .started_at
            .cmp(&b.session.started_at)
            .then_with(|| a.session.id.cmp(&b.session.id))
    });
    write_json(path, &SessionsFile::new(sessions))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CoordinationStrategy, SessionStatus, WorkspaceStatus};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn record(id: &str) -> SessionRecord {
        let session = Session {
            id: id.to_string(),
            task_description: "Refactor module".to_string(),
            agents: vec!["agent-1".to_string()],
            strategy: CoordinationStrategy::Parallel,
            status: SessionStatus::Executing,
            started_at: Utc::now(),
            ended_at: None,
            workspaces: vec![format!("ws-{}", id)],
            state: Default::default(),
            metrics: Default::default(),
            strategy_history: vec![],
        };
        let workspace = Workspace {
            id: format!("ws-{}", id),
            session_id: id.to_string(),
            agent_id: "agent-1".to_string(),
            path: PathBuf::from("/tmp/ws"),
            branch: Workspace::branch_name(id, "agent-1"),
            created_at: Utc::now(),
            status: WorkspaceStatus::Active,
            error: None,
        };
        SessionRecord {
            session,
            workspaces: vec![workspace],
        }
    }

    #[test]
    fn test_missing_store_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let file = load_sessions(&temp_dir.path().join("sessions.json")).unwrap();
        assert!(file.sessions.is_empty());
        assert_eq!(file.version, SESSIONS_FILE_VERSION);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".orchestrator").join("sessions.json");

        save_sessions(&path, vec![record("s1"), record("s2")]).unwrap();
        let file = load_sessions(&path).unwrap();

        assert_eq!(file.sessions.len(), 2);
        assert_eq!(file.sessions[0].workspaces[0].branch, "orchestrator/s1/agent-1");
    }

    #[test]
    fn test_timestamps_are_rfc3339_text() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");
        save_sessions(&path, vec![record("s1")]).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let started = raw["sessions"][0]["session"]["startedAt"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(started).is_ok());
    }

    #[test]
    fn test_rejects_newer_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");
        std::fs::write(
            &path,
            r#"{"version": 99, "updatedAt": "2026-01-01T00:00:00Z", "sessions": []}"#,
        )
        .unwrap();

        assert!(matches!(
            load_sessions(&path),
            Err(StorageError::UnsupportedVersion { found: 99, .. })
        ));
    }
}
