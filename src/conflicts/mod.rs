//! Shared workspace and conflict manager
//!
//! Every file operation an agent issues goes through `apply_operation`.
//! Detection runs against the operation history and the lock table under a
//! single state lock before anything touches the filesystem, so an operation
//! is written only when it is conflict-free or every conflict it raised could
//! be merged automatically. Everything else is deferred (lock contention) or
//! escalated to the caller, never dropped.

pub mod detection;
pub mod locks;
pub mod merge;
pub mod snapshots;

pub use locks::{FileLock, LockType};
pub use merge::{three_way_merge, MergeOutput};
pub use snapshots::Snapshot;

use crate::config::ConflictConfig;
use crate::events::{
    ConflictDetectedPayload, ConflictEscalatedPayload, ConflictResolvedPayload, EventSink,
    LockExpiredPayload, OrchestratorEvent,
};
use crate::utils::{generate_id, lock_mutex_recover};
use chrono::{DateTime, Duration, Utc};
use locks::LockTable;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use snapshots::{read_optional, write_file};
use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConflictError {
    #[error("Invalid path '{0}': must stay inside the workspace root")]
    InvalidPath(String),

    #[error("{kind} operation on {path} requires content")]
    MissingContent { kind: OperationKind, path: String },

    #[error("{kind} operation on {path} requires a target path")]
    MissingTarget { kind: OperationKind, path: String },

    #[error("Path {path} is locked ({lock_type}) by agent {holder_agent}")]
    LockContention {
        path: String,
        holder_agent: String,
        lock_type: LockType,
    },

    #[error("Lock not found: {0}")]
    LockNotFound(String),

    #[error("Conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("Operation not found: {0}")]
    OperationNotFound(String),

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConflictError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        ConflictError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type ConflictResult<T> = Result<T, ConflictError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    Move,
    Copy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::Move => "move",
            OperationKind::Copy => "copy",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A mutation an agent wants to make
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperationRequest {
    pub session_id: String,
    pub agent_id: String,
    pub kind: OperationKind,
    pub path: String,
    /// Destination for move and copy
    #[serde(default)]
    pub target_path: Option<String>,
    /// New content for create and update
    #[serde(default)]
    pub content: Option<String>,
}

impl FileOperationRequest {
    fn new(session_id: &str, agent_id: &str, kind: OperationKind, path: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            kind,
            path: path.to_string(),
            target_path: None,
            content: None,
        }
    }

    pub fn create(session_id: &str, agent_id: &str, path: &str, content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            ..Self::new(session_id, agent_id, OperationKind::Create, path)
        }
    }

    pub fn update(session_id: &str, agent_id: &str, path: &str, content: &str) -> Self {
        Self {
            content: Some(content.to_string()),
            ..Self::new(session_id, agent_id, OperationKind::Update, path)
        }
    }

    pub fn delete(session_id: &str, agent_id: &str, path: &str) -> Self {
        Self::new(session_id, agent_id, OperationKind::Delete, path)
    }

    pub fn move_to(session_id: &str, agent_id: &str, from: &str, to: &str) -> Self {
        Self {
            target_path: Some(to.to_string()),
            ..Self::new(session_id, agent_id, OperationKind::Move, from)
        }
    }

    pub fn copy_to(session_id: &str, agent_id: &str, from: &str, to: &str) -> Self {
        Self {
            target_path: Some(to.to_string()),
            ..Self::new(session_id, agent_id, OperationKind::Copy, from)
        }
    }
}

/// Recorded operation. Immutable once applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOperation {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub kind: OperationKind,
    /// Normalised, root-relative, '/'-separated
    pub path: String,
    pub target_path: Option<String>,
    pub content: Option<String>,
    /// SHA-256 of `content`
    pub checksum: Option<String>,
    /// Content of `path` just before this operation was applied
    pub base_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub applied: bool,
    /// Folded into another operation's merge or lost a last-writer-wins decision
    pub superseded: bool,
}

impl FileOperation {
    pub fn touched_paths(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.path.as_str()).chain(self.target_path.as_deref())
    }

    pub fn touches(&self, path: &str) -> bool {
        self.touched_paths().any(|p| p == path)
    }

    fn is_pending(&self) -> bool {
        !self.applied && !self.superseded
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ConcurrentEdit,
    LockContention,
    MergeConflict,
    SemanticConflict,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::ConcurrentEdit => "concurrent_edit",
            ConflictType::LockContention => "lock_contention",
            ConflictType::MergeConflict => "merge_conflict",
            ConflictType::SemanticConflict => "semantic_conflict",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ConflictSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictSeverity::Low => "low",
            ConflictSeverity::Medium => "medium",
            ConflictSeverity::High => "high",
            ConflictSeverity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Open,
    /// Waiting for a lock holder to release
    Deferred,
    Resolved,
    /// Handed to the caller for manual resolution
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resolution {
    ThreeWayMerge { conflict_markers: usize },
    LastWriterWins { winner_agent: String },
    Deferred { holder_agent: String },
    LockReleased,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::ThreeWayMerge { .. } => "three_way_merge",
            Resolution::LastWriterWins { .. } => "last_writer_wins",
            Resolution::Deferred { .. } => "deferred",
            Resolution::LockReleased => "lock_released",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub session_id: String,
    pub path: String,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub agents: Vec<String>,
    /// Incoming operation first, then the operations it collided with
    pub operations: Vec<String>,
    pub auto_resolvable: bool,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    pub resolution: Option<Resolution>,
    pub escalation_reason: Option<String>,
}

impl Conflict {
    pub fn is_unresolved(&self) -> bool {
        self.status != ConflictStatus::Resolved
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Written with no conflict
    Applied,
    /// Written after an automatic three-way merge
    Merged,
    /// Held until a blocking lock is released
    Deferred,
    /// Not written; needs `resolve_conflict` or manual handling
    Escalated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub operation_id: String,
    pub status: ApplyStatus,
    pub conflicts: Vec<String>,
}

pub fn checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

#[derive(Default)]
struct ConflictState {
    /// Operation history in arrival order
    operations: Vec<FileOperation>,
    locks: LockTable,
    conflicts: Vec<Conflict>,
    /// Operation ids waiting on a lock, oldest first
    deferred: Vec<String>,
    snapshots: HashMap<String, Snapshot>,
}

impl ConflictState {
    fn operation(&self, id: &str) -> Option<&FileOperation> {
        self.operations.iter().find(|op| op.id == id)
    }

    fn operation_mut(&mut self, id: &str) -> Option<&mut FileOperation> {
        self.operations.iter_mut().find(|op| op.id == id)
    }

    fn take_operation(&mut self, id: &str) -> Option<FileOperation> {
        let pos = self.operations.iter().position(|op| op.id == id)?;
        Some(self.operations.remove(pos))
    }

    fn conflict_mut(&mut self, id: &str) -> Option<&mut Conflict> {
        self.conflicts.iter_mut().find(|c| c.id == id)
    }

    /// Lock held by another agent that stops `op` from writing
    fn write_blocker(&self, op: &FileOperation, now: DateTime<Utc>) -> Option<FileLock> {
        op.touched_paths()
            .find_map(|p| self.locks.write_blocker(p, &op.agent_id, now))
            .cloned()
    }
}

pub struct ConflictManager {
    root: PathBuf,
    config: ConflictConfig,
    state: Mutex<ConflictState>,
    events: Arc<dyn EventSink>,
}

impl ConflictManager {
    pub fn new(root: &Path, config: ConflictConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            state: Mutex::new(ConflictState::default()),
            events,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn emit_all(&self, events: Vec<OrchestratorEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    fn window(&self) -> Duration {
        Duration::seconds(self.config.recency_window_secs as i64)
    }

    /// Root-relative '/'-separated form; rejects anything escaping the root
    pub fn normalize_path(&self, raw: &str) -> ConflictResult<String> {
        let invalid = || ConflictError::InvalidPath(raw.to_string());
        let candidate = Path::new(raw);
        let relative = if candidate.is_absolute() {
            candidate.strip_prefix(&self.root).map_err(|_| invalid())?
        } else {
            candidate
        };

        let mut parts: Vec<String> = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(invalid());
                    }
                }
                Component::RootDir | Component::Prefix(_) => return Err(invalid()),
            }
        }
        if parts.is_empty() {
            return Err(invalid());
        }
        Ok(parts.join("/"))
    }

    fn build_operation(&self, req: FileOperationRequest) -> ConflictResult<FileOperation> {
        let path = self.normalize_path(&req.path)?;
        let target_path = match (&req.kind, req.target_path.as_deref()) {
            (OperationKind::Move | OperationKind::Copy, Some(target)) => {
                Some(self.normalize_path(target)?)
            }
            (OperationKind::Move | OperationKind::Copy, None) => {
                return Err(ConflictError::MissingTarget {
                    kind: req.kind,
                    path,
                })
            }
            _ => None,
        };
        if matches!(req.kind, OperationKind::Create | OperationKind::Update) && req.content.is_none() {
            return Err(ConflictError::MissingContent {
                kind: req.kind,
                path,
            });
        }

        Ok(FileOperation {
            id: generate_id("op"),
            session_id: req.session_id,
            agent_id: req.agent_id,
            kind: req.kind,
            checksum: req.content.as_deref().map(checksum),
            path,
            target_path,
            content: req.content,
            base_content: None,
            timestamp: Utc::now(),
            applied: false,
            superseded: false,
        })
    }

    fn is_sensitive(&self, op: &FileOperation) -> bool {
        op.touched_paths()
            .any(|p| detection::is_sensitive(p, &self.config.sensitive_paths))
    }

    fn new_conflict(
        &self,
        conflict_type: ConflictType,
        op: &FileOperation,
        peers: &[&FileOperation],
        holder_agent: Option<&str>,
    ) -> Conflict {
        let mut agents = vec![op.agent_id.clone()];
        for agent in peers.iter().map(|p| p.agent_id.as_str()).chain(holder_agent) {
            if !agents.iter().any(|a| a == agent) {
                agents.push(agent.to_string());
            }
        }

        let mut operations = vec![op.id.clone()];
        operations.extend(peers.iter().map(|p| p.id.clone()));

        Conflict {
            id: generate_id("conflict"),
            session_id: op.session_id.clone(),
            path: op.path.clone(),
            conflict_type,
            severity: detection::classify_severity(op, peers, self.is_sensitive(op)),
            agents,
            operations,
            auto_resolvable: detection::is_auto_resolvable(conflict_type, op, peers),
            detected_at: Utc::now(),
            status: ConflictStatus::Open,
            resolution: None,
            escalation_reason: None,
        }
    }

    fn detect_locked(&self, state: &ConflictState, op: &FileOperation, now: DateTime<Utc>) -> Vec<Conflict> {
        let mut conflicts = Vec::new();

        let peers = detection::concurrent_candidates(&state.operations, op, self.window());
        if !peers.is_empty() {
            conflicts.push(self.new_conflict(ConflictType::ConcurrentEdit, op, &peers, None));
        }

        if let Some(holder) = state.write_blocker(op, now) {
            conflicts.push(self.new_conflict(
                ConflictType::LockContention,
                op,
                &[],
                Some(&holder.agent_id),
            ));
        }
        conflicts
    }

    /// Conflicts `op` would raise right now, without recording anything
    pub fn detect_conflicts(&self, op: &FileOperation) -> Vec<Conflict> {
        let state = lock_mutex_recover(&self.state);
        self.detect_locked(&state, op, Utc::now())
    }

    fn detected_event(conflict: &Conflict) -> OrchestratorEvent {
        OrchestratorEvent::ConflictDetected(ConflictDetectedPayload {
            conflict_id: conflict.id.clone(),
            session_id: conflict.session_id.clone(),
            path: conflict.path.clone(),
            conflict_type: conflict.conflict_type.as_str().to_string(),
            severity: conflict.severity.as_str().to_string(),
            agents: conflict.agents.clone(),
            auto_resolvable: conflict.auto_resolvable,
        })
    }

    fn resolved_event(conflict: &Conflict, resolution: &Resolution) -> OrchestratorEvent {
        OrchestratorEvent::ConflictResolved(ConflictResolvedPayload {
            conflict_id: conflict.id.clone(),
            session_id: conflict.session_id.clone(),
            path: conflict.path.clone(),
            resolution: resolution.as_str().to_string(),
        })
    }

    fn escalated_event(conflict: &Conflict, reason: &str) -> OrchestratorEvent {
        OrchestratorEvent::ConflictEscalated(ConflictEscalatedPayload {
            conflict_id: conflict.id.clone(),
            session_id: conflict.session_id.clone(),
            path: conflict.path.clone(),
            reason: reason.to_string(),
        })
    }

    /// Perform the filesystem side of an operation
    fn write_through(&self, op: &mut FileOperation) -> ConflictResult<()> {
        op.base_content = read_optional(&self.root, &op.path)?;
        let source = self.root.join(&op.path);

        match op.kind {
            OperationKind::Create | OperationKind::Update => {
                let content = op.content.as_deref().unwrap_or_default();
                write_file(&self.root, &op.path, content)?;
            }
            OperationKind::Delete => {
                if source.exists() {
                    std::fs::remove_file(&source).map_err(|e| ConflictError::io(&source, e))?;
                }
            }
            OperationKind::Move | OperationKind::Copy => {
                let target_rel = op.target_path.as_deref().ok_or_else(|| ConflictError::MissingTarget {
                    kind: op.kind,
                    path: op.path.clone(),
                })?;
                let target = self.root.join(target_rel);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| ConflictError::io(parent, e))?;
                }
                if op.kind == OperationKind::Move {
                    std::fs::rename(&source, &target).map_err(|e| ConflictError::io(&source, e))?;
                } else {
                    std::fs::copy(&source, &target).map_err(|e| ConflictError::io(&source, e))?;
                }
            }
        }

        op.applied = true;
        Ok(())
    }

    /// Three-way merge of `op` with the single peer it collided with
    fn merge_with_peer(&self, op: &FileOperation, peer: &FileOperation) -> ConflictResult<MergeOutput> {
        let current = read_optional(&self.root, &op.path)?.unwrap_or_default();
        let (base, left) = if peer.applied {
            (peer.base_content.clone().unwrap_or_default(), current)
        } else {
            (current, peer.content.clone().unwrap_or_default())
        };
        let right = op.content.as_deref().unwrap_or_default();
        Ok(three_way_merge(&base, &left, right))
    }

    /// Write the merged result of `op` and `peer_id`, marking an unapplied peer superseded
    fn apply_merged(
        &self,
        state: &mut ConflictState,
        op: &mut FileOperation,
        peer_id: &str,
    ) -> ConflictResult<Resolution> {
        let peer = state
            .operation(peer_id)
            .cloned()
            .ok_or_else(|| ConflictError::OperationNotFound(peer_id.to_string()))?;
        let merged = self.merge_with_peer(op, &peer)?;

        op.base_content = read_optional(&self.root, &op.path)?;
        write_file(&self.root, &op.path, &merged.content)?;
        op.applied = true;

        if !peer.applied {
            if let Some(p) = state.operation_mut(peer_id) {
                p.superseded = true;
            }
            state.deferred.retain(|id| id != peer_id);
        }

        if !merged.is_clean() {
            log::warn!(
                "[ConflictManager] Merge of {} left {} conflict block(s) for manual follow-up",
                op.path,
                merged.conflicts
            );
        }
        Ok(Resolution::ThreeWayMerge {
            conflict_markers: merged.conflicts,
        })
    }

    /// Take over the id of a deferred conflict of the same kind raised by the same operation
    fn adopt_deferred(state: &mut ConflictState, conflict: &mut Conflict) {
        let Some(pos) = state.conflicts.iter().position(|c| {
            c.status == ConflictStatus::Deferred
                && c.conflict_type == conflict.conflict_type
                && c.operations.first() == conflict.operations.first()
        }) else {
            return;
        };
        let previous = state.conflicts.remove(pos);
        conflict.id = previous.id;
        conflict.detected_at = previous.detected_at;
    }

    fn apply_locked(
        &self,
        state: &mut ConflictState,
        mut op: FileOperation,
        events: &mut Vec<OrchestratorEvent>,
    ) -> ConflictResult<ApplyOutcome> {
        let detected = self.detect_locked(state, &op, Utc::now());
        let operation_id = op.id.clone();

        if detected.is_empty() {
            self.write_through(&mut op)?;
            log::debug!(
                "[ConflictManager] Applied {} {} for {}",
                op.kind,
                op.path,
                op.agent_id
            );
            state.operations.push(op);
            return Ok(ApplyOutcome {
                operation_id,
                status: ApplyStatus::Applied,
                conflicts: Vec::new(),
            });
        }

        // Lock contention wins: the write waits for the holder, and any
        // concurrent edit it also raised waits with it
        let holder = detected
            .iter()
            .find(|c| c.conflict_type == ConflictType::LockContention)
            .and_then(|c| c.agents.last().cloned());
        if let Some(holder) = holder {
            log::info!(
                "[ConflictManager] Deferring {} on {} until {} releases its lock",
                op.kind,
                op.path,
                holder
            );
            let mut ids = Vec::new();
            for mut conflict in detected {
                Self::adopt_deferred(state, &mut conflict);
                conflict.status = ConflictStatus::Deferred;
                conflict.resolution = Some(Resolution::Deferred {
                    holder_agent: holder.clone(),
                });
                events.push(Self::detected_event(&conflict));
                ids.push(conflict.id.clone());
                state.conflicts.push(conflict);
            }
            state.deferred.push(operation_id.clone());
            state.operations.push(op);
            return Ok(ApplyOutcome {
                operation_id,
                status: ApplyStatus::Deferred,
                conflicts: ids,
            });
        }

        let mut conflict = detected
            .into_iter()
            .next()
            .ok_or_else(|| ConflictError::OperationNotFound(operation_id.clone()))?;
        Self::adopt_deferred(state, &mut conflict);
        events.push(Self::detected_event(&conflict));
        log::info!(
            "[ConflictManager] {} conflict on {} between {:?} ({})",
            conflict.conflict_type.as_str(),
            conflict.path,
            conflict.agents,
            conflict.severity.as_str()
        );

        let conflict_id = conflict.id.clone();
        let status = if conflict.auto_resolvable {
            let peer_id = conflict.operations.get(1).cloned().unwrap_or_default();
            let resolution = self.apply_merged(state, &mut op, &peer_id)?;
            events.push(Self::resolved_event(&conflict, &resolution));
            conflict.status = ConflictStatus::Resolved;
            conflict.resolution = Some(resolution);
            ApplyStatus::Merged
        } else {
            let reason = format!(
                "{} conflict on {} is not auto-resolvable",
                conflict.severity.as_str(),
                conflict.path
            );
            log::warn!("[ConflictManager] Escalating: {}", reason);
            events.push(Self::escalated_event(&conflict, &reason));
            conflict.status = ConflictStatus::Escalated;
            conflict.escalation_reason = Some(reason);
            ApplyStatus::Escalated
        };

        state.conflicts.push(conflict);
        state.operations.push(op);
        Ok(ApplyOutcome {
            operation_id,
            status,
            conflicts: vec![conflict_id],
        })
    }

    /// Record an operation, detect conflicts, and write it through when safe
    pub fn apply_operation(&self, req: FileOperationRequest) -> ConflictResult<ApplyOutcome> {
        let op = self.build_operation(req)?;
        let mut events = Vec::new();
        let outcome = {
            let mut state = lock_mutex_recover(&self.state);
            self.apply_locked(&mut state, op, &mut events)?
        };
        self.emit_all(events);
        Ok(outcome)
    }

    /// Retry deferred operations whose blocking lock is gone
    fn retry_deferred(
        &self,
        state: &mut ConflictState,
        now: DateTime<Utc>,
        events: &mut Vec<OrchestratorEvent>,
    ) -> usize {
        let mut retried = 0;
        for op_id in state.deferred.clone() {
            let ready = state
                .operation(&op_id)
                .map_or(false, |op| op.is_pending() && state.write_blocker(op, now).is_none());
            if !ready {
                continue;
            }

            state.deferred.retain(|id| id != &op_id);
            for conflict in state.conflicts.iter_mut().filter(|c| {
                c.conflict_type == ConflictType::LockContention
                    && c.status == ConflictStatus::Deferred
                    && c.operations.first() == Some(&op_id)
            }) {
                conflict.status = ConflictStatus::Resolved;
                conflict.resolution = Some(Resolution::LockReleased);
                events.push(Self::resolved_event(conflict, &Resolution::LockReleased));
            }

            let Some(op) = state.take_operation(&op_id) else {
                continue;
            };
            match self.apply_locked(state, op, events) {
                Ok(outcome) => {
                    log::info!(
                        "[ConflictManager] Deferred operation {} retried: {:?}",
                        op_id,
                        outcome.status
                    );
                    retried += 1;
                }
                Err(e) => log::warn!("[ConflictManager] Deferred operation {} failed: {}", op_id, e),
            }
        }
        retried
    }

    /// Take a lease on `path`. Fails with `LockContention` naming the holder
    /// if another agent holds an incompatible lock.
    pub fn acquire_lock(
        &self,
        session_id: &str,
        agent_id: &str,
        path: &str,
        lock_type: LockType,
        duration: Option<std::time::Duration>,
    ) -> ConflictResult<String> {
        let path = self.normalize_path(path)?;
        let ttl = duration
            .and_then(|d| Duration::from_std(d).ok())
            .unwrap_or_else(|| Duration::seconds(self.config.default_lock_secs as i64));
        let now = Utc::now();

        let mut state = lock_mutex_recover(&self.state);
        if let Some(holder) = state.locks.find_incompatible(&path, agent_id, lock_type, now) {
            log::info!(
                "[ConflictManager] {} lock on {} refused for {}: held by {}",
                lock_type,
                path,
                agent_id,
                holder.agent_id
            );
            return Err(ConflictError::LockContention {
                path,
                holder_agent: holder.agent_id.clone(),
                lock_type: holder.lock_type,
            });
        }

        let lock = FileLock {
            id: generate_id("lock"),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            path,
            lock_type,
            acquired_at: now,
            expires_at: now + ttl,
        };
        let id = lock.id.clone();
        log::debug!(
            "[ConflictManager] {} acquired {} lock on {}",
            agent_id,
            lock_type,
            lock.path
        );
        state.locks.insert(lock);
        Ok(id)
    }

    pub fn release_lock(&self, lock_id: &str) -> ConflictResult<FileLock> {
        let mut events = Vec::new();
        let lock = {
            let mut state = lock_mutex_recover(&self.state);
            let lock = state
                .locks
                .remove(lock_id)
                .ok_or_else(|| ConflictError::LockNotFound(lock_id.to_string()))?;
            self.retry_deferred(&mut state, Utc::now(), &mut events);
            lock
        };
        self.emit_all(events);
        Ok(lock)
    }

    fn release_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&FileLock) -> bool,
    {
        let mut events = Vec::new();
        let released = {
            let mut state = lock_mutex_recover(&self.state);
            let released = state.locks.remove_where(pred).len();
            if released > 0 {
                self.retry_deferred(&mut state, Utc::now(), &mut events);
            }
            released
        };
        self.emit_all(events);
        released
    }

    pub fn release_agent_locks(&self, session_id: &str, agent_id: &str) -> usize {
        self.release_where(|l| l.session_id == session_id && l.agent_id == agent_id)
    }

    pub fn release_session_locks(&self, session_id: &str) -> usize {
        let released = self.release_where(|l| l.session_id == session_id);
        if released > 0 {
            log::info!(
                "[ConflictManager] Released {} lock(s) held by session {}",
                released,
                session_id
            );
        }
        released
    }

    /// Drop expired leases and retry whatever they were blocking
    pub fn sweep_expired_locks(&self, now: DateTime<Utc>) -> Vec<FileLock> {
        let mut events = Vec::new();
        let expired = {
            let mut state = lock_mutex_recover(&self.state);
            let expired = state.locks.remove_where(|l| l.is_expired(now));
            for lock in &expired {
                events.push(OrchestratorEvent::LockExpired(LockExpiredPayload {
                    lock_id: lock.id.clone(),
                    session_id: lock.session_id.clone(),
                    agent_id: lock.agent_id.clone(),
                    path: lock.path.clone(),
                }));
            }
            if !expired.is_empty() {
                self.retry_deferred(&mut state, now, &mut events);
            }
            expired
        };
        if !expired.is_empty() {
            log::info!("[ConflictManager] Expired {} lock(s)", expired.len());
        }
        self.emit_all(events);
        expired
    }

    pub fn active_locks(&self, path: &str) -> ConflictResult<Vec<FileLock>> {
        let path = self.normalize_path(path)?;
        let state = lock_mutex_recover(&self.state);
        Ok(state.locks.active_on(&path, Utc::now()))
    }

    /// Resolve an open or escalated conflict. Two-party edits are merged
    /// three ways; anything else falls back to last-writer-wins. Lock
    /// contention stays deferred while the holder keeps its lease.
    pub fn resolve_conflict(&self, conflict_id: &str) -> ConflictResult<Resolution> {
        let mut events = Vec::new();
        let resolution = {
            let mut state = lock_mutex_recover(&self.state);
            self.resolve_locked(&mut state, conflict_id, &mut events)?
        };
        self.emit_all(events);
        Ok(resolution)
    }

    fn resolve_locked(
        &self,
        state: &mut ConflictState,
        conflict_id: &str,
        events: &mut Vec<OrchestratorEvent>,
    ) -> ConflictResult<Resolution> {
        let conflict = state
            .conflicts
            .iter()
            .find(|c| c.id == conflict_id)
            .cloned()
            .ok_or_else(|| ConflictError::ConflictNotFound(conflict_id.to_string()))?;

        if conflict.status == ConflictStatus::Resolved {
            if let Some(resolution) = conflict.resolution {
                return Ok(resolution);
            }
        }

        let op_id = conflict
            .operations
            .first()
            .cloned()
            .ok_or_else(|| ConflictError::ConflictNotFound(conflict_id.to_string()))?;

        if conflict.conflict_type == ConflictType::LockContention || conflict.status == ConflictStatus::Deferred {
            let blocker = state
                .operation(&op_id)
                .and_then(|op| state.write_blocker(op, Utc::now()));
            if let Some(holder) = blocker {
                return Ok(Resolution::Deferred {
                    holder_agent: holder.agent_id,
                });
            }
            self.retry_deferred(state, Utc::now(), events);
            if conflict.conflict_type == ConflictType::LockContention {
                return Ok(Resolution::LockReleased);
            }
            let settled = state
                .conflicts
                .iter()
                .any(|c| c.id == conflict_id && c.status != ConflictStatus::Deferred);
            if !settled {
                return conflict
                    .resolution
                    .ok_or_else(|| ConflictError::OperationNotFound(op_id.clone()));
            }
            return self.resolve_locked(state, conflict_id, events);
        }

        let mut op = state
            .take_operation(&op_id)
            .ok_or_else(|| ConflictError::OperationNotFound(op_id.clone()))?;
        let peers: Vec<FileOperation> = conflict.operations[1..]
            .iter()
            .filter_map(|id| state.operation(id).cloned())
            .collect();

        let result = if op.applied || op.superseded {
            Ok(Resolution::LastWriterWins {
                winner_agent: op.agent_id.clone(),
            })
        } else {
            self.resolve_edit(state, &mut op, &peers)
        };
        state.operations.push(op);
        let resolution = result?;

        if let Some(c) = state.conflict_mut(conflict_id) {
            c.status = ConflictStatus::Resolved;
            c.resolution = Some(resolution.clone());
            events.push(Self::resolved_event(c, &resolution));
        }
        log::info!(
            "[ConflictManager] Resolved {} on {} by {}",
            conflict_id,
            conflict.path,
            resolution.as_str()
        );
        Ok(resolution)
    }

    fn resolve_edit(
        &self,
        state: &mut ConflictState,
        op: &mut FileOperation,
        peers: &[FileOperation],
    ) -> ConflictResult<Resolution> {
        let has_content = |kind: OperationKind| matches!(kind, OperationKind::Create | OperationKind::Update);

        if let [peer] = peers {
            if has_content(op.kind) && has_content(peer.kind) {
                return self.apply_merged(state, op, &peer.id);
            }
        }

        // Latest operation wins; the rest are superseded
        let latest_peer = peers.iter().max_by_key(|p| p.timestamp);
        let incoming_wins = latest_peer.map_or(true, |p| op.timestamp >= p.timestamp);

        if incoming_wins {
            self.write_through(op)?;
            for peer in peers.iter().filter(|p| !p.applied) {
                if let Some(p) = state.operation_mut(&peer.id) {
                    p.superseded = true;
                }
            }
            Ok(Resolution::LastWriterWins {
                winner_agent: op.agent_id.clone(),
            })
        } else {
            op.superseded = true;
            let winner = latest_peer.map(|p| p.agent_id.clone()).unwrap_or_default();
            Ok(Resolution::LastWriterWins { winner_agent: winner })
        }
    }

    /// Hand a conflict to the caller; it stays unresolved
    pub fn escalate_conflict(&self, conflict_id: &str, reason: &str) -> ConflictResult<Conflict> {
        let (conflict, event) = {
            let mut state = lock_mutex_recover(&self.state);
            let conflict = state
                .conflict_mut(conflict_id)
                .ok_or_else(|| ConflictError::ConflictNotFound(conflict_id.to_string()))?;
            conflict.status = ConflictStatus::Escalated;
            conflict.escalation_reason = Some(reason.to_string());
            let event = Self::escalated_event(conflict, reason);
            (conflict.clone(), event)
        };
        self.events.emit(event);
        Ok(conflict)
    }

    pub fn get_conflict(&self, conflict_id: &str) -> Option<Conflict> {
        let state = lock_mutex_recover(&self.state);
        state.conflicts.iter().find(|c| c.id == conflict_id).cloned()
    }

    pub fn conflicts(&self, session_id: &str) -> Vec<Conflict> {
        let state = lock_mutex_recover(&self.state);
        state
            .conflicts
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn unresolved_conflicts(&self, session_id: &str) -> Vec<Conflict> {
        self.conflicts(session_id)
            .into_iter()
            .filter(|c| c.is_unresolved())
            .collect()
    }

    pub fn get_operation(&self, operation_id: &str) -> Option<FileOperation> {
        let state = lock_mutex_recover(&self.state);
        state.operation(operation_id).cloned()
    }

    pub fn operations(&self, session_id: &str) -> Vec<FileOperation> {
        let state = lock_mutex_recover(&self.state);
        state
            .operations
            .iter()
            .filter(|op| op.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn deferred_operations(&self) -> Vec<String> {
        let state = lock_mutex_recover(&self.state);
        state.deferred.clone()
    }

    /// Capture every path the session has touched
    pub fn create_snapshot(&self, session_id: &str) -> ConflictResult<String> {
        let mut state = lock_mutex_recover(&self.state);
        let paths: BTreeSet<String> = state
            .operations
            .iter()
            .filter(|op| op.session_id == session_id)
            .flat_map(|op| op.touched_paths().map(|p| p.to_string()).collect::<Vec<_>>())
            .collect();

        let files = snapshots::capture(&self.root, paths.iter().map(|p| p.as_str()))?;
        let snapshot = Snapshot {
            id: generate_id("snapshot"),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
            files,
        };
        let id = snapshot.id.clone();
        log::info!(
            "[ConflictManager] Snapshot {} of session {} ({} file(s))",
            id,
            session_id,
            snapshot.files.len()
        );
        state.snapshots.insert(id.clone(), snapshot);
        Ok(id)
    }

    pub fn restore_from_snapshot(&self, snapshot_id: &str) -> ConflictResult<usize> {
        let state = lock_mutex_recover(&self.state);
        let snapshot = state
            .snapshots
            .get(snapshot_id)
            .ok_or_else(|| ConflictError::SnapshotNotFound(snapshot_id.to_string()))?;
        let restored = snapshots::restore(&self.root, snapshot)?;
        log::info!(
            "[ConflictManager] Restored {} file(s) from snapshot {}",
            restored,
            snapshot_id
        );
        Ok(restored)
    }

    /// Drop all history, locks and snapshots of a finished session
    pub fn forget_session(&self, session_id: &str) {
        let mut state = lock_mutex_recover(&self.state);
        let dropped: Vec<String> = state
            .operations
            .iter()
            .filter(|op| op.session_id == session_id)
            .map(|op| op.id.clone())
            .collect();
        state.operations.retain(|op| op.session_id != session_id);
        state.conflicts.retain(|c| c.session_id != session_id);
        state.deferred.retain(|id| !dropped.contains(id));
        state.snapshots.retain(|_, s| s.session_id != session_id);
        state.locks.remove_where(|l| l.session_id == session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChannelEventSink, NullEventSink};
    use std::fs;
    use tempfile::TempDir;

    fn manager(root: &Path) -> ConflictManager {
        ConflictManager::new(root, ConflictConfig::default(), Arc::new(NullEventSink))
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_apply_without_conflict_writes_file() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());

        let outcome = mgr
            .apply_operation(FileOperationRequest::create("s1", "a", "src/new.rs", "fn x() {}\n"))
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::Applied);
        assert_eq!(
            fs::read_to_string(tmp.path().join("src/new.rs")).unwrap(),
            "fn x() {}\n"
        );

        let op = mgr.get_operation(&outcome.operation_id).unwrap();
        assert!(op.applied);
        assert_eq!(op.checksum.as_deref(), Some(checksum("fn x() {}\n").as_str()));
    }

    #[test]
    fn test_rejects_paths_outside_root() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        assert!(matches!(
            mgr.apply_operation(FileOperationRequest::create("s1", "a", "../etc/passwd", "x")),
            Err(ConflictError::InvalidPath(_))
        ));
        assert!(mgr.normalize_path("/etc/passwd").is_err());
        assert_eq!(mgr.normalize_path("./src/../src/lib.rs").unwrap(), "src/lib.rs");
        let absolute = tmp.path().join("src/lib.rs");
        assert_eq!(
            mgr.normalize_path(absolute.to_str().unwrap()).unwrap(),
            "src/lib.rs"
        );
    }

    #[test]
    fn test_second_exclusive_lock_names_holder() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());

        mgr.acquire_lock("s1", "agent-a", "src/app.ts", LockType::Exclusive, None)
            .unwrap();
        let err = mgr
            .acquire_lock("s1", "agent-b", "src/app.ts", LockType::Exclusive, None)
            .unwrap_err();
        match err {
            ConflictError::LockContention { holder_agent, path, .. } => {
                assert_eq!(holder_agent, "agent-a");
                assert_eq!(path, "src/app.ts");
            }
            other => panic!("unexpected error: {}", other),
        }

        let shared = mgr
            .acquire_lock("s1", "agent-c", "src/app.ts", LockType::Shared, None)
            .unwrap_err();
        assert!(shared.to_string().contains("agent-a"));
    }

    #[test]
    fn test_concurrent_exclusive_acquisition_has_one_winner() {
        let tmp = TempDir::new().unwrap();
        let mgr = Arc::new(manager(tmp.path()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mgr = Arc::clone(&mgr);
                std::thread::spawn(move || {
                    mgr.acquire_lock("s1", &format!("agent-{}", i), "src/app.ts", LockType::Exclusive, None)
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_sensitive_concurrent_edit_is_high_and_merged() {
        let tmp = TempDir::new().unwrap();
        let base = "{\n  \"name\": \"app\",\n  \"port\": 3000,\n  \"debug\": false\n}\n";
        fs::write(tmp.path().join("config.json"), base).unwrap();
        let mgr = manager(tmp.path());

        let first = mgr
            .apply_operation(FileOperationRequest::update(
                "s1",
                "a",
                "config.json",
                &base.replace("3000", "8080"),
            ))
            .unwrap();
        assert_eq!(first.status, ApplyStatus::Applied);

        let second = mgr
            .apply_operation(FileOperationRequest::update(
                "s1",
                "b",
                "config.json",
                &base.replace("false", "true"),
            ))
            .unwrap();
        assert_eq!(second.status, ApplyStatus::Merged);

        let conflict = mgr.get_conflict(&second.conflicts[0]).unwrap();
        assert_eq!(conflict.severity, ConflictSeverity::High);
        assert_eq!(conflict.conflict_type, ConflictType::ConcurrentEdit);
        assert_eq!(conflict.agents, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(conflict.status, ConflictStatus::Resolved);

        let merged = fs::read_to_string(tmp.path().join("config.json")).unwrap();
        assert!(merged.contains("8080"));
        assert!(merged.contains("\"debug\": true"));
    }

    #[test]
    fn test_delete_conflict_is_critical_and_escalated() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("lib.rs"), "one\n").unwrap();
        let mgr = manager(tmp.path());

        mgr.apply_operation(FileOperationRequest::update("s1", "a", "lib.rs", "two\n"))
            .unwrap();
        let outcome = mgr
            .apply_operation(FileOperationRequest::delete("s1", "b", "lib.rs"))
            .unwrap();

        assert_eq!(outcome.status, ApplyStatus::Escalated);
        let conflict = mgr.get_conflict(&outcome.conflicts[0]).unwrap();
        assert_eq!(conflict.severity, ConflictSeverity::Critical);
        assert!(!conflict.auto_resolvable);
        assert!(tmp.path().join("lib.rs").exists());
        assert_eq!(mgr.unresolved_conflicts("s1").len(), 1);

        // Manual resolution: the later delete wins
        let resolution = mgr.resolve_conflict(&conflict.id).unwrap();
        assert_eq!(
            resolution,
            Resolution::LastWriterWins {
                winner_agent: "b".to_string()
            }
        );
        assert!(!tmp.path().join("lib.rs").exists());
        assert!(mgr.unresolved_conflicts("s1").is_empty());
    }

    #[test]
    fn test_three_agents_is_medium_and_not_auto_resolvable() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.apply_operation(FileOperationRequest::create("s1", "a", "notes.md", "a\n"))
            .unwrap();
        let second = mgr
            .apply_operation(FileOperationRequest::update("s1", "b", "notes.md", "b\n"))
            .unwrap();
        assert_eq!(second.status, ApplyStatus::Merged);

        let third = mgr
            .apply_operation(FileOperationRequest::update("s1", "c", "notes.md", "c\n"))
            .unwrap();
        assert_eq!(third.status, ApplyStatus::Escalated);
        let conflict = mgr.get_conflict(&third.conflicts[0]).unwrap();
        assert_eq!(conflict.severity, ConflictSeverity::Medium);
        assert_eq!(conflict.agents.len(), 3);
    }

    #[test]
    fn test_other_sessions_do_not_conflict() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.apply_operation(FileOperationRequest::create("s1", "a", "x.txt", "1\n"))
            .unwrap();
        let outcome = mgr
            .apply_operation(FileOperationRequest::update("s2", "b", "x.txt", "2\n"))
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::Applied);
    }

    #[test]
    fn test_lock_contention_defers_until_release() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());

        let lock_id = mgr
            .acquire_lock("s1", "holder", "src/app.ts", LockType::Exclusive, None)
            .unwrap();
        let outcome = mgr
            .apply_operation(FileOperationRequest::create("s1", "writer", "src/app.ts", "x\n"))
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::Deferred);
        assert!(!tmp.path().join("src/app.ts").exists());
        assert_eq!(mgr.deferred_operations(), vec![outcome.operation_id.clone()]);

        let conflict = mgr.get_conflict(&outcome.conflicts[0]).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::LockContention);
        assert_eq!(
            mgr.resolve_conflict(&conflict.id).unwrap(),
            Resolution::Deferred {
                holder_agent: "holder".to_string()
            }
        );

        mgr.release_lock(&lock_id).unwrap();
        assert!(mgr.deferred_operations().is_empty());
        assert_eq!(
            fs::read_to_string(tmp.path().join("src/app.ts")).unwrap(),
            "x\n"
        );
        assert_eq!(
            mgr.get_conflict(&conflict.id).unwrap().resolution,
            Some(Resolution::LockReleased)
        );
    }

    #[test]
    fn test_concurrent_edit_behind_lock_is_deferred_with_it() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        fs::write(tmp.path().join("notes.txt"), "one\ntwo\nthree\n").unwrap();

        mgr.apply_operation(FileOperationRequest::update("s1", "a", "notes.txt", "ONE\ntwo\nthree\n"))
            .unwrap();
        let lock_id = mgr
            .acquire_lock("s1", "holder", "notes.txt", LockType::Exclusive, None)
            .unwrap();
        let outcome = mgr
            .apply_operation(FileOperationRequest::update("s1", "b", "notes.txt", "one\ntwo\nTHREE\n"))
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::Deferred);
        assert_eq!(outcome.conflicts.len(), 2);

        let unresolved = mgr.unresolved_conflicts("s1");
        let edit = unresolved
            .iter()
            .find(|c| c.conflict_type == ConflictType::ConcurrentEdit)
            .cloned()
            .unwrap();
        assert!(unresolved
            .iter()
            .any(|c| c.conflict_type == ConflictType::LockContention));
        assert_eq!(edit.status, ConflictStatus::Deferred);
        assert_eq!(edit.agents, vec!["b".to_string(), "a".to_string()]);
        assert_eq!(
            mgr.resolve_conflict(&edit.id).unwrap(),
            Resolution::Deferred {
                holder_agent: "holder".to_string()
            }
        );

        mgr.release_lock(&lock_id).unwrap();
        let settled = mgr.get_conflict(&edit.id).unwrap();
        assert_eq!(settled.status, ConflictStatus::Resolved);
        assert_eq!(
            fs::read_to_string(tmp.path().join("notes.txt")).unwrap(),
            "ONE\ntwo\nTHREE\n"
        );
        assert_eq!(
            mgr.conflicts("s1")
                .iter()
                .filter(|c| c.conflict_type == ConflictType::ConcurrentEdit)
                .count(),
            1
        );
    }

    #[test]
    fn test_expiry_sweep_releases_and_retries() {
        let tmp = TempDir::new().unwrap();
        let (sink, mut rx) = ChannelEventSink::channel();
        let mgr = ConflictManager::new(tmp.path(), ConflictConfig::default(), Arc::new(sink));

        mgr.acquire_lock(
            "s1",
            "holder",
            "a.txt",
            LockType::Shared,
            Some(std::time::Duration::from_secs(5)),
        )
        .unwrap();
        let outcome = mgr
            .apply_operation(FileOperationRequest::create("s1", "writer", "a.txt", "hi"))
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::Deferred);

        assert!(mgr.sweep_expired_locks(Utc::now()).is_empty());
        let expired = mgr.sweep_expired_locks(Utc::now() + Duration::seconds(6));
        assert_eq!(expired.len(), 1);
        assert!(tmp.path().join("a.txt").exists());

        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        assert!(names.contains(&crate::events::EVENT_LOCK_EXPIRED));
        assert!(names.contains(&crate::events::EVENT_CONFLICT_RESOLVED));
    }

    #[test]
    fn test_intent_lock_does_not_block_writes() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.acquire_lock("s1", "planner", "a.txt", LockType::Intent, None)
            .unwrap();
        let outcome = mgr
            .apply_operation(FileOperationRequest::create("s1", "writer", "a.txt", "hi"))
            .unwrap();
        assert_eq!(outcome.status, ApplyStatus::Applied);
    }

    #[test]
    fn test_release_session_locks() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.acquire_lock("s1", "a", "x", LockType::Exclusive, None).unwrap();
        mgr.acquire_lock("s1", "b", "y", LockType::Shared, None).unwrap();
        mgr.acquire_lock("s2", "c", "z", LockType::Shared, None).unwrap();

        assert_eq!(mgr.release_session_locks("s1"), 2);
        assert!(mgr.active_locks("x").unwrap().is_empty());
        assert_eq!(mgr.active_locks("z").unwrap().len(), 1);
    }

    #[test]
    fn test_move_and_copy() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("a.txt"), "content").unwrap();
        let mgr = manager(tmp.path());

        mgr.apply_operation(FileOperationRequest::copy_to("s1", "a", "a.txt", "b/b.txt"))
            .unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("b/b.txt")).unwrap(), "content");

        mgr.apply_operation(FileOperationRequest::move_to("s1", "a", "a.txt", "c.txt"))
            .unwrap();
        assert!(!tmp.path().join("a.txt").exists());
        assert!(tmp.path().join("c.txt").exists());

        assert!(matches!(
            mgr.apply_operation(FileOperationRequest {
                target_path: None,
                ..FileOperationRequest::move_to("s1", "a", "c.txt", "d.txt")
            }),
            Err(ConflictError::MissingTarget { .. })
        ));
    }

    #[test]
    fn test_snapshot_restore() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.apply_operation(FileOperationRequest::create("s1", "a", "one.txt", "v1"))
            .unwrap();
        let snapshot = mgr.create_snapshot("s1").unwrap();

        mgr.apply_operation(FileOperationRequest::update("s1", "a", "one.txt", "v2"))
            .unwrap();
        assert_eq!(fs::read_to_string(tmp.path().join("one.txt")).unwrap(), "v2");

        assert_eq!(mgr.restore_from_snapshot(&snapshot).unwrap(), 1);
        assert_eq!(fs::read_to_string(tmp.path().join("one.txt")).unwrap(), "v1");
        assert!(matches!(
            mgr.restore_from_snapshot("missing"),
            Err(ConflictError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn test_forget_session() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(tmp.path());
        mgr.apply_operation(FileOperationRequest::create("s1", "a", "f", "1")).unwrap();
        mgr.acquire_lock("s1", "a", "f", LockType::Exclusive, None).unwrap();
        mgr.forget_session("s1");
        assert!(mgr.operations("s1").is_empty());
        assert!(mgr.active_locks("f").unwrap().is_empty());
    }
}
