// Event types and payload structures for orchestration progress
// Components receive an EventSink at construction and emit fire-and-forget notifications

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// Event name constants
pub const EVENT_TASK_STATUS_CHANGED: &str = "task:status_changed";
pub const EVENT_SESSION_STATUS_CHANGED: &str = "session:status_changed";
pub const EVENT_WORKSPACE_STATUS_CHANGED: &str = "workspace:status_changed";
pub const EVENT_MERGE_ATTEMPTED: &str = "merge:attempted";

// Conflict manager events
pub const EVENT_CONFLICT_DETECTED: &str = "conflict:detected";
pub const EVENT_CONFLICT_RESOLVED: &str = "conflict:resolved";
pub const EVENT_CONFLICT_ESCALATED: &str = "conflict:escalated";
pub const EVENT_LOCK_EXPIRED: &str = "lock:expired";

// Strategy engine events
pub const EVENT_STRATEGY_CHANGED: &str = "strategy:changed";
pub const EVENT_STRATEGY_FAILED: &str = "strategy:failed";
pub const EVENT_RECOVERY_ESCALATED: &str = "recovery:escalated";
pub const EVENT_CONSENSUS_DECIDED: &str = "consensus:decided";

/// Payload for task status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatusChangedPayload {
    pub task_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub old_status: String,
    pub new_status: String,
    pub error: Option<String>,
}

/// Payload for session status change events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusChangedPayload {
    pub session_id: String,
    pub old_status: String,
    pub new_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatusChangedPayload {
    pub session_id: String,
    pub agent_id: String,
    pub workspace_id: String,
    pub old_status: String,
    pub new_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeAttemptedPayload {
    pub session_id: String,
    pub agent_id: String,
    pub branch: String,
    pub success: bool,
    pub conflict_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetectedPayload {
    pub conflict_id: String,
    pub session_id: String,
    pub path: String,
    pub conflict_type: String,
    pub severity: String,
    pub agents: Vec<String>,
    pub auto_resolvable: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolvedPayload {
    pub conflict_id: String,
    pub session_id: String,
    pub path: String,
    /// "three_way_merge", "last_writer_wins" or "deferred"
    pub resolution: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictEscalatedPayload {
    pub conflict_id: String,
    pub session_id: String,
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockExpiredPayload {
    pub lock_id: String,
    pub session_id: String,
    pub agent_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyChangedPayload {
    pub session_id: String,
    pub from: String,
    pub to: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyFailedPayload {
    pub session_id: String,
    pub strategy: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryEscalatedPayload {
    pub session_id: String,
    pub failure_ratio: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusDecidedPayload {
    pub session_id: String,
    pub task_id: String,
    pub approvals: usize,
    pub rejections: usize,
    pub respondents: usize,
    pub approved: bool,
}

/// All notifications emitted by the orchestrator core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    TaskStatusChanged(TaskStatusChangedPayload),
    SessionStatusChanged(SessionStatusChangedPayload),
    WorkspaceStatusChanged(WorkspaceStatusChangedPayload),
    MergeAttempted(MergeAttemptedPayload),
    ConflictDetected(ConflictDetectedPayload),
    ConflictResolved(ConflictResolvedPayload),
    ConflictEscalated(ConflictEscalatedPayload),
    LockExpired(LockExpiredPayload),
    StrategyChanged(StrategyChangedPayload),
    StrategyFailed(StrategyFailedPayload),
    RecoveryEscalated(RecoveryEscalatedPayload),
    ConsensusDecided(ConsensusDecidedPayload),
}

impl OrchestratorEvent {
    /// Event name, as used by external listeners
    pub fn name(&self) -> &'static str {
        match self {
            OrchestratorEvent::TaskStatusChanged(_) => EVENT_TASK_STATUS_CHANGED,
            OrchestratorEvent::SessionStatusChanged(_) => EVENT_SESSION_STATUS_CHANGED,
            OrchestratorEvent::WorkspaceStatusChanged(_) => EVENT_WORKSPACE_STATUS_CHANGED,
            OrchestratorEvent::MergeAttempted(_) => EVENT_MERGE_ATTEMPTED,
            OrchestratorEvent::ConflictDetected(_) => EVENT_CONFLICT_DETECTED,
            OrchestratorEvent::ConflictResolved(_) => EVENT_CONFLICT_RESOLVED,
            OrchestratorEvent::ConflictEscalated(_) => EVENT_CONFLICT_ESCALATED,
            OrchestratorEvent::LockExpired(_) => EVENT_LOCK_EXPIRED,
            OrchestratorEvent::StrategyChanged(_) => EVENT_STRATEGY_CHANGED,
            OrchestratorEvent::StrategyFailed(_) => EVENT_STRATEGY_FAILED,
            OrchestratorEvent::RecoveryEscalated(_) => EVENT_RECOVERY_ESCALATED,
            OrchestratorEvent::ConsensusDecided(_) => EVENT_CONSENSUS_DECIDED,
        }
    }
}

/// Observer for orchestrator notifications
pub trait EventSink: Send + Sync {
    fn emit(&self, event: OrchestratorEvent);
}

/// Forwards events into an unbounded channel
pub struct ChannelEventSink {
    sender: mpsc::UnboundedSender<OrchestratorEvent>,
}

impl ChannelEventSink {
    pub fn new(sender: mpsc::UnboundedSender<OrchestratorEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OrchestratorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        // Receiver may be gone during shutdown; notifications are best-effort
        if self.sender.send(event).is_err() {
            log::debug!("[Events] Receiver dropped, event discarded");
        }
    }
}

/// Logs events at debug level and otherwise discards them
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, event: OrchestratorEvent) {
        log::debug!("[Events] {}", event.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_event() -> OrchestratorEvent {
        OrchestratorEvent::TaskStatusChanged(TaskStatusChangedPayload {
            task_id: "task-1".to_string(),
            session_id: "sess-1".to_string(),
            agent_id: "agent-1".to_string(),
            old_status: "pending".to_string(),
            new_status: "in_progress".to_string(),
            error: None,
        })
    }

    #[test]
    fn test_event_name() {
        assert_eq!(task_event().name(), EVENT_TASK_STATUS_CHANGED);
    }

    #[test]
    fn test_event_serializes_camel_case_payload() {
        let json = serde_json::to_value(task_event()).unwrap();
        assert_eq!(json["event"], "task_status_changed");
        assert_eq!(json["payload"]["taskId"], "task-1");
        assert_eq!(json["payload"]["newStatus"], "in_progress");
    }

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelEventSink::channel();
        sink.emit(task_event());

        let received = rx.try_recv().unwrap();
        assert_eq!(received.name(), EVENT_TASK_STATUS_CHANGED);
    }

    #[test]
    fn test_channel_sink_tolerates_dropped_receiver() {
        let (sink, rx) = ChannelEventSink::channel();
        drop(rx);
        sink.emit(task_event());
    }
}
