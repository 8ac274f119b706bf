//! Conflict classification policy

use super::{ConflictSeverity, ConflictType, FileOperation, OperationKind};
use chrono::Duration;

/// Sensitive entries match either the full relative path or the file name
pub fn is_sensitive(path: &str, sensitive_paths: &[String]) -> bool {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    sensitive_paths
        .iter()
        .any(|entry| entry == path || entry == file_name)
}

/// Other agents' operations in the same session touching the same path
/// within `window` of `op`
pub fn concurrent_candidates<'a, I>(history: I, op: &FileOperation, window: Duration) -> Vec<&'a FileOperation>
where
    I: IntoIterator<Item = &'a FileOperation>,
{
    let mut peers: Vec<&FileOperation> = history
        .into_iter()
        .filter(|other| other.id != op.id)
        .filter(|other| other.session_id == op.session_id && other.agent_id != op.agent_id)
        .filter(|other| !other.superseded)
        .filter(|other| op.touched_paths().any(|p| other.touches(p)))
        .filter(|other| (op.timestamp - other.timestamp).abs() <= window)
        .collect();
    peers.sort_by_key(|other| other.timestamp);
    peers
}

/// Delete beats sensitive path beats fan-out
pub fn classify_severity(
    op: &FileOperation,
    peers: &[&FileOperation],
    sensitive: bool,
) -> ConflictSeverity {
    let involves_delete = op.kind == OperationKind::Delete
        || peers.iter().any(|p| p.kind == OperationKind::Delete);

    if involves_delete {
        ConflictSeverity::Critical
    } else if sensitive {
        ConflictSeverity::High
    } else if peers.len() + 1 >= 3 {
        ConflictSeverity::Medium
    } else {
        ConflictSeverity::Low
    }
}

/// Only a two-party edit where the incoming operation is an update can be
/// merged without a human
pub fn is_auto_resolvable(
    conflict_type: ConflictType,
    op: &FileOperation,
    peers: &[&FileOperation],
) -> bool {
    if conflict_type != ConflictType::ConcurrentEdit {
        return false;
    }
    match peers {
        [peer] => {
            op.kind == OperationKind::Update
                && matches!(peer.kind, OperationKind::Update | OperationKind::Create)
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn op(id: &str, agent: &str, kind: OperationKind, path: &str, secs_ago: i64) -> FileOperation {
        FileOperation {
            id: id.to_string(),
            session_id: "s1".to_string(),
            agent_id: agent.to_string(),
            kind,
            path: path.to_string(),
            target_path: None,
            content: Some("x".to_string()),
            checksum: None,
            base_content: None,
            timestamp: Utc::now() - Duration::seconds(secs_ago),
            applied: true,
            superseded: false,
        }
    }

    #[test]
    fn test_sensitive_matching() {
        let list = vec!["config.json".to_string(), "deploy/values.yaml".to_string()];
        assert!(is_sensitive("config.json", &list));
        assert!(is_sensitive("packages/web/config.json", &list));
        assert!(is_sensitive("deploy/values.yaml", &list));
        assert!(!is_sensitive("values.yaml", &list));
        assert!(!is_sensitive("src/config.rs", &list));
    }

    #[test]
    fn test_candidates_respect_window_agent_and_path() {
        let incoming = op("new", "a", OperationKind::Update, "src/lib.rs", 0);
        let history = vec![
            op("1", "b", OperationKind::Update, "src/lib.rs", 5),
            op("2", "a", OperationKind::Update, "src/lib.rs", 5),
            op("3", "b", OperationKind::Update, "src/main.rs", 5),
            op("4", "c", OperationKind::Update, "src/lib.rs", 120),
        ];
        let peers = concurrent_candidates(&history, &incoming, Duration::seconds(30));
        let ids: Vec<&str> = peers.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[test]
    fn test_move_target_counts_as_touch() {
        let mut moved = op("1", "b", OperationKind::Move, "old.rs", 1);
        moved.target_path = Some("src/lib.rs".to_string());
        let incoming = op("new", "a", OperationKind::Update, "src/lib.rs", 0);
        let history = [moved];
        assert_eq!(
            concurrent_candidates(&history, &incoming, Duration::seconds(30)).len(),
            1
        );
    }

    #[test]
    fn test_severity_policy() {
        let update = op("x", "a", OperationKind::Update, "src/lib.rs", 0);
        let delete = op("d", "b", OperationKind::Delete, "src/lib.rs", 0);
        let peer1 = op("p1", "b", OperationKind::Update, "src/lib.rs", 0);
        let peer2 = op("p2", "c", OperationKind::Update, "src/lib.rs", 0);

        assert_eq!(classify_severity(&update, &[&delete], true), ConflictSeverity::Critical);
        assert_eq!(classify_severity(&update, &[&peer1], true), ConflictSeverity::High);
        assert_eq!(
            classify_severity(&update, &[&peer1, &peer2], false),
            ConflictSeverity::Medium
        );
        assert_eq!(classify_severity(&update, &[&peer1], false), ConflictSeverity::Low);
    }

    #[test]
    fn test_auto_resolvable_policy() {
        let update = op("x", "a", OperationKind::Update, "f", 0);
        let create = op("x", "a", OperationKind::Create, "f", 0);
        let peer = op("p1", "b", OperationKind::Update, "f", 0);
        let peer2 = op("p2", "c", OperationKind::Update, "f", 0);
        let deleting_peer = op("p3", "b", OperationKind::Delete, "f", 0);

        assert!(is_auto_resolvable(ConflictType::ConcurrentEdit, &update, &[&peer]));
        assert!(!is_auto_resolvable(ConflictType::ConcurrentEdit, &create, &[&peer]));
        assert!(!is_auto_resolvable(ConflictType::ConcurrentEdit, &update, &[&peer, &peer2]));
        assert!(!is_auto_resolvable(ConflictType::ConcurrentEdit, &update, &[&deleting_peer]));
        assert!(!is_auto_resolvable(ConflictType::LockContention, &update, &[]));
    }
}
