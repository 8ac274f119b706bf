//! Lease-based file locks

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Exclusive,
    Shared,
    /// Advisory; never blocks anyone
    Intent,
}

impl LockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockType::Exclusive => "exclusive",
            LockType::Shared => "shared",
            LockType::Intent => "intent",
        }
    }

    /// Whether a lock of this type stops another agent from writing the path
    pub fn blocks_writes(&self) -> bool {
        !matches!(self, LockType::Intent)
    }
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileLock {
    pub id: String,
    pub session_id: String,
    pub agent_id: String,
    pub path: String,
    pub lock_type: LockType,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FileLock {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Whether `requested` by `agent_id` can coexist with `held`
pub fn is_compatible(held: &FileLock, agent_id: &str, requested: LockType) -> bool {
    if held.agent_id == agent_id {
        return true;
    }
    match (held.lock_type, requested) {
        (LockType::Intent, _) | (_, LockType::Intent) => true,
        (LockType::Shared, LockType::Shared) => true,
        _ => false,
    }
}

/// All leases by id. Callers hold the manager's state lock, which makes
/// check-then-insert atomic.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: HashMap<String, FileLock>,
}

impl LockTable {
    /// First unexpired lock on `path` that conflicts with the request
    pub fn find_incompatible(
        &self,
        path: &str,
        agent_id: &str,
        requested: LockType,
        now: DateTime<Utc>,
    ) -> Option<&FileLock> {
        let mut held: Vec<&FileLock> = self
            .locks
            .values()
            .filter(|l| l.path == path && !l.is_expired(now))
            .filter(|l| !is_compatible(l, agent_id, requested))
            .collect();
        held.sort_by_key(|l| l.acquired_at);
        held.into_iter().next()
    }

    /// Unexpired lock on `path` held by another agent that blocks writes
    pub fn write_blocker(&self, path: &str, agent_id: &str, now: DateTime<Utc>) -> Option<&FileLock> {
        let mut held: Vec<&FileLock> = self
            .locks
            .values()
            .filter(|l| l.path == path && l.agent_id != agent_id && !l.is_expired(now))
            .filter(|l| l.lock_type.blocks_writes())
            .collect();
        held.sort_by_key(|l| l.acquired_at);
        held.into_iter().next()
    }

    pub fn insert(&mut self, lock: FileLock) {
        self.locks.insert(lock.id.clone(), lock);
    }

    pub fn remove(&mut self, lock_id: &str) -> Option<FileLock> {
        self.locks.remove(lock_id)
    }

    pub fn get(&self, lock_id: &str) -> Option<&FileLock> {
        self.locks.get(lock_id)
    }

    /// Remove every lock matching `pred`
    pub fn remove_where<F>(&mut self, pred: F) -> Vec<FileLock>
    where
        F: Fn(&FileLock) -> bool,
    {
        let ids: Vec<String> = self
            .locks
            .values()
            .filter(|l| pred(l))
            .map(|l| l.id.clone())
            .collect();
        ids.iter().filter_map(|id| self.locks.remove(id)).collect()
    }

    pub fn active_on(&self, path: &str, now: DateTime<Utc>) -> Vec<FileLock> {
        let mut locks: Vec<FileLock> = self
            .locks
            .values()
            .filter(|l| l.path == path && !l.is_expired(now))
            .cloned()
            .collect();
        locks.sort_by_key(|l| l.acquired_at);
        locks
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lock(id: &str, agent: &str, lock_type: LockType, ttl_secs: i64) -> FileLock {
        let now = Utc::now();
        FileLock {
            id: id.to_string(),
            session_id: "s1".to_string(),
            agent_id: agent.to_string(),
            path: "src/app.ts".to_string(),
            lock_type,
            acquired_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[test]
    fn test_compatibility_matrix() {
        let exclusive = lock("l1", "a", LockType::Exclusive, 60);
        let shared = lock("l2", "a", LockType::Shared, 60);
        let intent = lock("l3", "a", LockType::Intent, 60);

        // Same agent is always compatible
        assert!(is_compatible(&exclusive, "a", LockType::Exclusive));

        assert!(!is_compatible(&exclusive, "b", LockType::Shared));
        assert!(!is_compatible(&exclusive, "b", LockType::Exclusive));
        assert!(is_compatible(&exclusive, "b", LockType::Intent));

        assert!(is_compatible(&shared, "b", LockType::Shared));
        assert!(!is_compatible(&shared, "b", LockType::Exclusive));

        assert!(is_compatible(&intent, "b", LockType::Exclusive));
    }

    #[test]
    fn test_expired_locks_do_not_block() {
        let mut table = LockTable::default();
        table.insert(lock("l1", "a", LockType::Exclusive, -1));
        assert!(table
            .find_incompatible("src/app.ts", "b", LockType::Exclusive, Utc::now())
            .is_none());
        assert!(table.write_blocker("src/app.ts", "b", Utc::now()).is_none());
    }

    #[test]
    fn test_intent_never_blocks_writes() {
        let mut table = LockTable::default();
        table.insert(lock("l1", "a", LockType::Intent, 60));
        assert!(table.write_blocker("src/app.ts", "b", Utc::now()).is_none());

        table.insert(lock("l2", "a", LockType::Shared, 60));
        assert_eq!(
            table.write_blocker("src/app.ts", "b", Utc::now()).map(|l| l.id.as_str()),
            Some("l2")
        );
    }

    #[test]
    fn test_remove_where() {
        let mut table = LockTable::default();
        table.insert(lock("l1", "a", LockType::Shared, 60));
        table.insert(lock("l2", "b", LockType::Shared, 60));
        let removed = table.remove_where(|l| l.agent_id == "a");
        assert_eq!(removed.len(), 1);
        assert_eq!(table.len(), 1);
        assert!(table.get("l2").is_some());
    }
}
