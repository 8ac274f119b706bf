// Utility functions

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Get the .orchestrator directory path for a project.
#[inline]
pub fn orchestrator_dir(project_path: &Path) -> PathBuf {
    project_path.join(".orchestrator")
}

/// Resolve a config-relative path against the project root; absolute paths pass through.
pub fn resolve_project_path(project_path: &Path, configured: &str) -> PathBuf {
    let candidate = Path::new(configured);
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        project_path.join(candidate)
    }
}

/// Safely acquire a mutex lock, recovering from poisoning by returning the guard.
/// Registries are only mutated through short check-and-set sections, so the
/// inner state stays usable after a panicking holder.
pub fn lock_mutex_recover<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::warn!("Mutex was poisoned, recovering: {}", poisoned);
            poisoned.into_inner()
        }
    }
}

/// Generate a prefixed unique identifier, e.g. `task-1f0c...`
pub fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_generate_id() {
        let id1 = generate_id("task");
        let id2 = generate_id("task");
        assert_ne!(id1, id2);
        assert!(id1.starts_with("task-"));
    }

    #[test]
    fn test_orchestrator_dir() {
        let dir = orchestrator_dir(Path::new("/home/user/project"));
        assert_eq!(dir, PathBuf::from("/home/user/project/.orchestrator"));
    }

    #[test]
    fn test_resolve_project_path() {
        let root = Path::new("/repo");
        assert_eq!(
            resolve_project_path(root, ".orchestrator/worktrees"),
            PathBuf::from("/repo/.orchestrator/worktrees")
        );
        assert_eq!(
            resolve_project_path(root, "/tmp/worktrees"),
            PathBuf::from("/tmp/worktrees")
        );
    }

    #[test]
    fn test_lock_mutex_recover_after_poison() {
        let mutex = Arc::new(Mutex::new(1));
        let clone = Arc::clone(&mutex);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        let guard = lock_mutex_recover(&mutex);
        assert_eq!(*guard, 1);
    }
}
