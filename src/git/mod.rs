//! Git operations using git2-rs
//!
//! This module provides git functionality organized into focused submodules:
//! - `manager` - Core GitManager struct
//! - `branches` - Branch operations (fork, delete, checkout)
//! - `worktrees` - Worktree management (add, remove, list)
//! - `commits` - Stage-all and commit
//! - `merge` - Merge with conflict abort
//! - `types` - Shared data structures
//!
//! `Vcs` is the narrow interface the workspace manager depends on; `GitVcs`
//! implements it over a repository path.

mod branches;
mod commits;
mod manager;
mod merge;
#[cfg(test)]
pub(crate) mod tests;
mod types;
mod worktrees;

pub use manager::GitManager;
pub use types::{CommitInfo, MergeResult, VcsError, WorktreeInfo};

use crate::utils::lock_mutex_recover;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Version-control operations used for workspace isolation.
/// Calls are synchronous and fail loudly.
pub trait Vcs: Send + Sync {
    /// Branch agents fork from and merge into
    fn default_branch(&self) -> Result<String, VcsError>;
    fn fork_branch(&self, base: &str, name: &str) -> Result<(), VcsError>;
    fn create_worktree(&self, path: &Path, branch: &str) -> Result<(), VcsError>;
    /// Commit every change in a workspace; None when there was nothing to commit
    fn commit_all(&self, workspace: &Path, message: &str) -> Result<Option<String>, VcsError>;
    /// Merge `branch` into `into` in the base checkout
    fn merge_branch(&self, branch: &str, into: &str) -> Result<MergeResult, VcsError>;
    fn delete_branch(&self, branch: &str) -> Result<(), VcsError>;
    fn remove_worktree(&self, path: &Path) -> Result<(), VcsError>;
    fn branch_exists(&self, branch: &str) -> bool;
}

/// `Vcs` backed by a git repository on disk
pub struct GitVcs {
    repo_path: PathBuf,
    author_name: String,
    author_email: String,
    /// Serializes operations that touch the base checkout or its refs
    base_lock: Mutex<()>,
}

impl GitVcs {
    pub fn new(repo_path: &Path, author_name: &str, author_email: &str) -> Self {
        Self {
            repo_path: repo_path.to_path_buf(),
            author_name: author_name.to_string(),
            author_email: author_email.to_string(),
            base_lock: Mutex::new(()),
        }
    }

    fn open(&self) -> Result<GitManager, VcsError> {
        Ok(GitManager::new(&self.repo_path)?)
    }
}

impl Vcs for GitVcs {
    fn default_branch(&self) -> Result<String, VcsError> {
        Ok(self.open()?.get_default_branch_name())
    }

    fn fork_branch(&self, base: &str, name: &str) -> Result<(), VcsError> {
        let _guard = lock_mutex_recover(&self.base_lock);
        self.open()?.fork_branch(base, name)?;
        Ok(())
    }

    fn create_worktree(&self, path: &Path, branch: &str) -> Result<(), VcsError> {
        let _guard = lock_mutex_recover(&self.base_lock);
        if path.exists() {
            return Err(VcsError::Other(format!(
                "Worktree path already exists: {}",
                path.display()
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.open()?.create_worktree(branch, path)?;
        Ok(())
    }

    fn commit_all(&self, workspace: &Path, message: &str) -> Result<Option<String>, VcsError> {
        let manager = GitManager::new(workspace)?;
        let commit = manager.commit_all(message, &self.author_name, &self.author_email)?;
        Ok(commit.map(|c| c.id))
    }

    fn merge_branch(&self, branch: &str, into: &str) -> Result<MergeResult, VcsError> {
        let _guard = lock_mutex_recover(&self.base_lock);
        let result =
            self.open()?
                .merge_branch(branch, into, &self.author_name, &self.author_email)?;
        Ok(result)
    }

    fn delete_branch(&self, branch: &str) -> Result<(), VcsError> {
        let _guard = lock_mutex_recover(&self.base_lock);
        self.open()?.delete_branch(branch)?;
        Ok(())
    }

    fn remove_worktree(&self, path: &Path) -> Result<(), VcsError> {
        let _guard = lock_mutex_recover(&self.base_lock);
        let manager = self.open()?;
        match manager.remove_worktree(path) {
            Ok(()) => {}
            // Directory already gone: clear the stale administrative entry instead
            Err(_) if !path.exists() => {
                manager.prune_orphaned_worktrees()?;
            }
            Err(e) => return Err(e.into()),
        }
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
        Ok(())
    }

    fn branch_exists(&self, branch: &str) -> bool {
        self.open()
            .map(|manager| manager.branch_exists(branch))
            .unwrap_or(false)
    }
}
