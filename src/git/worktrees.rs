//! Worktree management for GitManager
//!
//! Contains methods for creating, listing, and removing worktrees

use git2::{BranchType, Error as GitError, Repository, Worktree, WorktreeAddOptions, WorktreePruneOptions};
use std::path::Path;

use crate::git::types::WorktreeInfo;
use crate::git::GitManager;

impl GitManager {
    /// Create a worktree at `path` checked out to an existing `branch`
    pub fn create_worktree(&self, branch: &str, path: &Path) -> Result<WorktreeInfo, GitError> {
        let branch_ref = self.repo.find_branch(branch, BranchType::Local)?;

        let mut opts = WorktreeAddOptions::new();
        opts.reference(Some(branch_ref.get()));

        // Branch names like "orchestrator/s/a" would nest inside .git/worktrees/
        let worktree_name = branch.replace('/', "-");

        let worktree = self.repo.worktree(&worktree_name, path, Some(&opts))?;

        self.worktree_to_info(&worktree)
    }

    /// List all worktrees
    pub fn list_worktrees(&self) -> Result<Vec<WorktreeInfo>, GitError> {
        let worktrees = self.repo.worktrees()?;

        let mut result = Vec::new();
        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                result.push(self.worktree_to_info(&worktree)?);
            }
        }

        Ok(result)
    }

    /// Remove a worktree by path, deleting its working directory
    pub fn remove_worktree(&self, path: &Path) -> Result<(), GitError> {
        let target = normalize(path);
        let worktrees = self.repo.worktrees()?;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if normalize(worktree.path()) == target {
                    let mut opts = WorktreePruneOptions::new();
                    opts.valid(true).working_tree(true);
                    worktree.prune(Some(&mut opts))?;
                    return Ok(());
                }
            }
        }

        Err(GitError::from_str(&format!(
            "Worktree not found: {}",
            path.display()
        )))
    }

    /// Prune orphaned worktrees (where the physical directory no longer exists)
    pub fn prune_orphaned_worktrees(&self) -> Result<u32, GitError> {
        let worktrees = self.repo.worktrees()?;
        let mut pruned_count = 0;

        for name in worktrees.iter().flatten() {
            if let Ok(worktree) = self.repo.find_worktree(name) {
                if !worktree.path().exists() {
                    log::info!(
                        "[GitManager] Pruning orphaned worktree '{}' (path {:?} no longer exists)",
                        name,
                        worktree.path()
                    );
                    if let Err(e) = worktree.prune(None) {
                        log::warn!("[GitManager] Failed to prune worktree '{}': {}", name, e);
                    } else {
                        pruned_count += 1;
                    }
                }
            }
        }

        Ok(pruned_count)
    }

    /// Convert a Worktree to WorktreeInfo
    pub(crate) fn worktree_to_info(&self, worktree: &Worktree) -> Result<WorktreeInfo, GitError> {
        let name = worktree.name().unwrap_or("").to_string();
        let path = worktree.path().to_string_lossy().to_string();
        let is_locked = worktree
            .is_locked()
            .map(|status| !matches!(status, git2::WorktreeLockStatus::Unlocked))
            .unwrap_or(false);

        let branch = Repository::open(worktree.path()).ok().and_then(|wt_repo| {
            let head = wt_repo.head().ok()?;
            if head.is_branch() {
                head.shorthand().map(|s| s.to_string())
            } else {
                None
            }
        });

        Ok(WorktreeInfo {
            name,
            path,
            branch,
            is_locked,
        })
    }
}

fn normalize(path: &Path) -> String {
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    resolved.to_string_lossy().trim_end_matches('/').to_string()
}
