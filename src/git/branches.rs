//! Branch operations for GitManager
//!
//! Contains methods for forking, deleting and checking out branches

use git2::{BranchType, Error as GitError};

use crate::git::GitManager;

impl GitManager {
    /// Create `name` pointing at the tip of `base`
    /// An unborn repository gets an initial empty commit first.
    pub fn fork_branch(&self, base: &str, name: &str) -> Result<(), GitError> {
        if self.repo.head().is_err() && self.repo.is_empty()? {
            log::info!("[GitManager] No commits found, creating initial commit");
            self.create_initial_commit()?;
        }

        let base_branch = self.repo.find_branch(base, BranchType::Local)?;
        let base_commit = base_branch.get().peel_to_commit()?;
        self.repo.branch(name, &base_commit, false)?;

        log::debug!("[GitManager] Forked {} from {}", name, base);
        Ok(())
    }

    /// Create an initial empty commit for a new repository
    pub(crate) fn create_initial_commit(&self) -> Result<(), GitError> {
        let tree_id = self.repo.index()?.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let signature = self.signature_or("Agent Orchestrator", "orchestrator@localhost")?;

        self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            "Initial commit (created by agent orchestrator)",
            &tree,
            &[],
        )?;

        Ok(())
    }

    /// Delete a local branch
    pub fn delete_branch(&self, name: &str) -> Result<(), GitError> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;
        Ok(())
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Checkout a branch
    pub fn checkout_branch(&self, name: &str) -> Result<(), GitError> {
        let obj = self.repo.revparse_single(&format!("refs/heads/{}", name))?;

        self.repo.checkout_tree(&obj, None)?;
        self.repo.set_head(&format!("refs/heads/{}", name))?;

        Ok(())
    }

    /// Get the default branch name for this repository.
    ///
    /// Resolution order:
    /// 1. Current HEAD branch (if HEAD points to a branch)
    /// 2. First existing common default branch ("main", "master")
    /// 3. Fallback to "main"
    pub fn get_default_branch_name(&self) -> String {
        if let Ok(head) = self.repo.head() {
            if head.is_branch() {
                if let Some(name) = head.shorthand() {
                    return name.to_string();
                }
            }
        }

        for name in &["main", "master"] {
            if self.repo.find_branch(name, BranchType::Local).is_ok() {
                return (*name).to_string();
            }
        }

        // Unborn HEAD: use its symbolic target if there is one
        if let Ok(reference) = self.repo.find_reference("HEAD") {
            if let Some(target) = reference.symbolic_target() {
                if let Some(name) = target.strip_prefix("refs/heads/") {
                    return name.to_string();
                }
            }
        }

        "main".to_string()
    }
}
