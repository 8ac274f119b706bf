//! Core GitManager implementation
//!
//! Contains the GitManager struct and its basic operations

use git2::{Error as GitError, Repository, Signature};
use std::path::{Path, PathBuf};

/// Git manager for repository operations
pub struct GitManager {
    pub(crate) repo: Repository,
}

impl GitManager {
    /// Open the repository (or worktree) at the given path
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, GitError> {
        let repo = Repository::open(path)?;
        Ok(Self { repo })
    }

    /// Get the repository's .git path
    pub fn repo_path(&self) -> PathBuf {
        self.repo.path().to_path_buf()
    }

    /// Working directory of this checkout
    pub fn workdir(&self) -> Option<PathBuf> {
        self.repo.workdir().map(|p| p.to_path_buf())
    }

    /// Configured signature, or the given fallback identity
    pub(crate) fn signature_or(&self, name: &str, email: &str) -> Result<Signature<'static>, GitError> {
        self.repo
            .signature()
            .or_else(|_| Signature::now(name, email))
    }
}
