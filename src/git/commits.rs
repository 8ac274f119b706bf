//! Commit operations for GitManager

use git2::{Commit, Error as GitError, IndexAddOption};

use crate::git::types::CommitInfo;
use crate::git::GitManager;

impl GitManager {
    /// Stage every change in the working tree, including deletions
    pub fn stage_all(&self) -> Result<(), GitError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(())
    }

    /// Stage and commit everything; returns None when the tree is unchanged
    pub fn commit_all(
        &self,
        message: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<Option<CommitInfo>, GitError> {
        self.stage_all()?;

        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let parent = self.repo.head()?.peel_to_commit()?;

        if parent.tree_id() == tree_id {
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let signature = self.signature_or(author_name, author_email)?;
        let oid = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            message,
            &tree,
            &[&parent],
        )?;

        let commit = self.repo.find_commit(oid)?;
        Ok(Some(self.commit_to_info(&commit)?))
    }

    /// Convert a Commit to CommitInfo
    pub(crate) fn commit_to_info(&self, commit: &Commit) -> Result<CommitInfo, GitError> {
        let author = commit.author();
        let id = commit.id().to_string();

        Ok(CommitInfo {
            short_id: id[..7].to_string(),
            id,
            message: commit.message().unwrap_or("").to_string(),
            author: author.name().unwrap_or("").to_string(),
            email: author.email().unwrap_or("").to_string(),
            timestamp: commit.time().seconds(),
            parent_ids: commit.parent_ids().map(|oid| oid.to_string()).collect(),
        })
    }
}
