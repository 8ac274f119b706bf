//! Merge handling for GitManager

use git2::{build::CheckoutBuilder, BranchType, Error as GitError, MergeOptions};

use crate::git::types::MergeResult;
use crate::git::GitManager;

impl GitManager {
    /// Merge a source branch into a target branch in this checkout.
    /// A conflicting merge is aborted so the target checkout stays clean;
    /// the conflicting paths are reported in the result.
    pub fn merge_branch(
        &self,
        source_branch: &str,
        target_branch: &str,
        author_name: &str,
        author_email: &str,
    ) -> Result<MergeResult, GitError> {
        log::info!(
            "[GitManager] Merging {} into {}",
            source_branch,
            target_branch
        );

        self.checkout_branch(target_branch)?;

        let source_ref = self.repo.find_branch(source_branch, BranchType::Local)?;
        let source_commit = source_ref.get().peel_to_commit()?;
        let annotated_commit = self.repo.find_annotated_commit(source_commit.id())?;

        let (analysis, _preference) = self.repo.merge_analysis(&[&annotated_commit])?;

        if analysis.is_up_to_date() {
            log::info!("[GitManager] Already up to date");
            return Ok(MergeResult {
                success: true,
                message: "Already up to date".to_string(),
                conflict_files: vec![],
                commit_id: None,
                fast_forward: false,
            });
        }

        if analysis.is_fast_forward() {
            let target_ref_name = format!("refs/heads/{}", target_branch);
            let mut target_ref = self.repo.find_reference(&target_ref_name)?;
            target_ref.set_target(
                source_commit.id(),
                &format!("Fast-forward merge {} into {}", source_branch, target_branch),
            )?;
            self.repo
                .checkout_head(Some(CheckoutBuilder::default().force()))?;

            return Ok(MergeResult {
                success: true,
                message: format!("Fast-forward merged {} into {}", source_branch, target_branch),
                conflict_files: vec![],
                commit_id: Some(source_commit.id().to_string()),
                fast_forward: true,
            });
        }

        let mut merge_opts = MergeOptions::new();
        let mut checkout_opts = CheckoutBuilder::new();
        checkout_opts.safe();

        self.repo.merge(
            &[&annotated_commit],
            Some(&mut merge_opts),
            Some(&mut checkout_opts),
        )?;

        let mut index = self.repo.index()?;
        if index.has_conflicts() {
            let mut conflict_files = Vec::new();
            for conflict in index.conflicts()?.flatten() {
                if let Some(entry) = conflict.our.or(conflict.their).or(conflict.ancestor) {
                    conflict_files.push(String::from_utf8_lossy(&entry.path).to_string());
                }
            }

            log::warn!("[GitManager] Merge has conflicts: {:?}", conflict_files);
            self.merge_abort()?;

            return Ok(MergeResult {
                success: false,
                message: format!("Merge conflicts in {} file(s)", conflict_files.len()),
                conflict_files,
                commit_id: None,
                fast_forward: false,
            });
        }

        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let head_commit = self.repo.head()?.peel_to_commit()?;
        let signature = self.signature_or(author_name, author_email)?;

        let merge_commit = self.repo.commit(
            Some("HEAD"),
            &signature,
            &signature,
            &format!("Merge branch '{}' into '{}'", source_branch, target_branch),
            &tree,
            &[&head_commit, &source_commit],
        )?;

        self.repo.cleanup_state()?;

        log::info!("[GitManager] Merge successful: {}", merge_commit);

        Ok(MergeResult {
            success: true,
            message: format!("Successfully merged {} into {}", source_branch, target_branch),
            conflict_files: vec![],
            commit_id: Some(merge_commit.to_string()),
            fast_forward: false,
        })
    }

    /// Abort an ongoing merge
    pub fn merge_abort(&self) -> Result<(), GitError> {
        log::info!("[GitManager] Aborting merge");

        let head = self.repo.head()?.peel_to_commit()?;
        self.repo
            .reset(head.as_object(), git2::ResetType::Hard, None)?;
        self.repo.cleanup_state()?;

        Ok(())
    }
}
