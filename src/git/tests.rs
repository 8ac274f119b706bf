//! Tests for GitManager and GitVcs

use git2::{Repository, Signature};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Initialize a repository with one committed file
pub(crate) fn setup_test_repo() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let repo_path = temp_dir.path().to_path_buf();

    let repo = Repository::init(&repo_path).unwrap();

    let sig = Signature::now("Test User", "test@example.com").unwrap();
    let tree_id = {
        let mut index = repo.index().unwrap();
        fs::write(repo_path.join("test.txt"), "Hello, World!\n").unwrap();
        index.add_path(Path::new("test.txt")).unwrap();
        index.write().unwrap();
        index.write_tree().unwrap()
    };

    let tree = repo.find_tree(tree_id).unwrap();
    repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
        .unwrap();

    (temp_dir, repo_path)
}

mod manager_tests {
    use super::*;
    use crate::git::{GitManager, GitVcs, Vcs};

    fn vcs(path: &Path) -> GitVcs {
        GitVcs::new(path, "Test User", "test@example.com")
    }

    #[test]
    fn test_fork_branch_and_delete() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let manager = GitManager::new(&repo_path).unwrap();
        let base = manager.get_default_branch_name();

        manager.fork_branch(&base, "orchestrator/s1/a").unwrap();
        assert!(manager.branch_exists("orchestrator/s1/a"));

        manager.delete_branch("orchestrator/s1/a").unwrap();
        assert!(!manager.branch_exists("orchestrator/s1/a"));
    }

    #[test]
    fn test_fork_from_missing_base_fails() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let manager = GitManager::new(&repo_path).unwrap();
        assert!(manager.fork_branch("does-not-exist", "x").is_err());
    }

    #[test]
    fn test_create_and_remove_worktree() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let git = vcs(&repo_path);
        let base = git.default_branch().unwrap();

        git.fork_branch(&base, "orchestrator/s1/a").unwrap();
        let wt_path = repo_path.join(".orchestrator/worktrees/s1/a");
        git.create_worktree(&wt_path, "orchestrator/s1/a").unwrap();

        assert!(wt_path.join("test.txt").exists());

        let manager = GitManager::new(&repo_path).unwrap();
        let worktrees = manager.list_worktrees().unwrap();
        assert_eq!(worktrees.len(), 1);
        assert_eq!(worktrees[0].branch.as_deref(), Some("orchestrator/s1/a"));

        git.remove_worktree(&wt_path).unwrap();
        assert!(!wt_path.exists());

        // Branch is no longer checked out anywhere, so it can be deleted
        git.delete_branch("orchestrator/s1/a").unwrap();
    }

    #[test]
    fn test_create_worktree_on_existing_path_fails() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let git = vcs(&repo_path);
        let base = git.default_branch().unwrap();
        git.fork_branch(&base, "b1").unwrap();

        let wt_path = repo_path.join("occupied");
        fs::create_dir_all(&wt_path).unwrap();

        assert!(git.create_worktree(&wt_path, "b1").is_err());
    }

    #[test]
    fn test_commit_all_in_worktree() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let git = vcs(&repo_path);
        let base = git.default_branch().unwrap();
        git.fork_branch(&base, "feature").unwrap();
        let wt_path = repo_path.join("wt");
        git.create_worktree(&wt_path, "feature").unwrap();

        // Nothing changed yet
        assert!(git.commit_all(&wt_path, "noop").unwrap().is_none());

        fs::write(wt_path.join("new.txt"), "content\n").unwrap();
        fs::remove_file(wt_path.join("test.txt")).unwrap();
        let commit = git.commit_all(&wt_path, "agent work").unwrap();
        assert!(commit.is_some());

        // Deletion was staged too
        assert!(git.commit_all(&wt_path, "again").unwrap().is_none());
    }

    #[test]
    fn test_merge_fast_forward() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let git = vcs(&repo_path);
        let base = git.default_branch().unwrap();
        git.fork_branch(&base, "feature").unwrap();
        let wt_path = repo_path.join("wt");
        git.create_worktree(&wt_path, "feature").unwrap();

        fs::write(wt_path.join("feature.txt"), "feature\n").unwrap();
        git.commit_all(&wt_path, "add feature").unwrap();

        let result = git.merge_branch("feature", &base).unwrap();
        assert!(result.success);
        assert!(result.fast_forward);
        assert!(repo_path.join("feature.txt").exists());
    }

    #[test]
    fn test_merge_two_branches_creates_merge_commit() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let git = vcs(&repo_path);
        let base = git.default_branch().unwrap();

        for name in ["a", "b"] {
            git.fork_branch(&base, name).unwrap();
            let wt = repo_path.join(format!("wt-{}", name));
            git.create_worktree(&wt, name).unwrap();
            fs::write(wt.join(format!("{}.txt", name)), name).unwrap();
            git.commit_all(&wt, name).unwrap();
        }

        assert!(git.merge_branch("a", &base).unwrap().fast_forward);
        let second = git.merge_branch("b", &base).unwrap();
        assert!(second.success);
        assert!(!second.fast_forward);
        assert!(second.commit_id.is_some());
        assert!(repo_path.join("a.txt").exists());
        assert!(repo_path.join("b.txt").exists());
    }

    #[test]
    fn test_conflicting_merge_is_aborted() {
        let (_temp_dir, repo_path) = setup_test_repo();
        let git = vcs(&repo_path);
        let base = git.default_branch().unwrap();

        for (name, content) in [("a", "from a\n"), ("b", "from b\n")] {
            git.fork_branch(&base, name).unwrap();
            let wt = repo_path.join(format!("wt-{}", name));
            git.create_worktree(&wt, name).unwrap();
            fs::write(wt.join("test.txt"), content).unwrap();
            git.commit_all(&wt, name).unwrap();
        }

        assert!(git.merge_branch("a", &base).unwrap().success);
        let result = git.merge_branch("b", &base).unwrap();
        assert!(!result.success);
        assert_eq!(result.conflict_files, vec!["test.txt".to_string()]);

        // Base checkout was reset to the first merge
        let content = fs::read_to_string(repo_path.join("test.txt")).unwrap();
        assert_eq!(content, "from a\n");
    }
}
