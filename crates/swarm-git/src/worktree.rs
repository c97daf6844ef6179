//! Worktree lifecycle for agent runs.
//!
//! Implement runs get `{root}/issue-{N}` on a fresh `fix/issue-{N}` branch;
//! fix runs get `{root}/pr-fix-{N}` checked out to the PR's branch and
//! hard-reset to its origin state. Creation always clears stale leftovers
//! first so a retried issue never inherits a dirty tree.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::command::Git;
use crate::error::GitError;

pub fn implement_branch_name(issue_number: i64) -> String {
    format!("fix/issue-{issue_number}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorktreeManager {
    git: Git,
    repo_path: PathBuf,
    worktree_root: PathBuf,
}

impl WorktreeManager {
    pub fn new(git: Git, repo_path: impl Into<PathBuf>, worktree_root: impl Into<PathBuf>) -> Self {
        Self {
            git,
            repo_path: repo_path.into(),
            worktree_root: worktree_root.into(),
        }
    }

    pub fn implement_path(&self, issue_number: i64) -> PathBuf {
        self.worktree_root.join(format!("issue-{issue_number}"))
    }

    pub fn fix_path(&self, pr_number: i64) -> PathBuf {
        self.worktree_root.join(format!("pr-fix-{pr_number}"))
    }

    /// Worktree for an implement run: branch `fix/issue-{N}` forked from
    /// `base_branch`, any stale branch of that name deleted first.
    pub fn create_for_implement(
        &self,
        issue_number: i64,
        base_branch: &str,
    ) -> Result<WorktreeInfo, GitError> {
        let path = self.implement_path(issue_number);
        let branch = implement_branch_name(issue_number);

        self.ensure_root()?;
        self.remove_stale(&path)?;

        // The branch may linger from an earlier attempt; absent is fine too.
        self.git
            .try_run(&self.repo_path, &["branch", "-D", branch.as_str()])?;

        info!(path = %path.display(), branch = %branch, "creating implement worktree");
        let path_arg = path.to_string_lossy().into_owned();
        self.git.run(
            &self.repo_path,
            &[
                "worktree",
                "add",
                path_arg.as_str(),
                "-b",
                branch.as_str(),
                base_branch,
            ],
        )?;

        Ok(WorktreeInfo { path, branch })
    }

    /// Worktree for a fix run: the PR's existing branch, reset to its origin
    /// state so the agent starts from what reviewers actually saw.
    pub fn create_for_fix(&self, pr_number: i64, branch: &str) -> Result<WorktreeInfo, GitError> {
        let path = self.fix_path(pr_number);

        self.ensure_root()?;
        self.remove_stale(&path)?;

        // Tolerant: the branch may already be known locally.
        self.git
            .try_run(&self.repo_path, &["fetch", "origin", branch])?;

        info!(path = %path.display(), branch = %branch, "creating fix worktree");
        let path_arg = path.to_string_lossy().into_owned();
        self.git.run(
            &self.repo_path,
            &["worktree", "add", path_arg.as_str(), branch],
        )?;
        let remote_ref = format!("origin/{branch}");
        self.git
            .run(&path, &["reset", "--hard", remote_ref.as_str()])?;

        Ok(WorktreeInfo {
            path,
            branch: branch.to_string(),
        })
    }

    /// Force-remove a worktree, tolerating already-removed state.
    pub fn cleanup(&self, path: &Path) {
        info!(path = %path.display(), "cleaning up worktree");
        let path_arg = path.to_string_lossy().into_owned();
        match self.git.try_run(
            &self.repo_path,
            &["worktree", "remove", path_arg.as_str(), "--force"],
        ) {
            Ok(capture) if !capture.ok() => {
                debug!(
                    path = %path.display(),
                    stderr = %capture.stderr.trim(),
                    "worktree remove had nothing to do"
                );
            }
            Ok(_) => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not run worktree remove");
            }
        }
        let _ = self.git.try_run(&self.repo_path, &["worktree", "prune"]);
    }

    fn ensure_root(&self) -> Result<(), GitError> {
        fs::create_dir_all(&self.worktree_root).map_err(|source| GitError::WorktreeDir {
            path: self.worktree_root.clone(),
            source,
        })
    }

    fn remove_stale(&self, path: &Path) -> Result<(), GitError> {
        if path.exists() {
            warn!(path = %path.display(), "stale worktree found, removing first");
            self.cleanup(path);
            if path.exists() {
                fs::remove_dir_all(path).map_err(|source| GitError::WorktreeDir {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}
