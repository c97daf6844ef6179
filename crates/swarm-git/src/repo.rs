//! Operations against the target repository and agent worktrees that back
//! the PR-recovery ladder.

use std::path::Path;

use tracing::debug;

use crate::command::Git;
use crate::error::GitError;

/// Fetch origin and fast-forward the base branch of the target repository.
///
/// A base that cannot be fast-forwarded is surfaced as an exit failure; the
/// orchestrator never tries to resolve divergence itself.
pub fn ensure_repo_updated(git: &Git, repo_path: &Path, base_branch: &str) -> Result<(), GitError> {
    git.run(repo_path, &["fetch", "origin"])?;

    let head = git.run(repo_path, &["rev-parse", "--abbrev-ref", "HEAD"])?;
    if head.trim() == base_branch {
        let remote_ref = format!("origin/{base_branch}");
        git.run(repo_path, &["merge", "--ff-only", remote_ref.as_str()])?;
    } else {
        // Fast-forward the unchecked-out base ref; git rejects non-ff here.
        let refspec = format!("{base_branch}:{base_branch}");
        git.run(repo_path, &["fetch", "origin", refspec.as_str()])?;
    }
    debug!(base = base_branch, "target repo updated");
    Ok(())
}

/// Whether `branch` exists on the remote.
pub fn is_branch_pushed(git: &Git, worktree_path: &Path, branch: &str) -> Result<bool, GitError> {
    let listing = git.run(worktree_path, &["ls-remote", "--heads", "origin", branch])?;
    Ok(listing
        .lines()
        .any(|line| line.ends_with(&format!("refs/heads/{branch}"))))
}

/// Whether the worktree carries commits not on `origin/{base_branch}`.
pub fn has_unpushed_commits(
    git: &Git,
    worktree_path: &Path,
    base_branch: &str,
) -> Result<bool, GitError> {
    let range = format!("origin/{base_branch}..HEAD");
    let log = git.run(worktree_path, &["log", range.as_str(), "--oneline"])?;
    Ok(!log.trim().is_empty())
}

/// Push `branch` to origin with an upstream.
pub fn push_branch(git: &Git, worktree_path: &Path, branch: &str) -> Result<(), GitError> {
    git.run(worktree_path, &["push", "-u", "origin", branch])?;
    Ok(())
}

/// Whether `path` is the root of (or inside) a git work tree. Used by the
/// startup environment validation.
pub fn is_git_repo(git: &Git, path: &Path) -> bool {
    matches!(
        git.run(path, &["rev-parse", "--is-inside-work-tree"]),
        Ok(stdout) if stdout.trim() == "true"
    )
}
