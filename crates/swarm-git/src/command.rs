//! Thin runner for the git binary.
//!
//! Two entry points with different failure contracts. [`Git::run`] is for
//! operations that must succeed (fetching, creating a worktree, pushing);
//! a non-zero exit becomes a typed error carrying the command line and
//! stderr. [`Git::try_run`] is for operations whose non-zero exit is an
//! expected answer, not a fault: deleting a stale `fix/issue-{N}` branch
//! that may not exist, removing a worktree that may already be gone,
//! fetching a PR branch that has no remote counterpart yet. Call sites pick
//! the contract; the runner never guesses.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::GitError;

/// What a tolerant invocation observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCapture {
    /// Exit code; `None` when git was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitCapture {
    pub fn ok(&self) -> bool {
        self.code == Some(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Git {
    binary: PathBuf,
}

impl Default for Git {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
        }
    }
}

impl Git {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run git in `cwd`, requiring success. Returns stdout.
    pub fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        let capture = self.try_run(cwd, args)?;
        if capture.ok() {
            Ok(capture.stdout)
        } else {
            Err(GitError::Exit {
                command: self.describe(cwd, args),
                code: capture.code,
                stderr: capture.stderr.trim().to_string(),
            })
        }
    }

    /// Run git in `cwd`, reporting the exit state instead of failing on it.
    /// Only a launch failure (missing binary, bad cwd) is an error.
    pub fn try_run(&self, cwd: &Path, args: &[&str]) -> Result<GitCapture, GitError> {
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|source| GitError::Launch {
                command: self.describe(cwd, args),
                source,
            })?;

        // Worktrees are checkouts of arbitrary repositories; nothing
        // guarantees git's output over them is UTF-8. Decode lossily
        // rather than refuse to report.
        Ok(GitCapture {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn describe(&self, cwd: &Path, args: &[&str]) -> String {
        format!(
            "{} {} (in {})",
            self.binary.display(),
            args.join(" "),
            cwd.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{Git, GitCapture};
    use crate::error::GitError;

    #[test]
    fn capture_ok_requires_a_zero_exit() {
        let mut capture = GitCapture {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        };
        assert!(capture.ok());
        capture.code = Some(128);
        assert!(!capture.ok());
        capture.code = None;
        assert!(!capture.ok(), "signal death is not success");
    }

    #[test]
    fn run_captures_stdout_of_a_version_probe() {
        let git = Git::default();
        let cwd = tempfile::tempdir().expect("temp dir");

        let stdout = git.run(cwd.path(), &["--version"]).expect("version probe");
        assert!(stdout.to_ascii_lowercase().contains("git version"));
    }

    #[test]
    fn run_reports_exit_failures_with_command_line_and_stderr() {
        let git = Git::default();
        let cwd = tempfile::tempdir().expect("temp dir");

        // `git status` outside any repository exits non-zero.
        let err = git
            .run(cwd.path(), &["status"])
            .expect_err("status outside a repo must fail");
        match err {
            GitError::Exit {
                command,
                code,
                stderr,
            } => {
                assert!(command.starts_with("git status (in "));
                assert!(code.is_some());
                assert!(stderr.contains("not a git repository"));
            }
            other => panic!("expected Exit, got {other:?}"),
        }
    }

    #[test]
    fn run_reports_a_missing_binary_as_launch_failure() {
        let git = Git::new("/definitely/missing/git-binary");
        let cwd = tempfile::tempdir().expect("temp dir");

        let err = git
            .run(cwd.path(), &["--version"])
            .expect_err("missing binary must fail");
        match err {
            GitError::Launch { command, source } => {
                assert!(command.contains("/definitely/missing/git-binary"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected Launch, got {other:?}"),
        }
    }

    #[test]
    fn try_run_turns_expected_failures_into_captures() {
        let git = Git::default();
        let cwd = tempfile::tempdir().expect("temp dir");

        let capture = git
            .try_run(cwd.path(), &["branch", "-D", "no-such-branch"])
            .expect("non-zero exit is an answer, not an error");
        assert!(!capture.ok());
        assert!(!capture.stderr.is_empty());
    }

    #[test]
    fn try_run_still_propagates_launch_failures() {
        let git = Git::new("/definitely/missing/git-binary");
        let cwd = tempfile::tempdir().expect("temp dir");

        let err = git
            .try_run(cwd.path(), &["status"])
            .expect_err("a binary that cannot start is always an error");
        assert!(matches!(err, GitError::Launch { .. }));
    }
}
