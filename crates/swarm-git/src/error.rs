use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// The git binary could not be started at all (missing on PATH, bad
    /// working directory). Distinct from a git-level failure so startup
    /// validation can tell "no git installed" apart from "repo broken".
    #[error("could not launch {command}: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// git ran and said no. `code` is `None` when it died to a signal.
    #[error("{command} exited with status {code:?}: {stderr}")]
    Exit {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    /// The worktree root could not be created on disk.
    #[error("failed to prepare worktree directory {path}: {source}")]
    WorktreeDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
