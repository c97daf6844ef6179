//! Hosting-service access, exclusively through the `gh` CLI.
//!
//! The client speaks three dialects: `gh issue`/`gh pr` JSON subcommands,
//! `gh api` REST, and `gh api graphql` for review-thread resolution state.

pub mod client;
pub mod command;
pub mod error;
pub mod threads;
pub mod types;

pub use client::GithubClient;
pub use command::{GhCli, GhOutput};
pub use error::GithubError;
pub use threads::{fetch_thread_view, ThreadFidelity, ThreadView};
pub use types::{
    normalize_ci_status, CheckRun, CiStatus, IssueSummary, ReviewThread, ThreadComment,
};
