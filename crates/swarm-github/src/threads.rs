//! Normalized "threads" view with graded fidelity.
//!
//! The GraphQL thread API is the ground truth (it knows which threads are
//! resolved); the REST comment list is the fallback and can only count. The
//! PR monitor applies different trigger rules depending on which path
//! produced the view.

use tracing::warn;

use crate::client::GithubClient;
use crate::error::GithubError;
use crate::types::ReviewThread;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadFidelity {
    /// Threads with real resolution state.
    Resolved,
    /// Synthesized from raw review comments; resolution unknown.
    CommentHeuristic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadView {
    pub fidelity: ThreadFidelity,
    pub threads: Vec<ReviewThread>,
}

impl ThreadView {
    pub fn count(&self) -> usize {
        self.threads.len()
    }
}

/// Fetch unresolved threads, downgrading to the comment heuristic when the
/// GraphQL path fails. A failure of both paths propagates so the caller
/// skips the PR this tick instead of acting on missing data.
pub fn fetch_thread_view(
    client: &GithubClient,
    pr_number: i64,
) -> Result<ThreadView, GithubError> {
    match client.unresolved_threads(pr_number) {
        Ok(threads) => Ok(ThreadView {
            fidelity: ThreadFidelity::Resolved,
            threads,
        }),
        Err(err) => {
            warn!(
                pr = pr_number,
                error = %err,
                "thread query failed, falling back to comment heuristic"
            );
            let threads = client.review_comments_as_threads(pr_number)?;
            Ok(ThreadView {
                fidelity: ThreadFidelity::CommentHeuristic,
                threads,
            })
        }
    }
}
