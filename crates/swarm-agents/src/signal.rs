//! Rate-limit signature detection over agent stderr and error events.
//!
//! The list is a best-effort heuristic; the supervisor keeps a hit counter
//! so drift between the list and real upstream messages stays observable.

/// Case-insensitive substrings that indicate an upstream usage/rate limit.
pub const RATE_LIMIT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "usage limit",
    "too many requests",
    "429",
    "token limit exceeded",
    "exceeded your",
    "capacity",
    "overloaded",
    "try again later",
    "throttl",
];

pub fn has_rate_limit_signature(text: &str) -> bool {
    let lower = text.to_lowercase();
    RATE_LIMIT_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
}

/// Whether a failed run was caused by a rate limit: matches the collected
/// stderr and the summaries of any `error` events from the stream.
pub fn is_rate_limit_failure<'a>(
    stderr: &str,
    error_summaries: impl IntoIterator<Item = &'a str>,
) -> bool {
    if has_rate_limit_signature(stderr) {
        return true;
    }
    error_summaries
        .into_iter()
        .any(has_rate_limit_signature)
}
