#[derive(Debug, thiserror::Error)]
pub enum GithubError {
    #[error("gh command failed to start ({command}): {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("gh command returned non-zero exit ({command}) status={status:?}: {stderr}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("failed to parse gh output ({context}): {source}")]
    Json {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("unexpected gh response shape ({context})")]
    Shape { context: &'static str },
    #[error("gh pr create succeeded but no PR number was found in its output")]
    PrNumberMissing,
}
