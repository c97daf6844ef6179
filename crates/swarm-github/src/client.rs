//! High-level hosting-service operations used by the control loops.

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::command::GhCli;
use crate::error::GithubError;
use crate::types::{CheckRun, IssueSummary, ReviewThread, ThreadComment};

const THREADS_QUERY: &str = r#"
query($owner: String!, $repo: String!, $pr: Int!) {
  repository(owner: $owner, name: $repo) {
    pullRequest(number: $pr) {
      reviewThreads(first: 100) {
        nodes {
          isResolved
          path
          line
          comments(first: 10) {
            nodes {
              body
              author { login }
            }
          }
        }
      }
    }
  }
}
"#;

#[derive(Debug, Clone)]
pub struct GithubClient {
    gh: GhCli,
    repo: String,
}

impl GithubClient {
    pub fn new(gh: GhCli, repo: impl Into<String>) -> Self {
        Self {
            gh,
            repo: repo.into(),
        }
    }

    pub fn repo(&self) -> &str {
        &self.repo
    }

    fn owner_and_name(&self) -> (&str, &str) {
        match self.repo.split_once('/') {
            Some((owner, name)) => (owner, name),
            None => ("", self.repo.as_str()),
        }
    }

    /// Verify the token works; part of startup validation.
    pub fn auth_status(&self) -> Result<(), GithubError> {
        self.gh.run(["auth", "status"]).map(|_| ())
    }

    pub fn list_open_issues(
        &self,
        label: &str,
        limit: u32,
    ) -> Result<Vec<IssueSummary>, GithubError> {
        let limit = limit.to_string();
        let output = self.gh.run([
            "issue",
            "list",
            "--repo",
            self.repo.as_str(),
            "--label",
            label,
            "--state",
            "open",
            "--json",
            "number,title,body",
            "--limit",
            limit.as_str(),
        ])?;
        parse_issue_list(&output.stdout)
    }

    /// Whether any comment on the issue contains the trigger mention
    /// (case-insensitive). An empty mention disables the gate.
    pub fn issue_has_trigger(&self, issue_number: i64, mention: &str) -> Result<bool, GithubError> {
        if mention.is_empty() {
            return Ok(true);
        }
        let number = issue_number.to_string();
        let output = self.gh.run([
            "issue",
            "view",
            number.as_str(),
            "--repo",
            self.repo.as_str(),
            "--json",
            "comments",
        ])?;
        Ok(comments_contain_mention(&output.stdout, mention))
    }

    /// Open PR whose head branch is `branch`, if one exists.
    pub fn find_open_pr_for_branch(&self, branch: &str) -> Result<Option<i64>, GithubError> {
        let output = self.gh.run([
            "pr",
            "list",
            "--repo",
            self.repo.as_str(),
            "--head",
            branch,
            "--state",
            "open",
            "--json",
            "number",
            "--limit",
            "1",
        ])?;
        parse_first_pr_number(&output.stdout)
    }

    /// Create a PR for an already-pushed branch; used by PR recovery when the
    /// agent finished without creating one itself.
    pub fn create_pr(&self, branch: &str, issue_number: i64) -> Result<i64, GithubError> {
        let title = format!("Fix #{issue_number}: automated change");
        let body = format!(
            "Closes #{issue_number}\n\nOpened by the swarm orchestrator: the agent \
             completed its work but did not create a pull request itself."
        );
        let output = self.gh.run([
            "pr",
            "create",
            "--repo",
            self.repo.as_str(),
            "--head",
            branch,
            "--title",
            title.as_str(),
            "--body",
            body.as_str(),
        ])?;
        let combined = format!("{}\n{}", output.stdout, output.stderr);
        pr_number_from_create_output(&combined).ok_or(GithubError::PrNumberMissing)
    }

    pub fn pr_checks(&self, pr_number: i64) -> Result<Vec<CheckRun>, GithubError> {
        // `gh pr checks` exits non-zero when checks are failing or absent;
        // both are answers, not errors.
        let number = pr_number.to_string();
        let output = match self.gh.run([
            "pr",
            "checks",
            number.as_str(),
            "--repo",
            self.repo.as_str(),
            "--json",
            "name,state,bucket",
        ]) {
            Ok(output) => output.stdout,
            Err(GithubError::CommandFailed { stdout, .. }) if !stdout.trim().is_empty() => stdout,
            Err(GithubError::CommandFailed { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        parse_check_runs(&output)
    }

    pub fn pr_head_branch(&self, pr_number: i64) -> Result<Option<String>, GithubError> {
        let number = pr_number.to_string();
        let output = self.gh.run([
            "pr",
            "view",
            number.as_str(),
            "--repo",
            self.repo.as_str(),
            "--json",
            "headRefName",
        ])?;
        let value: Value = serde_json::from_str(&output.stdout).map_err(|source| {
            GithubError::Json {
                context: "pr view headRefName",
                source,
            }
        })?;
        Ok(value
            .get("headRefName")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Whether the hosting service reports the PR as merged. Resolution is
    /// gated on this, never inferred locally.
    pub fn pr_merged(&self, pr_number: i64) -> Result<bool, GithubError> {
        let number = pr_number.to_string();
        let output = self.gh.run([
            "pr",
            "view",
            number.as_str(),
            "--repo",
            self.repo.as_str(),
            "--json",
            "state,mergedAt",
        ])?;
        parse_merged_state(&output.stdout)
    }

    /// Unresolved review threads via GraphQL (the high-fidelity path).
    pub fn unresolved_threads(&self, pr_number: i64) -> Result<Vec<ReviewThread>, GithubError> {
        let (owner, name) = self.owner_and_name();
        let query_arg = format!("query={THREADS_QUERY}");
        let owner_arg = format!("owner={owner}");
        let repo_arg = format!("repo={name}");
        let pr_arg = format!("pr={pr_number}");
        let output = self.gh.run([
            "api",
            "graphql",
            "-f",
            query_arg.as_str(),
            "-f",
            owner_arg.as_str(),
            "-f",
            repo_arg.as_str(),
            "-F",
            pr_arg.as_str(),
        ])?;
        parse_graphql_threads(&output.stdout)
    }

    /// All inline review comments via REST, downgraded to synthetic
    /// one-comment threads (no resolution state available on this path).
    pub fn review_comments_as_threads(
        &self,
        pr_number: i64,
    ) -> Result<Vec<ReviewThread>, GithubError> {
        let (owner, name) = self.owner_and_name();
        let endpoint = format!("repos/{owner}/{name}/pulls/{pr_number}/comments");
        let output = self.gh.run(["api", endpoint.as_str(), "--paginate"])?;
        parse_rest_comments(&output.stdout)
    }

    pub fn add_issue_label(&self, issue_number: i64, label: &str) -> Result<(), GithubError> {
        debug!(issue = issue_number, label, "labelling issue");
        let number = issue_number.to_string();
        self.gh
            .run([
                "issue",
                "edit",
                number.as_str(),
                "--repo",
                self.repo.as_str(),
                "--add-label",
                label,
            ])
            .map(|_| ())
    }
}

fn parse_issue_list(raw: &str) -> Result<Vec<IssueSummary>, GithubError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|source| GithubError::Json {
        context: "issue list",
        source,
    })
}

fn comments_contain_mention(raw: &str, mention: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return false;
    };
    let needle = mention.to_lowercase();
    value
        .get("comments")
        .and_then(Value::as_array)
        .map(|comments| {
            comments.iter().any(|comment| {
                comment
                    .get("body")
                    .and_then(Value::as_str)
                    .is_some_and(|body| body.to_lowercase().contains(&needle))
            })
        })
        .unwrap_or(false)
}

fn parse_first_pr_number(raw: &str) -> Result<Option<i64>, GithubError> {
    if raw.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(raw).map_err(|source| GithubError::Json {
        context: "pr list",
        source,
    })?;
    let prs = value.as_array().ok_or(GithubError::Shape {
        context: "pr list is not an array",
    })?;
    Ok(prs
        .first()
        .and_then(|pr| pr.get("number"))
        .and_then(Value::as_i64))
}

fn parse_check_runs(raw: &str) -> Result<Vec<CheckRun>, GithubError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(raw).map_err(|source| GithubError::Json {
        context: "pr checks",
        source,
    })
}

fn parse_merged_state(raw: &str) -> Result<bool, GithubError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| GithubError::Json {
        context: "pr view state",
        source,
    })?;
    let merged_state = value
        .get("state")
        .and_then(Value::as_str)
        .is_some_and(|state| state.eq_ignore_ascii_case("MERGED"));
    let merged_at = value.get("mergedAt").is_some_and(|at| !at.is_null());
    Ok(merged_state || merged_at)
}

fn parse_graphql_threads(raw: &str) -> Result<Vec<ReviewThread>, GithubError> {
    let value: Value = serde_json::from_str(raw).map_err(|source| GithubError::Json {
        context: "review threads graphql",
        source,
    })?;
    let nodes = value
        .pointer("/data/repository/pullRequest/reviewThreads/nodes")
        .and_then(Value::as_array)
        .ok_or(GithubError::Shape {
            context: "graphql reviewThreads nodes missing",
        })?;

    let mut unresolved = Vec::new();
    for node in nodes {
        if node.get("isResolved").and_then(Value::as_bool).unwrap_or(true) {
            continue;
        }
        let comments = node
            .pointer("/comments/nodes")
            .and_then(Value::as_array)
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|comment| ThreadComment {
                        author: comment
                            .pointer("/author/login")
                            .and_then(Value::as_str)
                            .unwrap_or("unknown")
                            .to_string(),
                        body: comment
                            .get("body")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        unresolved.push(ReviewThread {
            path: node
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            line: node.get("line").and_then(Value::as_i64),
            comments,
        });
    }
    Ok(unresolved)
}

fn parse_rest_comments(raw: &str) -> Result<Vec<ReviewThread>, GithubError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(raw).map_err(|source| GithubError::Json {
        context: "pr review comments",
        source,
    })?;
    let comments = value.as_array().ok_or(GithubError::Shape {
        context: "review comments is not an array",
    })?;
    Ok(comments
        .iter()
        .map(|comment| ReviewThread {
            path: comment
                .get("path")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            line: comment.get("line").and_then(Value::as_i64),
            comments: vec![ThreadComment {
                author: comment
                    .pointer("/user/login")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                body: comment
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }],
        })
        .collect())
}

fn pr_number_from_create_output(raw: &str) -> Option<i64> {
    let pattern = Regex::new(r"pull/(\d+)").ok()?;
    pattern
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}
