//! Environment-driven configuration.
//!
//! Every knob comes from the process environment with the defaults listed in
//! the README table. `SwarmConfig::from_vars` is pure over a snapshot of the
//! environment so tests never touch real env state.

use std::collections::HashMap;
use std::path::PathBuf;

pub const DEFAULT_BASE_BRANCH: &str = "main";
pub const DEFAULT_ISSUE_LABEL: &str = "agent";
pub const DEFAULT_TRIGGER_MENTION: &str = "@claude-swarm";
pub const DEFAULT_DASHBOARD_PORT: u16 = 8420;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {name} is not set")]
    MissingVar { name: &'static str },
    #[error("invalid value for {name}: {value:?} ({expected})")]
    InvalidValue {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmConfig {
    /// Agent-program OAuth token, passed through to children.
    pub claude_token: String,
    /// Hosting-service PAT consumed by the gh CLI.
    pub gh_token: String,
    /// `owner/name` slug of the target repository.
    pub github_repo: String,
    pub target_repo_path: PathBuf,
    pub base_branch: String,
    pub max_concurrent_agents: usize,
    pub agent_max_turns_implement: u32,
    pub agent_max_turns_fix: u32,
    pub agent_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    pub pr_poll_interval_seconds: u64,
    pub issue_label: String,
    /// Empty string disables the trigger gate.
    pub trigger_mention: String,
    pub max_issue_retries: u32,
    pub max_pr_fix_retries: u32,
    pub rate_limit_retry_interval_seconds: u64,
    pub max_rate_limit_resumes: u32,
    pub skills_enabled: bool,
    pub skills_dir: PathBuf,
    pub ci_wait_timeout_seconds: u64,
    pub worktree_dir: PathBuf,
    pub db_path: PathBuf,
    pub dashboard_port: u16,
}

impl SwarmConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        Self::from_vars(&vars)
    }

    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let claude_token = require(vars, "CLAUDE_CODE_OAUTH_TOKEN")?;
        let gh_token = require(vars, "GH_TOKEN")?;
        let github_repo = require(vars, "GITHUB_REPO")?;
        if !github_repo.contains('/') {
            return Err(ConfigError::InvalidValue {
                name: "GITHUB_REPO",
                value: github_repo,
                expected: "owner/name slug",
            });
        }
        let target_repo_path = PathBuf::from(require(vars, "TARGET_REPO_PATH")?);

        let worktree_dir = match vars.get("WORKTREE_DIR") {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => default_worktree_dir(&target_repo_path),
        };

        let skills_dir = match vars.get("SKILLS_DIR") {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => default_skills_dir(vars),
        };

        Ok(Self {
            claude_token,
            gh_token,
            github_repo,
            target_repo_path,
            base_branch: string_or(vars, "BASE_BRANCH", DEFAULT_BASE_BRANCH),
            max_concurrent_agents: parse_or(vars, "MAX_CONCURRENT_AGENTS", 3)?,
            agent_max_turns_implement: parse_or(vars, "AGENT_MAX_TURNS_IMPLEMENT", 30)?,
            agent_max_turns_fix: parse_or(vars, "AGENT_MAX_TURNS_FIX", 20)?,
            agent_timeout_seconds: parse_or(vars, "AGENT_TIMEOUT_SECONDS", 1_800)?,
            poll_interval_seconds: parse_or(vars, "POLL_INTERVAL_SECONDS", 300)?,
            pr_poll_interval_seconds: parse_or(vars, "PR_POLL_INTERVAL_SECONDS", 120)?,
            issue_label: string_or(vars, "ISSUE_LABEL", DEFAULT_ISSUE_LABEL),
            trigger_mention: vars
                .get("TRIGGER_MENTION")
                .cloned()
                .unwrap_or_else(|| DEFAULT_TRIGGER_MENTION.to_string()),
            max_issue_retries: parse_or(vars, "MAX_ISSUE_RETRIES", 3)?,
            max_pr_fix_retries: parse_or(vars, "MAX_PR_FIX_RETRIES", 5)?,
            rate_limit_retry_interval_seconds: parse_or(vars, "RATE_LIMIT_RETRY_INTERVAL", 300)?,
            max_rate_limit_resumes: parse_or(vars, "MAX_RATE_LIMIT_RESUMES", 5)?,
            skills_enabled: bool_or(vars, "SKILLS_ENABLED", true)?,
            skills_dir,
            ci_wait_timeout_seconds: parse_or(vars, "CI_WAIT_TIMEOUT_SECONDS", 600)?,
            worktree_dir,
            db_path: PathBuf::from(string_or(vars, "DB_PATH", "swarm.db")),
            dashboard_port: parse_or(vars, "DASHBOARD_PORT", DEFAULT_DASHBOARD_PORT)?,
        })
    }

    /// Repository name component of the `owner/name` slug.
    pub fn repo_name(&self) -> &str {
        self.github_repo
            .rsplit('/')
            .next()
            .unwrap_or(&self.github_repo)
    }

    /// Multi-line configuration summary with secrets redacted, printed to
    /// stderr at startup.
    pub fn redacted_summary(&self) -> String {
        let mut out = String::from("=== swarm configuration ===\n");
        out.push_str(&format!("  GITHUB_REPO:           {}\n", self.github_repo));
        out.push_str(&format!("  BASE_BRANCH:           {}\n", self.base_branch));
        out.push_str(&format!(
            "  TARGET_REPO_PATH:      {}\n",
            self.target_repo_path.display()
        ));
        out.push_str(&format!(
            "  WORKTREE_DIR:          {}\n",
            self.worktree_dir.display()
        ));
        out.push_str(&format!("  DB_PATH:               {}\n", self.db_path.display()));
        out.push_str(&format!(
            "  POLL_INTERVAL:         {}s\n",
            self.poll_interval_seconds
        ));
        out.push_str(&format!("  ISSUE_LABEL:           {}\n", self.issue_label));
        out.push_str(&format!(
            "  TRIGGER_MENTION:       {}\n",
            if self.trigger_mention.is_empty() {
                "(disabled - immediate pickup)"
            } else {
                self.trigger_mention.as_str()
            }
        ));
        out.push_str(&format!(
            "  MAX_CONCURRENT_AGENTS: {}\n",
            self.max_concurrent_agents
        ));
        out.push_str(&format!(
            "  MAX_TURNS (implement): {}\n",
            self.agent_max_turns_implement
        ));
        out.push_str(&format!(
            "  MAX_TURNS (fix):       {}\n",
            self.agent_max_turns_fix
        ));
        out.push_str(&format!(
            "  AGENT_TIMEOUT:         {}s\n",
            self.agent_timeout_seconds
        ));
        out.push_str(&format!(
            "  PR_POLL_INTERVAL:      {}s\n",
            self.pr_poll_interval_seconds
        ));
        out.push_str(&format!(
            "  MAX_PR_FIX_RETRIES:    {}\n",
            self.max_pr_fix_retries
        ));
        out.push_str(&format!(
            "  RATE_LIMIT_RETRY:      {}s\n",
            self.rate_limit_retry_interval_seconds
        ));
        out.push_str(&format!(
            "  MAX_RATE_RESUMES:      {}\n",
            self.max_rate_limit_resumes
        ));
        out.push_str(&format!("  SKILLS_ENABLED:        {}\n", self.skills_enabled));
        out.push_str(&format!("  DASHBOARD_PORT:        {}\n", self.dashboard_port));
        out.push_str(&format!(
            "  CLAUDE_TOKEN:          {}\n",
            redact(&self.claude_token, 12)
        ));
        out.push_str(&format!(
            "  GH_TOKEN:              {}\n",
            redact(&self.gh_token, 8)
        ));
        out.push_str("===========================");
        out
    }
}

fn default_worktree_dir(target_repo_path: &std::path::Path) -> PathBuf {
    let name = target_repo_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "repo".to_string());
    let parent = target_repo_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    parent.join(format!("{name}-worktrees"))
}

fn default_skills_dir(vars: &HashMap<String, String>) -> PathBuf {
    let home = vars.get("HOME").cloned().unwrap_or_else(|| ".".to_string());
    PathBuf::from(home).join(".claude").join("skills")
}

fn redact(secret: &str, keep: usize) -> String {
    if secret.is_empty() {
        "(not set)".to_string()
    } else {
        let visible: String = secret.chars().take(keep).collect();
        format!("{visible}...")
    }
}

fn require(vars: &HashMap<String, String>, name: &'static str) -> Result<String, ConfigError> {
    match vars.get(name) {
        Some(value) if !value.trim().is_empty() => Ok(value.clone()),
        _ => Err(ConfigError::MissingVar { name }),
    }
}

fn string_or(vars: &HashMap<String, String>, name: &str, default: &str) -> String {
    match vars.get(name) {
        Some(value) if !value.trim().is_empty() => value.clone(),
        _ => default.to_string(),
    }
}

fn bool_or(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "" => Ok(default),
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                name,
                value: value.clone(),
                expected: "true or false",
            }),
        },
    }
}

fn parse_or<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value.trim().parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name,
            value: value.clone(),
            expected: "integer",
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn required_vars() -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(
            "CLAUDE_CODE_OAUTH_TOKEN".to_string(),
            "sk-ant-oat01-secret".to_string(),
        );
        vars.insert("GH_TOKEN".to_string(), "ghp_secret".to_string());
        vars.insert("GITHUB_REPO".to_string(), "acme/widgets".to_string());
        vars.insert("TARGET_REPO_PATH".to_string(), "/srv/widgets".to_string());
        vars
    }

    #[test]
    fn from_vars_applies_documented_defaults() {
        let config = SwarmConfig::from_vars(&required_vars()).expect("config");
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.max_concurrent_agents, 3);
        assert_eq!(config.agent_max_turns_implement, 30);
        assert_eq!(config.agent_max_turns_fix, 20);
        assert_eq!(config.agent_timeout_seconds, 1_800);
        assert_eq!(config.poll_interval_seconds, 300);
        assert_eq!(config.pr_poll_interval_seconds, 120);
        assert_eq!(config.issue_label, "agent");
        assert_eq!(config.trigger_mention, "@claude-swarm");
        assert_eq!(config.max_issue_retries, 3);
        assert_eq!(config.max_pr_fix_retries, 5);
        assert_eq!(config.rate_limit_retry_interval_seconds, 300);
        assert_eq!(config.max_rate_limit_resumes, 5);
        assert!(config.skills_enabled);
        assert_eq!(config.dashboard_port, 8420);
    }

    #[test]
    fn from_vars_reports_each_missing_required_var() {
        for name in [
            "CLAUDE_CODE_OAUTH_TOKEN",
            "GH_TOKEN",
            "GITHUB_REPO",
            "TARGET_REPO_PATH",
        ] {
            let mut vars = required_vars();
            vars.remove(name);
            let err = SwarmConfig::from_vars(&vars).expect_err("missing var should fail");
            assert!(err.to_string().contains(name), "error should name {name}");
        }
    }

    #[test]
    fn from_vars_rejects_repo_slug_without_owner() {
        let mut vars = required_vars();
        vars.insert("GITHUB_REPO".to_string(), "widgets".to_string());
        let err = SwarmConfig::from_vars(&vars).expect_err("bad slug");
        assert!(matches!(err, ConfigError::InvalidValue { name, .. } if name == "GITHUB_REPO"));
    }

    #[test]
    fn from_vars_rejects_non_numeric_overrides() {
        let mut vars = required_vars();
        vars.insert("MAX_CONCURRENT_AGENTS".to_string(), "lots".to_string());
        let err = SwarmConfig::from_vars(&vars).expect_err("bad number");
        assert!(
            matches!(err, ConfigError::InvalidValue { name, .. } if name == "MAX_CONCURRENT_AGENTS")
        );
    }

    #[test]
    fn empty_trigger_mention_is_preserved_as_disabled_gate() {
        let mut vars = required_vars();
        vars.insert("TRIGGER_MENTION".to_string(), String::new());
        let config = SwarmConfig::from_vars(&vars).expect("config");
        assert!(config.trigger_mention.is_empty());
        assert!(config.redacted_summary().contains("disabled"));
    }

    #[test]
    fn worktree_dir_defaults_to_sibling_of_target_repo() {
        let config = SwarmConfig::from_vars(&required_vars()).expect("config");
        assert_eq!(config.worktree_dir, PathBuf::from("/srv/widgets-worktrees"));
    }

    #[test]
    fn worktree_dir_override_wins() {
        let mut vars = required_vars();
        vars.insert("WORKTREE_DIR".to_string(), "/tmp/wt".to_string());
        let config = SwarmConfig::from_vars(&vars).expect("config");
        assert_eq!(config.worktree_dir, PathBuf::from("/tmp/wt"));
    }

    #[test]
    fn skills_enabled_parses_common_spellings() {
        for (raw, expected) in [("true", true), ("1", true), ("FALSE", false), ("no", false)] {
            let mut vars = required_vars();
            vars.insert("SKILLS_ENABLED".to_string(), raw.to_string());
            let config = SwarmConfig::from_vars(&vars).expect("config");
            assert_eq!(config.skills_enabled, expected, "raw={raw}");
        }
    }

    #[test]
    fn redacted_summary_never_contains_full_secrets() {
        let config = SwarmConfig::from_vars(&required_vars()).expect("config");
        let summary = config.redacted_summary();
        assert!(!summary.contains("sk-ant-oat01-secret"));
        assert!(!summary.contains("ghp_secret"));
        assert!(summary.contains("acme/widgets"));
    }

    #[test]
    fn repo_name_strips_owner_prefix() {
        let config = SwarmConfig::from_vars(&required_vars()).expect("config");
        assert_eq!(config.repo_name(), "widgets");
    }
}
