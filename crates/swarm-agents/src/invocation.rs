//! Command-line shapes for the agent program.
//!
//! The orchestrator never passes a turn cap to work invocations: the
//! wall-clock timeout is the real safety net, and a turn cap would silently
//! stop an agent mid-feature. Only the availability probe is capped.

const BASE_ALLOWED_TOOLS: &str = "Read,Edit,Bash,Write,Glob,Grep";
const PROBE_PROMPT: &str = "Reply with just the word OK";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCommand {
    pub executable: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCli {
    pub executable: String,
    pub skills_enabled: bool,
}

impl Default for AgentCli {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            skills_enabled: true,
        }
    }
}

impl AgentCli {
    pub fn new(executable: impl Into<String>, skills_enabled: bool) -> Self {
        Self {
            executable: executable.into(),
            skills_enabled,
        }
    }

    fn allowed_tools(&self) -> String {
        if self.skills_enabled {
            format!("{BASE_ALLOWED_TOOLS},Skill")
        } else {
            BASE_ALLOWED_TOOLS.to_string()
        }
    }

    /// Invocation for implement and fix runs: prompt, tool allowlist,
    /// stream-json output, verbose logging.
    pub fn work_command(&self, prompt: &str) -> AgentCommand {
        AgentCommand {
            executable: self.executable.clone(),
            args: vec![
                "-p".to_string(),
                prompt.to_string(),
                "--allowedTools".to_string(),
                self.allowed_tools(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
        }
    }

    /// Invocation for resuming a rate-limited run in its preserved worktree.
    /// Attaches to the recorded session when one is known, otherwise falls
    /// back to generic continuation.
    pub fn resume_command(&self, prompt: &str, session_id: Option<&str>) -> AgentCommand {
        let mut args = Vec::new();
        match session_id {
            Some(session) => {
                args.push("--resume".to_string());
                args.push(session.to_string());
            }
            None => args.push("--continue".to_string()),
        }
        args.push("-p".to_string());
        args.push(prompt.to_string());
        args.push("--allowedTools".to_string());
        args.push(self.allowed_tools());
        args.push("--output-format".to_string());
        args.push("stream-json".to_string());
        args.push("--verbose".to_string());
        AgentCommand {
            executable: self.executable.clone(),
            args,
        }
    }

    /// Trivial one-shot invocation used by the rate-limit watcher to probe
    /// upstream availability.
    pub fn probe_command(&self) -> AgentCommand {
        AgentCommand {
            executable: self.executable.clone(),
            args: vec![
                "-p".to_string(),
                PROBE_PROMPT.to_string(),
                "--max-turns".to_string(),
                "1".to_string(),
            ],
        }
    }
}
