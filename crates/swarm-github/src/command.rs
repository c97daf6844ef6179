use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::GithubError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Runner for the `gh` binary. Every invocation carries the hosting-service
/// token in its environment; nothing else about the caller's env is touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GhCli {
    pub binary: PathBuf,
    token: String,
}

impl GhCli {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            binary: PathBuf::from("gh"),
            token: token.into(),
        }
    }

    pub fn with_binary(binary: impl Into<PathBuf>, token: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            token: token.into(),
        }
    }

    pub fn run<I, S>(&self, args: I) -> Result<GhOutput, GithubError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let owned_args: Vec<OsString> = args
            .into_iter()
            .map(|arg| arg.as_ref().to_os_string())
            .collect();

        let mut command = Command::new(&self.binary);
        command.env("GH_TOKEN", &self.token);
        for arg in &owned_args {
            command.arg(arg);
        }

        let rendered = render_command(&self.binary, &owned_args);
        let output = command.output().map_err(|source| GithubError::Io {
            command: rendered.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(GithubError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(GhOutput { stdout, stderr })
    }
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::GhCli;
    use crate::error::GithubError;

    #[test]
    fn run_classifies_missing_binary_as_io_error() {
        let gh = GhCli::with_binary("/definitely/missing/gh-binary", "token");
        let err = gh.run(["auth", "status"]).expect_err("missing binary");
        match err {
            GithubError::Io { command, source } => {
                assert!(command.contains("/definitely/missing/gh-binary"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected Io, got {other:?}"),
        }
    }

    #[test]
    fn run_classifies_non_zero_exit_as_command_failed() {
        // `false` ignores its arguments and exits 1, standing in for gh.
        let gh = GhCli::with_binary("false", "token");
        let err = gh.run(["pr", "list"]).expect_err("non-zero exit");
        match err {
            GithubError::CommandFailed { command, status, .. } => {
                assert!(command.contains("pr list"));
                assert_eq!(status, Some(1));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn run_returns_stdout_on_success() {
        // `echo` stands in for gh; first arg appears on stdout.
        let gh = GhCli::with_binary("echo", "token");
        let output = gh.run(["hello-from-gh"]).expect("echo succeeds");
        assert_eq!(output.stdout.trim(), "hello-from-gh");
    }
}
