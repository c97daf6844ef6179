//! Detached child-process plumbing.
//!
//! Agents are spawned into their own process group so they survive
//! orchestrator restarts; startup recovery probes recorded pids and the
//! timeout path escalates SIGTERM → SIGKILL with a grace window.

use std::io;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::Duration;

use tracing::warn;
use wait_timeout::ChildExt;

use crate::invocation::AgentCommand;

/// Spawn the agent detached: own process group, stdout/stderr piped for the
/// readers, stdin closed.
pub fn spawn_detached(
    command: &AgentCommand,
    cwd: &Path,
    env: &[(String, String)],
) -> io::Result<Child> {
    let mut cmd = Command::new(&command.executable);
    cmd.args(&command.args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    cmd.spawn()
}

/// Whether a process with this pid is still alive on the host.
pub fn pid_is_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        // Signal 0 probes existence without delivering anything.
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Stop a child: SIGTERM first, then SIGKILL after the grace window.
/// Returns the final exit status.
pub fn terminate_gracefully(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    let pid = child.id();

    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if rc != 0 {
            warn!(pid, "SIGTERM delivery failed, escalating to kill");
        }
    }

    if let Some(status) = child.wait_timeout(grace)? {
        return Ok(status);
    }

    warn!(pid, "process ignored SIGTERM, sending SIGKILL");
    child.kill()?;
    child.wait()
}
