//! Background watcher that resumes rate-limited agents once upstream
//! capacity returns.

use std::process::{Command, Stdio};
use std::time::Duration;

use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use swarm_agents::{has_rate_limit_signature, AgentCli};
use swarm_core::SwarmConfig;

use crate::shutdown::ShutdownFlag;
use crate::skills::discover_skills;
use crate::store::StoreHandle;
use crate::supervisor::AgentPool;

const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct RateLimitWatcher {
    config: SwarmConfig,
    store: StoreHandle,
    pool: AgentPool,
    cli: AgentCli,
}

impl RateLimitWatcher {
    pub fn new(config: SwarmConfig, store: StoreHandle, pool: AgentPool, cli: AgentCli) -> Self {
        Self {
            config,
            store,
            pool,
            cli,
        }
    }

    /// Blocking loop; returns when shutdown is requested.
    pub fn run(&self, shutdown: &ShutdownFlag) {
        info!(
            interval_secs = self.config.rate_limit_retry_interval_seconds,
            "rate limit watcher started"
        );
        let interval = Duration::from_secs(self.config.rate_limit_retry_interval_seconds);
        while !shutdown.is_set() {
            match self.tick_with_probe(|| self.probe_available()) {
                Ok(resumed) if resumed > 0 => info!(resumed, "resumed rate-limited agents"),
                Ok(_) => {}
                Err(err) => warn!(error = %err, "rate limit watcher tick failed"),
            }
            shutdown.wait(interval);
        }
        info!("rate limit watcher stopped");
    }

    /// One watcher cycle with an injectable availability probe. A failed
    /// probe resumes nothing.
    pub fn tick_with_probe(
        &self,
        probe: impl FnOnce() -> bool,
    ) -> Result<usize, crate::supervisor::SupervisorError> {
        let limited = self.store.with(|s| s.rate_limited_agents())?;
        if limited.is_empty() {
            return Ok(0);
        }

        info!(count = limited.len(), "probing upstream availability");
        if !probe() {
            info!("still rate-limited upstream, will retry next interval");
            return Ok(0);
        }

        let skills = if self.config.skills_enabled {
            discover_skills(&self.config.skills_dir)
        } else {
            Vec::new()
        };

        let mut resumed = 0;
        for run in &limited {
            match self.pool.resume_rate_limited(run, &skills) {
                Ok(Some(new_id)) => {
                    info!(old = %run.agent_id, new = %new_id, "agent resumed");
                    resumed += 1;
                }
                Ok(None) => {
                    debug!(agent = %run.agent_id, "resume deferred or run concluded");
                }
                Err(err) => {
                    warn!(agent = %run.agent_id, error = %err, "resume failed");
                }
            }
        }
        Ok(resumed)
    }

    /// One-shot trivial agent invocation. Exit 0 means capacity is back; a
    /// rate-limit signature on stderr means it is not; any other failure is
    /// assumed unrelated to limits.
    fn probe_available(&self) -> bool {
        let command = self.cli.probe_command();
        let mut child = match Command::new(&command.executable)
            .args(&command.args)
            .env("CLAUDE_CODE_OAUTH_TOKEN", &self.config.claude_token)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                debug!(error = %err, "availability probe failed to spawn");
                return false;
            }
        };

        let status = match child.wait_timeout(PROBE_TIMEOUT) {
            Ok(Some(status)) => status,
            Ok(None) => {
                debug!("availability probe timed out, assuming still limited");
                let _ = child.kill();
                let _ = child.wait();
                return false;
            }
            Err(err) => {
                debug!(error = %err, "availability probe wait failed");
                return false;
            }
        };

        if status.success() {
            return true;
        }

        let stderr = child
            .stderr
            .take()
            .map(|mut stream| {
                use std::io::Read;
                let mut text = String::new();
                let _ = stream.read_to_string(&mut text);
                text
            })
            .unwrap_or_default();
        !has_rate_limit_signature(&stderr)
    }
}
