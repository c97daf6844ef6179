use std::env;
use std::process::Command;
use std::sync::Arc;
use std::thread;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use swarm_agents::{pid_is_alive, AgentCli};
use swarm_core::{ConfigError, SwarmConfig};
use swarm_git::{is_git_repo, Git, WorktreeManager};
use swarm_github::{GhCli, GithubClient};
use swarmd::shutdown::install_signal_handlers;
use swarmd::{
    recover_stale_agents, AgentPool, DashboardData, IssuePoller, PoolOptions, PrMonitor,
    RateLimitStats, RateLimitWatcher, ShutdownFlag, SqliteStore, StoreError, StoreHandle,
};

#[derive(Debug, Clone, PartialEq, Eq)]
struct CliArgs {
    /// Run startup, recovery, and a single poll tick, then exit.
    once: bool,
}

#[derive(Debug, thiserror::Error)]
enum MainError {
    #[error("{0}")]
    Args(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("environment validation failed:\n{0}")]
    Environment(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("startup recovery failed: {0}")]
    Recovery(StoreError),
    #[error("poll tick failed: {0}")]
    Poll(String),
}

fn main() {
    if let Err(err) = run() {
        eprintln!("swarmd startup failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), MainError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut argv = env::args();
    let program = argv.next().unwrap_or_else(|| "swarmd".to_string());
    let args = parse_cli_args(argv.collect::<Vec<_>>(), &program)?;

    let config = SwarmConfig::from_env()?;
    eprintln!("{}", config.redacted_summary());

    let issues = validate_environment(&config);
    if !issues.is_empty() {
        return Err(MainError::Environment(
            issues
                .iter()
                .map(|issue| format!("  - {issue}"))
                .collect::<Vec<_>>()
                .join("\n"),
        ));
    }
    info!("environment validation passed");

    let store = SqliteStore::open(&config.db_path)?;
    store.migrate()?;
    let store = StoreHandle::new(store);
    info!(path = %config.db_path.display(), "state store ready");

    let git = Git::default();
    let worktrees = WorktreeManager::new(
        git.clone(),
        config.target_repo_path.clone(),
        config.worktree_dir.clone(),
    );
    let report = recover_stale_agents(&store, &worktrees, pid_is_alive)
        .map_err(MainError::Recovery)?;
    info!(?report, "startup recovery complete");

    let github = GithubClient::new(GhCli::new(config.gh_token.clone()), config.github_repo.clone());
    let cli = AgentCli::new("claude", config.skills_enabled);
    let stats = Arc::new(RateLimitStats::default());
    let pool = AgentPool::new(
        config.clone(),
        store.clone(),
        github.clone(),
        cli.clone(),
        Arc::clone(&stats),
        PoolOptions::default(),
    );

    let poller = IssuePoller::new(config.clone(), store.clone(), github.clone(), pool.clone());

    if args.once {
        let summary = poller.tick().map_err(|err| MainError::Poll(err.to_string()))?;
        info!(?summary, "single poll tick complete (--once)");
        return Ok(());
    }

    install_signal_handlers();
    let shutdown = ShutdownFlag::new();

    // Dashboard on its own thread with its own runtime.
    let dashboard = DashboardData::new(store.clone(), Arc::clone(&stats));
    let dashboard_bind = format!("0.0.0.0:{}", config.dashboard_port);
    let dashboard_shutdown = shutdown.clone();
    let dashboard_thread = thread::Builder::new()
        .name("dashboard".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    error!(error = %err, "failed to build dashboard runtime");
                    return;
                }
            };
            let stop = async move {
                loop {
                    if dashboard_shutdown.is_set() {
                        break;
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(250)).await;
                }
            };
            if let Err(err) =
                runtime.block_on(swarm_web::serve(&dashboard_bind, Arc::new(dashboard), stop))
            {
                error!(error = %err, "dashboard server failed");
            }
        })
        .ok();
    info!(port = config.dashboard_port, "dashboard started");

    let monitor = PrMonitor::new(config.clone(), store.clone(), github.clone(), pool.clone());
    let monitor_shutdown = shutdown.clone();
    let monitor_thread = thread::Builder::new()
        .name("pr-monitor".to_string())
        .spawn(move || monitor.run(&monitor_shutdown))
        .ok();

    let watcher = RateLimitWatcher::new(config.clone(), store.clone(), pool.clone(), cli);
    let watcher_shutdown = shutdown.clone();
    let watcher_thread = thread::Builder::new()
        .name("rate-limit-watcher".to_string())
        .spawn(move || watcher.run(&watcher_shutdown))
        .ok();

    info!(
        interval_secs = config.poll_interval_seconds,
        port = config.dashboard_port,
        "swarm orchestrator running"
    );

    // The issue poller owns the main thread until shutdown.
    poller.run(&shutdown);

    info!("shutting down");
    pool.shutdown();
    for handle in [monitor_thread, watcher_thread, dashboard_thread]
        .into_iter()
        .flatten()
    {
        let _ = handle.join();
    }
    info!("swarm orchestrator stopped");
    Ok(())
}

/// Fail fast with actionable messages before any loop starts.
fn validate_environment(config: &SwarmConfig) -> Vec<String> {
    let mut issues = Vec::new();

    if !config.target_repo_path.exists() {
        issues.push(format!(
            "TARGET_REPO_PATH does not exist: {}",
            config.target_repo_path.display()
        ));
    } else if !is_git_repo(&Git::default(), &config.target_repo_path) {
        issues.push(format!(
            "TARGET_REPO_PATH is not a git repository: {}",
            config.target_repo_path.display()
        ));
    }

    for tool in ["git", "gh", "claude"] {
        if !tool_available(tool) {
            issues.push(format!("'{tool}' not found in PATH"));
        }
    }

    if tool_available("gh") {
        let github = GithubClient::new(GhCli::new(config.gh_token.clone()), config.github_repo.clone());
        if let Err(err) = github.auth_status() {
            issues.push(format!("gh auth check failed: {err}"));
        }
    }

    issues
}

fn tool_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn parse_cli_args(args: Vec<String>, program: &str) -> Result<CliArgs, MainError> {
    let mut parsed = CliArgs { once: false };
    for arg in &args {
        match arg.as_str() {
            "--help" | "-h" => return Err(MainError::Args(usage(program))),
            "--once" => parsed.once = true,
            other => {
                return Err(MainError::Args(format!(
                    "unknown argument: {other}\n\n{}",
                    usage(program)
                )))
            }
        }
    }
    Ok(parsed)
}

fn usage(program: &str) -> String {
    format!(
        "Usage: {program} [--once]\n\
         Configuration comes from the environment; see the README table.\n\
         --once  run startup, recovery, and a single poll tick, then exit"
    )
}

#[cfg(test)]
mod tests {
    use super::{parse_cli_args, usage, CliArgs};

    #[test]
    fn parse_cli_args_defaults_to_daemon_mode() {
        let parsed = parse_cli_args(Vec::new(), "swarmd").expect("parse");
        assert_eq!(parsed, CliArgs { once: false });
    }

    #[test]
    fn parse_cli_args_accepts_once() {
        let parsed = parse_cli_args(vec!["--once".to_string()], "swarmd").expect("parse");
        assert!(parsed.once);
    }

    #[test]
    fn parse_cli_args_rejects_unknown_flags_with_usage() {
        let err = parse_cli_args(vec!["--bogus".to_string()], "swarmd").expect_err("should fail");
        let rendered = err.to_string();
        assert!(rendered.contains("unknown argument: --bogus"));
        assert!(rendered.contains("Usage: swarmd"));
    }

    #[test]
    fn parse_cli_args_help_returns_usage() {
        let err = parse_cli_args(vec!["--help".to_string()], "swarmd").expect_err("help");
        assert_eq!(err.to_string(), usage("swarmd"));
    }
}
