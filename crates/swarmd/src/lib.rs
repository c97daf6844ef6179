//! swarmd — the orchestrator daemon.
//!
//! Control loops (issue poller, PR monitor, rate-limit watcher) coordinate
//! exclusively through the SQLite state store; the supervisor owns the live
//! agent processes; the dashboard is a read-only view embedded on its own
//! thread.

pub mod dashboard;
pub mod issue_poller;
pub mod pr_monitor;
pub mod prompts;
pub mod rate_limit_watcher;
pub mod recovery;
pub mod shutdown;
pub mod skills;
pub mod store;
pub mod supervisor;

pub use dashboard::DashboardData;
pub use issue_poller::IssuePoller;
pub use pr_monitor::PrMonitor;
pub use rate_limit_watcher::RateLimitWatcher;
pub use recovery::recover_stale_agents;
pub use shutdown::ShutdownFlag;
pub use store::{SqliteStore, StoreError, StoreHandle};
pub use supervisor::{AgentPool, PoolOptions, RateLimitStats, SupervisorError};
