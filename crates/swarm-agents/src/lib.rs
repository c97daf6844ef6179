//! Interface to the external code-generation agent process: command-line
//! invocation shapes, the stream-json event parser, rate-limit signature
//! detection, and detached-process plumbing.

pub mod invocation;
pub mod process;
pub mod signal;
pub mod stream;

pub use invocation::{AgentCli, AgentCommand};
pub use process::{pid_is_alive, spawn_detached, terminate_gracefully};
pub use signal::{has_rate_limit_signature, is_rate_limit_failure, RATE_LIMIT_PATTERNS};
pub use stream::{
    extract_pr_number, parse_stream_line, ParsedEvent, PrNumberSource,
};
