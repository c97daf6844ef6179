//! Cooperative shutdown shared by every control loop.
//!
//! Signal handlers may only touch the static flag; loops poll it through
//! `ShutdownFlag`, which also carries a local flag so tests can trigger
//! shutdown without sending real signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

static SIGNALLED: AtomicBool = AtomicBool::new(false);

const WAIT_SLICE: Duration = Duration::from_millis(250);

extern "C" fn handle_signal(_signal: libc::c_int) {
    SIGNALLED.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that request shutdown.
pub fn install_signal_handlers() {
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
    }
}

#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag {
    local: Arc<AtomicBool>,
}

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.local.load(Ordering::SeqCst) || SIGNALLED.load(Ordering::SeqCst)
    }

    /// Request shutdown programmatically (tests, orderly teardown).
    pub fn request(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    /// Sleep up to `duration`, returning early once shutdown is requested.
    pub fn wait(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_set() {
                return;
            }
            std::thread::sleep(WAIT_SLICE.min(deadline.saturating_duration_since(Instant::now())));
        }
    }
}
