//! SIGINT/SIGTERM become a cooperative shutdown flag that the run loop
//! polls and forwards to the core's cancel token.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SigHandler, Signal};

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);

pub fn shutdown_requested() -> bool {
    SHUTDOWN_FLAG.load(Ordering::SeqCst)
}

/// Arrange for SIGINT and SIGTERM to request a shutdown. The handler
/// resets its own disposition, so repeating the signal ends the process
/// immediately instead of waiting for cooperative teardown.
pub fn listen_for_shutdown() {
    for sig in [Signal::SIGINT, Signal::SIGTERM] {
        // Safety: on_signal is async-signal-safe (an atomic store and a
        // disposition reset).
        if let Err(e) = unsafe { signal::signal(sig, SigHandler::Handler(on_signal)) } {
            tracing::warn!("cannot install {sig} handler: {e}");
        }
    }
}

extern "C" fn on_signal(raw: i32) {
    SHUTDOWN_FLAG.store(true, Ordering::SeqCst);
    if let Ok(sig) = Signal::try_from(raw) {
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
}
