//! External process lifecycle: spawn, bounded capture, cancellation.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{FerryError, Result};

/// Cap on captured stderr; anything past it is discarded and marked.
pub const STDERR_CAP: usize = 64 * 1024;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace interval between SIGTERM and SIGKILL on cancellation.
pub const KILL_GRACE: Duration = Duration::from_secs(10);

/// Cooperative cancellation flag shared across the run.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FerryError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }
}

/// Probe that a binary exists and answers `--version`.
pub fn probe_binary(bin: &str) -> Result<()> {
    let status = Command::new(bin)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|_| FerryError::PrereqMissing(bin.to_string()))?;
    debug!(bin, code = status.code(), "binary probe");
    Ok(())
}

/// Drain a stderr pipe on a helper thread, keeping at most [`STDERR_CAP`]
/// bytes. Reading on a thread avoids pipe-buffer deadlock for chatty tools.
pub fn capture_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    let mut pipe = child.stderr.take()?;
    Some(std::thread::spawn(move || {
        let mut kept = Vec::with_capacity(4096);
        let mut truncated = false;
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if kept.len() < STDERR_CAP {
                        let room = STDERR_CAP - kept.len();
                        kept.extend_from_slice(&buf[..n.min(room)]);
                        if n > room {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
                Err(_) => break,
            }
        }
        let mut out = String::from_utf8_lossy(&kept).into_owned();
        if truncated {
            out.push_str("\n... [stderr truncated]");
        }
        out
    }))
}

/// Wait for a child, polling the cancel token. On cancellation the child is
/// signalled with SIGTERM, given [`KILL_GRACE`], then killed.
pub fn wait_cancellable(child: &mut Child, cancel: &CancelToken) -> Result<ExitStatus> {
    let mut term_sent_at: Option<Instant> = None;

    loop {
        if let Some(status) = child.try_wait()? {
            if term_sent_at.is_some() {
                return Err(FerryError::Cancelled);
            }
            return Ok(status);
        }

        match term_sent_at {
            None if cancel.is_cancelled() => {
                let pid = Pid::from_raw(child.id() as i32);
                if let Err(e) = signal::kill(pid, Signal::SIGTERM) {
                    warn!(pid = child.id(), "failed to signal child: {e}");
                }
                term_sent_at = Some(Instant::now());
            }
            Some(sent) if sent.elapsed() >= KILL_GRACE => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(FerryError::Cancelled);
            }
            _ => {}
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Run a configured command to completion with stderr bounded-captured and
/// stdout collected when the caller piped it.
pub fn run_cmd(cmd: &mut Command, cancel: &CancelToken) -> Result<CmdOutput> {
    cancel.check()?;
    cmd.stdin(Stdio::null()).stderr(Stdio::piped());

    let mut child = cmd.spawn()?;
    let stderr_handle = capture_stderr(&mut child);

    // Drain piped stdout concurrently as well; a full pipe would wedge the
    // child before try_wait ever sees it exit.
    let stdout_handle = child.stdout.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    });

    let waited = wait_cancellable(&mut child, cancel);
    let stderr = stderr_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();
    let stdout = stdout_handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    Ok(CmdOutput {
        status: waited?,
        stdout,
        stderr,
    })
}
