//! Byte-rate limiting for local packing and per-storage uploads.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::{FerryError, Result};

#[derive(Debug)]
struct Window {
    opened: Instant,
    bytes: u64,
}

/// Byte-rate limiter: callers report what they moved and the limiter
/// sleeps until the running average falls back under the cap. A cap of 0
/// disables throttling.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            window: Mutex::new(Window {
                opened: Instant::now(),
                bytes: 0,
            }),
        }
    }

    pub fn shared(bytes_per_sec: u64) -> Option<Arc<Self>> {
        (bytes_per_sec > 0).then(|| Arc::new(Self::new(bytes_per_sec)))
    }

    /// How long the window must have been open to carry `bytes` at the cap.
    fn pace(&self, bytes: u64) -> Duration {
        let micros = bytes as u128 * 1_000_000 / self.bytes_per_sec as u128;
        Duration::from_micros(micros.min(u64::MAX as u128) as u64)
    }

    pub fn consume(&self, bytes: usize) {
        if bytes == 0 || self.bytes_per_sec == 0 {
            return;
        }

        let mut win = self.window.lock().unwrap_or_else(|p| p.into_inner());
        win.bytes = win.bytes.saturating_add(bytes as u64);
        // Debt is whatever the pace says the window should have lasted,
        // minus what it actually has.
        let debt = self.pace(win.bytes).checked_sub(win.opened.elapsed());
        drop(win);

        if let Some(debt) = debt {
            std::thread::sleep(debt);
        }
    }
}

/// Read adaptor that blocks after each read to hold the configured rate.
pub struct LimitedReader<R> {
    inner: R,
    limiter: Option<Arc<RateLimiter>>,
}

impl<R> LimitedReader<R> {
    pub fn new(inner: R, limiter: Option<Arc<RateLimiter>>) -> Self {
        Self { inner, limiter }
    }
}

impl<R: Read> Read for LimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(limiter) = &self.limiter {
            limiter.consume(n);
        }
        Ok(n)
    }
}

/// Open a file for reading at no more than `bytes_per_sec`.
pub fn limited_file_reader(path: &Path, bytes_per_sec: u64) -> Result<LimitedReader<File>> {
    let file = File::open(path)?;
    Ok(LimitedReader::new(file, RateLimiter::shared(bytes_per_sec)))
}

/// Parse a human rate string ("500K", "1M", "2G", or plain bytes) into
/// bytes per second. Empty and "0" disable the limit.
pub fn parse_rate(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(0);
    }

    let (num_str, multiplier) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 1024u64),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| FerryError::Config(format!("invalid rate limit: '{s}'")))?;
    if num < 0.0 {
        return Err(FerryError::Config(format!("negative rate limit: '{s}'")));
    }
    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parse_rate_suffixes() {
        assert_eq!(parse_rate("0").unwrap(), 0);
        assert_eq!(parse_rate("").unwrap(), 0);
        assert_eq!(parse_rate("512").unwrap(), 512);
        assert_eq!(parse_rate("4K").unwrap(), 4096);
        assert_eq!(parse_rate("1M").unwrap(), 1024 * 1024);
        assert_eq!(parse_rate("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert!(parse_rate("fast").is_err());
        assert!(parse_rate("-1M").is_err());
    }

    #[test]
    fn unlimited_reader_passes_through() {
        let mut r = LimitedReader::new(Cursor::new(vec![7u8; 4096]), None);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out.len(), 4096);
    }

    #[test]
    fn limiter_throttles_to_configured_rate() {
        // 64 KiB at 256 KiB/s should take roughly 250 ms.
        let limiter = RateLimiter::shared(256 * 1024);
        let mut r = LimitedReader::new(Cursor::new(vec![0u8; 64 * 1024]), limiter);
        let start = Instant::now();
        let mut buf = [0u8; 8192];
        loop {
            if r.read(&mut buf).unwrap() == 0 {
                break;
            }
        }
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(180), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "too slow: {elapsed:?}");
    }

    #[test]
    fn pace_scales_with_bytes() {
        let limiter = RateLimiter::new(1024 * 1024);
        assert_eq!(limiter.pace(1024 * 1024), Duration::from_secs(1));
        assert_eq!(limiter.pace(512 * 1024), Duration::from_millis(500));
        assert_eq!(limiter.pace(0), Duration::ZERO);
    }

    #[test]
    fn zero_limit_never_sleeps() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        limiter.consume(100 * 1024 * 1024);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
