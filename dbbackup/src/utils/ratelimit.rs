//! Byte-rate limiting for archive I/O.
//!
//! Packaging runs next to a live database, so tar writes, part splitting and
//! source deletion all go through a [`RateLimiter`].

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const MB: u64 = 1024 * 1024;

/// Blocking token bucket measured in bytes per second. Zero means unlimited.
///
/// Shared by reference so one budget covers archive writes and source deletes.
#[derive(Debug)]
pub struct RateLimiter {
    bytes_per_sec: u64,
    window: Mutex<Window>,
}

#[derive(Debug)]
struct Window {
    start: Instant,
    consumed: u64,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            window: Mutex::new(Window {
                start: Instant::now(),
                consumed: 0,
            }),
        }
    }

    pub fn from_mb_per_sec(mb: u64) -> Self {
        Self::new(mb.saturating_mul(MB))
    }

    pub fn unlimited() -> Self {
        Self::new(0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bytes_per_sec == 0
    }

    /// Largest chunk worth handing to a single I/O call.
    pub fn chunk_size(&self) -> usize {
        if self.is_unlimited() {
            (8 * MB) as usize
        } else {
            self.bytes_per_sec.clamp(64 * 1024, 8 * MB) as usize
        }
    }

    /// Account for `bytes` and sleep until the running rate is back under the ceiling.
    pub fn acquire(&self, bytes: u64) {
        if self.is_unlimited() {
            return;
        }
        let mut window = self.window.lock().unwrap_or_else(|e| e.into_inner());
        window.consumed += bytes;
        let expected = Duration::from_secs_f64(window.consumed as f64 / self.bytes_per_sec as f64);
        let elapsed = window.start.elapsed();
        if expected > elapsed {
            std::thread::sleep(expected - elapsed);
        }
        // Restart the window periodically so an idle stretch can't bank a burst
        if window.start.elapsed() > Duration::from_secs(2) {
            window.start = Instant::now();
            window.consumed = 0;
        }
    }
}

/// `Write` adapter that charges every written byte to a limiter.
pub struct ThrottledWriter<'a, W: Write> {
    inner: W,
    limiter: &'a RateLimiter,
    written: u64,
}

impl<'a, W: Write> ThrottledWriter<'a, W> {
    pub fn new(inner: W, limiter: &'a RateLimiter) -> Self {
        Self {
            inner,
            limiter,
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

impl<W: Write> Write for ThrottledWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let take = buf.len().min(self.limiter.chunk_size());
        let n = self.inner.write(&buf[..take])?;
        self.written += n as u64;
        self.limiter.acquire(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy at most `limit` bytes (all when `None`) from `reader` to `writer` under the limiter.
pub fn copy_throttled<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
    limiter: &RateLimiter,
    limit: Option<u64>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; limiter.chunk_size()];
    let mut copied = 0u64;
    loop {
        let want = match limit {
            Some(max) if copied >= max => break,
            Some(max) => ((max - copied) as usize).min(buf.len()),
            None => buf.len(),
        };
        let n = reader.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        copied += n as u64;
        limiter.acquire(n as u64);
    }
    Ok(copied)
}

/// Delete a file by shrinking it step by step before unlinking, so a large
/// delete doesn't turn into one burst of filesystem work.
pub fn remove_file_throttled(path: &Path, limiter: &RateLimiter) -> io::Result<()> {
    if !limiter.is_unlimited() {
        let file: File = OpenOptions::new().write(true).open(path)?;
        let mut len = file.metadata()?.len();
        let step = limiter.chunk_size() as u64;
        while len > step {
            len -= step;
            file.set_len(len)?;
            limiter.acquire(step);
        }
    }
    std::fs::remove_file(path)
}
