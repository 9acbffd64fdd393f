//! Terminator-delimited frame reader over any readable stream.
//!
//! A frame is every byte before the next [`TERMINATOR`]. Bytes that arrive
//! after a terminator stay buffered in the [`FrameReader`] and are served by
//! the next read, so two frames delivered in one chunk cost a single syscall.

use std::io::{self, Read};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::message::TERMINATOR;

/// Size of a single read from the underlying stream.
pub const CHUNK: usize = 512;

/// Upper bound on one blocking read; the overall deadline is re-checked
/// after each poll.
pub const POLL: Duration = Duration::from_secs(1);

/// A readable stream whose blocking read can be bounded.
pub trait TimedRead: Read {
    /// Sets the timeout applied to subsequent reads (`None` blocks forever).
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
}

impl TimedRead for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl TimedRead for std::os::unix::net::UnixStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        Self::set_read_timeout(self, timeout)
    }
}

/// Splits `buf` at the first terminator into `(payload, leftover)`.
pub fn split_frame(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    find_terminator(buf, 0).map(|(end, next)| (&buf[..end], &buf[next..]))
}

/// Incremental frame reader holding bytes not yet consumed.
#[derive(Debug, Default)]
pub struct FrameReader {
    /// Bytes received but not yet returned as part of a frame.
    buf: Vec<u8>,
}

impl FrameReader {
    /// Creates a reader with an empty buffer.
    pub const fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Bytes buffered after the last returned frame.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }

    /// Discards everything buffered.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Reads until a full frame is buffered and returns its payload.
    ///
    /// Fails with [`io::ErrorKind::TimedOut`] when no terminator shows up
    /// before `timeout` (the partial payload stays buffered) and with
    /// [`io::ErrorKind::UnexpectedEof`] when the peer closes the stream.
    pub fn read_frame<R: TimedRead + ?Sized>(
        &mut self,
        r: &mut R,
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        self.read_with(r, timeout, find_terminator)
    }

    /// Reads until `byte` is seen, consuming through it.
    ///
    /// Returns the bytes that preceded it. Used for single-byte handshakes
    /// that are not terminator-framed.
    pub fn read_until<R: TimedRead + ?Sized>(
        &mut self,
        r: &mut R,
        byte: u8,
        timeout: Duration,
    ) -> io::Result<Vec<u8>> {
        self.read_with(r, timeout, |buf, from| {
            buf[from..]
                .iter()
                .position(|&b| b == byte)
                .map(|i| (from + i, from + i + 1))
        })
    }

    /// Shared read loop. `find(buf, from)` reports `(payload_end, consumed)`
    /// for the first match at or after `from`.
    fn read_with<R, F>(&mut self, r: &mut R, timeout: Duration, find: F) -> io::Result<Vec<u8>>
    where
        R: TimedRead + ?Sized,
        F: Fn(&[u8], usize) -> Option<(usize, usize)>,
    {
        if let Some(cut) = find(&self.buf, 0) {
            return Ok(self.take(cut));
        }

        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; CHUNK];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no complete frame before deadline",
                ));
            }
            r.set_read_timeout(Some(remaining.min(POLL)))?;
            match r.read(&mut chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the stream",
                    ));
                }
                Ok(n) => {
                    let from = self.buf.len();
                    self.buf.extend_from_slice(&chunk[..n]);
                    if let Some(cut) = find(&self.buf, from) {
                        return Ok(self.take(cut));
                    }
                }
                Err(e) if is_poll_expiry(&e) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Removes `..consumed` from the buffer, returning `..end`.
    fn take(&mut self, (end, consumed): (usize, usize)) -> Vec<u8> {
        let payload = self.buf[..end].to_vec();
        self.buf.drain(..consumed);
        payload
    }
}

/// Finds the first terminator that ends at or after `from`.
///
/// Starts scanning `TERMINATOR.len() - 1` bytes early so a terminator split
/// across two chunks is still found.
fn find_terminator(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    let start = from.saturating_sub(TERMINATOR.len() - 1);
    buf.get(start..)?
        .windows(TERMINATOR.len())
        .position(|w| w == TERMINATOR)
        .map(|i| (start + i, start + i + TERMINATOR.len()))
}

/// Read timeouts surface as `WouldBlock` on Unix and `TimedOut` on Windows.
fn is_poll_expiry(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
