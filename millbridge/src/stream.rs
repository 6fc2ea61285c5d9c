//! Byte-stream adapter the transfer engine runs on.
//!
//! The XMODEM engine never touches a socket directly. It speaks to a
//! [`ByteStream`]: two blocking calls with per-call timeouts. Keeping
//! the timing and error conversion inside the adapter lets the engine
//! stay straight-line code over a byte interface.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use log::trace;

/// Blocking byte transport with per-call timeouts.
///
/// Contract:
///
/// - `get` returns **exactly** `size` bytes or `None`. A short read
///   inside the timeout window counts as failure; the engine relies on
///   this to detect framing damage. I/O errors never escape, they
///   become `None`.
/// - `put` returns the number of bytes written, or `None` on a
///   send-side timeout or error.
///
/// Timeouts are ordinary outcomes, not errors; the caller retries.
pub trait ByteStream {
    /// Read exactly `size` bytes, or `None` on timeout / short read.
    fn get(&mut self, size: usize, timeout: Duration) -> Option<Vec<u8>>;

    /// Write `data`, returning bytes written or `None` on timeout.
    fn put(&mut self, data: &[u8], timeout: Duration) -> Option<usize>;
}

/// [`ByteStream`] over a TCP socket.
///
/// Borrows the socket for the duration of a transfer; the session gets
/// it back (with its own timeouts restored) once the engine returns.
pub struct TcpByteStream<'a> {
    stream: &'a mut TcpStream,
}

/// Floor for per-read socket timeouts; `set_read_timeout` rejects zero.
const MIN_SLICE: Duration = Duration::from_millis(1);

impl<'a> TcpByteStream<'a> {
    /// Wrap an already-connected socket.
    pub fn new(stream: &'a mut TcpStream) -> Self {
        Self { stream }
    }
}

impl ByteStream for TcpByteStream<'_> {
    fn get(&mut self, size: usize, timeout: Duration) -> Option<Vec<u8>> {
        if size == 0 {
            return Some(Vec::new());
        }

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; size];
        let mut filled = 0;

        while filled < size {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                trace!("get: timeout with {filled}/{size} bytes");
                return None;
            }
            if self
                .stream
                .set_read_timeout(Some(remaining.max(MIN_SLICE)))
                .is_err()
            {
                return None;
            }

            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    trace!("get: peer closed with {filled}/{size} bytes");
                    return None;
                }
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::TimedOut
                        || e.kind() == std::io::ErrorKind::WouldBlock =>
                {
                    // Loop; the deadline check above decides when to give up.
                }
                Err(e) => {
                    trace!("get: read error: {e}");
                    return None;
                }
            }
        }

        Some(buf)
    }

    fn put(&mut self, data: &[u8], timeout: Duration) -> Option<usize> {
        if self
            .stream
            .set_write_timeout(Some(timeout.max(MIN_SLICE)))
            .is_err()
        {
            return None;
        }

        match self.stream.write_all(data).and_then(|()| self.stream.flush()) {
            Ok(()) => Some(data.len()),
            Err(e) => {
                trace!("put: write error: {e}");
                None
            }
        }
    }
}
