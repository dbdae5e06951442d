use bytes::{Buf, BytesMut};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

// Once the staged output grows past this, push falls back to a bounded
// blocking flush so a stalled peer cannot make the buffer grow without limit.
const HIGH_WATER_MARK: usize = 1 << 20;

/// Byte buffer on the receive side of the socket.
///
/// The socket handle is shared with the session and the output sink; all
/// reads go through non-blocking `try_read` calls, so nothing here ever
/// holds the connection hostage. `take_exact` is the one place that waits,
/// and only up to the configured deadline.
pub struct InputSink {
    socket: Arc<TcpStream>,
    buf: BytesMut,
    io_timeout: Duration,
}

impl InputSink {
    pub(crate) fn new(socket: Arc<TcpStream>, leftover: BytesMut, io_timeout: Duration) -> Self {
        Self {
            socket,
            buf: leftover,
            io_timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Non-blocking fill from the socket. Returns whether any data is
    /// buffered afterwards, so a `false` right after a readiness signal
    /// means the peer is gone.
    pub fn try_fill(&mut self) -> bool {
        loop {
            match self.socket.try_read_buf(&mut self.buf) {
                Ok(0) => break, // EOF
                Ok(_) => continue,
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        !self.buf.is_empty()
    }

    /// Fill until `dst` can be served whole, waiting on socket readiness up
    /// to the deadline. Returns false on EOF, hard error or deadline, with
    /// the buffered bytes left untouched.
    pub async fn take_exact(&mut self, dst: &mut [u8]) -> bool {
        let deadline = Instant::now() + self.io_timeout;
        while self.buf.len() < dst.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match timeout(remaining, self.socket.ready(Interest::READABLE)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return false,
            }
            match self.socket.try_read_buf(&mut self.buf) {
                Ok(0) => return false, // EOF mid-read
                Ok(_) => {}
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {}
                Err(_) => return false,
            }
        }
        dst.copy_from_slice(&self.buf.split_to(dst.len()));
        true
    }

    /// Serve up to `dst.len()` bytes out of the staging buffer. Never
    /// touches the socket.
    pub fn take_at_most(&mut self, dst: &mut [u8]) -> usize {
        let n = dst.len().min(self.buf.len());
        dst[..n].copy_from_slice(&self.buf.split_to(n));
        n
    }
}

/// Byte buffer on the send side of the socket.
pub struct OutputSink {
    socket: Arc<TcpStream>,
    buf: BytesMut,
    io_timeout: Duration,
}

impl OutputSink {
    pub(crate) fn new(socket: Arc<TcpStream>, io_timeout: Duration) -> Self {
        Self {
            socket,
            buf: BytesMut::new(),
            io_timeout,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Stage bytes for delivery. Past the high-water mark this drains the
    /// buffer with a bounded blocking flush. A `false` return is fatal for
    /// the connection.
    pub async fn push(&mut self, bytes: &[u8]) -> bool {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() <= HIGH_WATER_MARK {
            return true;
        }
        self.flush_all().await
    }

    /// Write out as much of the staged buffer as the socket accepts right
    /// now. Returns false only on a hard error.
    pub fn try_flush(&mut self) -> bool {
        while !self.buf.is_empty() {
            match self.socket.try_write(&self.buf) {
                Ok(0) => return false,
                Ok(n) => self.buf.advance(n),
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => return false,
            }
        }
        true
    }

    /// Drain the staged buffer completely, waiting on writability up to the
    /// deadline.
    pub async fn flush_all(&mut self) -> bool {
        let deadline = Instant::now() + self.io_timeout;
        loop {
            if !self.try_flush() {
                return false;
            }
            if self.buf.is_empty() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match timeout(remaining, self.socket.ready(Interest::WRITABLE)).await {
                Ok(Ok(_)) => {}
                Ok(Err(_)) | Err(_) => return false,
            }
        }
    }
}
