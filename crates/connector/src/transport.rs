//! Byte-stream transport under a session.
//!
//! All calls are non-blocking. `io::ErrorKind::WouldBlock` means "no progress
//! possible right now, wait for the next readiness event".

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::socket::{self, MsgFlags, Shutdown};
use tokio::io::Interest;
use tokio::net::UnixStream;

/// Non-blocking stream operations used by the session manager.
pub trait Transport: Send + Sync {
    /// Copy up to `buf.len()` pending bytes without consuming them.
    ///
    /// Returns `Ok(0)` once the peer has closed the stream.
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Consume up to `buf.len()` bytes. `Ok(0)` means end of stream.
    fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write some prefix of `data` and return its length.
    fn send(&self, data: &[u8]) -> io::Result<usize>;

    /// Shut down both directions. Idempotent.
    fn shutdown(&self);

    /// Whether [`shutdown`](Transport::shutdown) has been called.
    fn is_shutdown(&self) -> bool;

    /// Whether the peer has stopped sending. Bytes already buffered can
    /// still be read, but no more will arrive.
    fn is_read_closed(&self) -> bool;
}

/// Transport over a tokio Unix stream.
#[derive(Debug)]
pub struct UnixTransport {
    stream: UnixStream,
    closed: AtomicBool,
    read_closed: AtomicBool,
}

impl UnixTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            closed: AtomicBool::new(false),
            read_closed: AtomicBool::new(false),
        }
    }

    /// Wait until the stream is readable.
    ///
    /// Read-closed readiness is never cleared, so it is latched here for
    /// [`Transport::is_read_closed`].
    pub async fn readable(&self) -> io::Result<()> {
        let ready = self.stream.ready(Interest::READABLE).await?;
        if ready.is_read_closed() {
            self.read_closed.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Wait until the stream is writable.
    pub async fn writable(&self) -> io::Result<()> {
        self.stream.writable().await
    }
}

impl Transport for UnixTransport {
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        let want = buf.len();
        let fd = self.stream.as_raw_fd();
        let mut short = 0;

        // A short peek clears read readiness so the reactor sleeps until
        // more bytes arrive instead of spinning on the partial header.
        let result = self.stream.try_io(Interest::READABLE, || {
            let n = socket::recv(fd, buf, MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT)
                .map_err(io::Error::from)?;
            if n > 0 && n < want {
                short = n;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            Ok(n)
        });

        match result {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock && short > 0 => Ok(short),
            other => other,
        }
    }

    fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn send(&self, data: &[u8]) -> io::Result<usize> {
        if self.is_shutdown() {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.stream.try_write(data)
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = socket::shutdown(self.stream.as_raw_fd(), Shutdown::Both) {
            tracing::debug!("socket shutdown failed: {}", e);
        }
    }

    fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn is_read_closed(&self) -> bool {
        self.read_closed.load(Ordering::SeqCst)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let transport = UnixTransport::new(a);

        b.write_all(b"0123456789").await.unwrap();
        transport.readable().await.unwrap();

        let mut peeked = [0u8; 4];
        assert_eq!(transport.peek(&mut peeked).unwrap(), 4);
        assert_eq!(&peeked, b"0123");

        let mut read = [0u8; 10];
        assert_eq!(transport.recv(&mut read).unwrap(), 10);
        assert_eq!(&read, b"0123456789");
    }

    #[tokio::test]
    async fn test_short_peek_reports_available_bytes() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let transport = UnixTransport::new(a);

        b.write_all(b"abc").await.unwrap();
        transport.readable().await.unwrap();

        let mut header = [0u8; 16];
        assert_eq!(transport.peek(&mut header).unwrap(), 3);
        assert_eq!(&header[..3], b"abc");
    }

    #[tokio::test]
    async fn test_empty_socket_would_block() {
        let (a, _b) = UnixStream::pair().unwrap();
        let transport = UnixTransport::new(a);

        let mut buf = [0u8; 16];
        let err = transport.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[tokio::test]
    async fn test_peer_close_reads_eof() {
        let (a, b) = UnixStream::pair().unwrap();
        let transport = UnixTransport::new(a);
        drop(b);

        transport.readable().await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(transport.peek(&mut buf).unwrap(), 0);
        assert_eq!(transport.recv(&mut buf).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_after_partial_write_is_latched() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let transport = UnixTransport::new(a);

        b.write_all(b"abc").await.unwrap();
        drop(b);

        transport.readable().await.unwrap();
        assert!(transport.is_read_closed());
        let mut header = [0u8; 16];
        assert_eq!(transport.peek(&mut header).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (a, _b) = UnixStream::pair().unwrap();
        let transport = UnixTransport::new(a);
        transport.writable().await.unwrap();
        assert_eq!(transport.send(b"x").unwrap(), 1);

        transport.shutdown();
        transport.shutdown();
        assert!(transport.is_shutdown());
        assert_eq!(
            transport.send(b"x").unwrap_err().kind(),
            io::ErrorKind::NotConnected
        );
    }
}
