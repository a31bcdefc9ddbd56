//! Socket capability set used by buffered connections.
//!
//! A `Transport` is a non-blocking byte stream that can answer readiness
//! queries on demand and be registered with the poller. `TcpTransport` is
//! the real socket; tests drive connections through an in-memory fake.

use mio::event::Source;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::trace;

/// Non-blocking stream socket as seen by the reactor.
pub trait Transport: Source {
    /// Identity of the underlying handle, used as the registry key and poll token.
    fn token(&self) -> Token;

    /// True if a receive would not block (data, end-of-stream or error pending).
    fn readable(&self) -> bool;

    /// True if a send would not block.
    fn writable(&self) -> bool;

    /// Receive up to `buf.len()` bytes. `Ok(0)` means the peer shut down.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send as much of `buf` as the transport accepts right now.
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Shut down both directions of the stream.
    fn shutdown(&mut self) -> io::Result<()>;
}

/// A TCP stream accepted from the listener.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    /// Zero-timeout `poll(2)` on this socket, returning the reported events.
    fn revents(&self, events: libc::c_short) -> io::Result<libc::c_short> {
        poll_now(self.stream.as_raw_fd(), events)
    }
}

impl Transport for TcpTransport {
    fn token(&self) -> Token {
        Token(self.stream.as_raw_fd() as usize)
    }

    fn readable(&self) -> bool {
        match self.revents(libc::POLLIN) {
            Ok(revents) => revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
            Err(e) => {
                trace!(error = %e, "Readable query failed");
                false
            }
        }
    }

    fn writable(&self) -> bool {
        match self.revents(libc::POLLOUT) {
            Ok(revents) => revents & (libc::POLLOUT | libc::POLLERR) != 0,
            Err(e) => {
                trace!(error = %e, "Writable query failed");
                false
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn shutdown(&mut self) -> io::Result<()> {
        match self.stream.shutdown(Shutdown::Both) {
            // Peer already reset the connection.
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Source for TcpTransport {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.stream.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.stream.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.stream.deregister(registry)
    }
}

/// Query readiness of a single descriptor without blocking.
fn poll_now(fd: RawFd, events: libc::c_short) -> io::Result<libc::c_short> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    // SAFETY: `pfd` is a valid, initialized pollfd that outlives the call,
    // and nfds is 1. A zero timeout never blocks.
    let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pfd.revents)
}
