//! Buffered connection state machine and the connection registry.
//!
//! Each connection owns its transport, an inbound line buffer and a
//! `closed` flag. The reactor drives it through `receive` and `echo`;
//! a connection that hit a zero-byte send, an I/O error or its buffer
//! limit is marked closed and picked up by the next reap. End-of-stream
//! only stops reading: lines already buffered are still echoed, and the
//! connection closes once none are left.

use crate::runtime::buffer::LineBuffer;
use crate::runtime::transport::Transport;
use mio::event::Source;
use mio::{Interest, Registry, Token};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

/// Maximum bytes pulled from the transport per receive call.
pub const READ_CHUNK_SIZE: usize = 4096;

/// A single client connection.
#[derive(Debug)]
pub struct BufferedConnection<T> {
    transport: T,
    peer: SocketAddr,
    inbound: LineBuffer,
    /// Upper bound on buffered inbound bytes.
    max_buffer_size: usize,
    /// Peer shut down its write half; nothing more will be received.
    eof: bool,
    closed: bool,
    /// Interest currently registered with the poller.
    interest: Interest,
}

impl<T: Transport> BufferedConnection<T> {
    /// Wrap a freshly accepted transport.
    pub fn new(transport: T, peer: SocketAddr, max_buffer_size: usize) -> Self {
        Self {
            transport,
            peer,
            inbound: LineBuffer::new(),
            max_buffer_size,
            eof: false,
            closed: false,
            interest: Interest::READABLE,
        }
    }

    pub fn token(&self) -> Token {
        self.transport.token()
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn readable(&self) -> bool {
        self.transport.readable()
    }

    pub fn writable(&self) -> bool {
        self.transport.writable()
    }

    /// Bytes received but not yet echoed.
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        self.inbound.as_slice()
    }

    /// True while a complete line is waiting to be echoed.
    pub fn wants_write(&self) -> bool {
        !self.closed && self.inbound.has_line()
    }

    /// Pull everything currently available into the inbound buffer.
    ///
    /// Readiness is re-checked before every chunk. A zero-length read stops
    /// further reads but leaves buffered lines to be echoed. Growing past
    /// `max_buffer_size` marks the connection closed. Returns the number of
    /// bytes received.
    pub fn receive(&mut self) -> usize {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut total = 0;

        while !self.closed && !self.eof && self.transport.readable() {
            match self.transport.recv(&mut chunk) {
                Ok(0) => {
                    trace!(peer = %self.peer, "Peer closed its write half");
                    self.eof = true;
                }
                Ok(n) => {
                    self.inbound.extend_from_slice(&chunk[..n]);
                    total += n;
                    if self.inbound.len() > self.max_buffer_size {
                        warn!(
                            peer = %self.peer,
                            buffered = self.inbound.len(),
                            max_buffer_size = self.max_buffer_size,
                            "Inbound buffer limit exceeded, closing"
                        );
                        self.closed = true;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Receive failed");
                    self.closed = true;
                }
            }
        }

        total
    }

    /// Send complete lines back to the peer while the transport accepts them.
    ///
    /// Only the bytes the transport actually took are removed from the
    /// buffer, so a partial send resumes mid-line on the next writable tick.
    /// A zero-byte send marks the connection closed. Returns the number of
    /// bytes sent.
    pub fn echo(&mut self) -> usize {
        let mut total = 0;

        while !self.closed {
            let Some(line) = self.inbound.next_line() else {
                break;
            };
            if !self.transport.writable() {
                break;
            }

            match self.transport.send(line) {
                Ok(0) => {
                    trace!(peer = %self.peer, "Send accepted no bytes");
                    self.closed = true;
                }
                Ok(n) => {
                    self.inbound.consume(n);
                    total += n;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Send failed");
                    self.closed = true;
                }
            }
        }

        total
    }

    /// Close a connection whose peer has finished sending once every
    /// complete line it sent has been echoed. A trailing partial line can
    /// never be completed and is dropped.
    pub fn finish_if_drained(&mut self) {
        if self.eof && !self.closed && !self.inbound.has_line() {
            self.closed = true;
        }
    }

    /// Mark the connection for reaping without touching the transport.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Readiness interest this connection should be registered with.
    pub fn desired_interest(&self) -> Interest {
        if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Re-register with the poller if the desired interest changed.
    pub fn sync_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let desired = self.desired_interest();
        if desired != self.interest {
            let token = self.token();
            self.transport.reregister(registry, token, desired)?;
            self.interest = desired;
        }
        Ok(())
    }

    /// Shut down and release the transport.
    ///
    /// Takes the connection by value, so the handle is released exactly once.
    /// Unsent bytes are discarded.
    pub fn close(mut self) {
        self.closed = true;
        if let Err(e) = self.transport.shutdown() {
            trace!(peer = %self.peer, error = %e, "Shutdown failed");
        }
        info!(peer = %self.peer, discarded = self.inbound.len(), "Disconnected");
    }
}

impl<T: Transport> Source for BufferedConnection<T> {
    fn register(&mut self, registry: &Registry, token: Token, interests: Interest) -> io::Result<()> {
        self.transport.register(registry, token, interests)?;
        self.interest = interests;
        Ok(())
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.transport.reregister(registry, token, interests)?;
        self.interest = interests;
        Ok(())
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.transport.deregister(registry)
    }
}

/// Registry of active connections keyed by handle token.
pub struct ConnectionRegistry<T> {
    connections: HashMap<Token, BufferedConnection<T>>,
    max_connections: usize,
}

impl<T: Transport> ConnectionRegistry<T> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    /// Insert a connection under its handle token.
    ///
    /// Returns the entry previously stored under the same token, if any.
    pub fn insert(
        &mut self,
        token: Token,
        conn: BufferedConnection<T>,
    ) -> Option<BufferedConnection<T>> {
        self.connections.insert(token, conn)
    }

    pub fn get(&self, token: Token) -> Option<&BufferedConnection<T>> {
        self.connections.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut BufferedConnection<T>> {
        self.connections.get_mut(&token)
    }

    /// Snapshot of every registered token.
    ///
    /// Connections inserted after the snapshot is taken are not part of it.
    pub fn tokens(&self) -> Vec<Token> {
        self.connections.keys().copied().collect()
    }

    /// Remove a connection. Unknown tokens are ignored.
    pub fn remove(&mut self, token: Token) -> Option<BufferedConnection<T>> {
        self.connections.remove(&token)
    }

    /// Remove and return every connection marked closed.
    ///
    /// Each connection is returned under the same key it was inserted with.
    pub fn reap(&mut self) -> Vec<(Token, BufferedConnection<T>)> {
        let closed: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.is_closed())
            .map(|(token, _)| *token)
            .collect();

        closed
            .into_iter()
            .filter_map(|token| self.remove(token).map(|conn| (token, conn)))
            .collect()
    }

    /// Remove every connection, closed or not.
    pub fn drain(&mut self) -> impl Iterator<Item = (Token, BufferedConnection<T>)> + '_ {
        self.connections.drain()
    }

    #[cfg(test)]
    pub fn contains(&self, token: Token) -> bool {
        self.connections.contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// True once no further connection may be admitted.
    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Maximum number of connections allowed.
    pub fn capacity(&self) -> usize {
        self.max_connections
    }
}
