//! Single-threaded reactor loop.
//!
//! Each iteration:
//! 1. Block on the poller until the listener, a connection, the waker or
//!    the signal pipe reports readiness.
//! 2. Accept every pending connection if the listener was ready.
//! 3. Re-query read/write readiness of every registered connection without
//!    blocking, including ones accepted this iteration.
//! 4. Receive on every readable connection.
//! 5. Echo on every writable connection, then close any connection whose
//!    peer has finished sending and has no complete line left.
//! 6. Release and forget every connection marked closed.
//!
//! The loop only blocks in step 1. It stops at the top of an iteration once
//! shutdown has been requested, then closes the listener and every remaining
//! connection.

use crate::runtime::connection::{BufferedConnection, ConnectionRegistry};
use crate::runtime::transport::{TcpTransport, Transport};
use mio::net::{TcpListener, UnixStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use signal_hook::SigId;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 2);

/// Requests reactor shutdown from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the reactor to stop and wake it if it is blocked in poll.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Work done by one dispatch pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Bytes received across all readable connections.
    pub received: usize,
    /// Bytes echoed across all writable connections.
    pub sent: usize,
    /// Connections released.
    pub reaped: usize,
}

/// The reactor: owns the poller, the listening socket and every connection.
pub struct Reactor {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpTransport>,
    max_buffer_size: usize,
    shutdown: ShutdownHandle,
    signal_pipe: Option<UnixStream>,
    signal_ids: Vec<SigId>,
}

impl Reactor {
    /// Take ownership of a bound, listening socket and prepare the poller.
    pub fn new(
        listener: std::net::TcpListener,
        max_connections: usize,
        events_capacity: usize,
        max_buffer_size: usize,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        Ok(Self {
            poll,
            events: Events::with_capacity(events_capacity.max(1)),
            listener,
            connections: ConnectionRegistry::new(max_connections),
            max_buffer_size,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker,
            },
            signal_pipe: None,
            signal_ids: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    #[cfg(test)]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Route the given signals into the loop as shutdown requests.
    ///
    /// Each signal writes a byte into a socket pair whose read end is polled
    /// with the listener, so delivery wakes the blocking poll.
    pub fn watch_signals(&mut self, signals: &[libc::c_int]) -> io::Result<()> {
        let (read, write) = std::os::unix::net::UnixStream::pair()?;
        read.set_nonblocking(true)?;
        write.set_nonblocking(true)?;

        let mut read = UnixStream::from_std(read);
        self.poll
            .registry()
            .register(&mut read, SIGNAL_TOKEN, Interest::READABLE)?;

        for &signal in signals {
            let id = signal_hook::low_level::pipe::register(signal, write.try_clone()?)?;
            self.signal_ids.push(id);
        }

        self.signal_pipe = Some(read);
        Ok(())
    }

    /// Run until shutdown is requested, then release every socket.
    ///
    /// Returns an error only if the poller itself fails.
    pub fn run(mut self) -> io::Result<()> {
        let result = self.event_loop();
        self.teardown();
        result
    }

    fn event_loop(&mut self) -> io::Result<()> {
        while !self.shutdown.is_shutdown() {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Poll failed");
                    return Err(e);
                }
            }

            let mut listener_ready = false;
            let mut signalled = false;
            for event in self.events.iter() {
                match event.token() {
                    LISTENER_TOKEN => listener_ready = true,
                    SIGNAL_TOKEN => signalled = true,
                    // Connection and waker events only need to wake the loop.
                    _ => {}
                }
            }

            if signalled {
                self.drain_signals();
                continue;
            }

            if listener_ready {
                self.accept_connections();
            }

            let tick = service(self.poll.registry(), &mut self.connections);
            trace!(
                received = tick.received,
                sent = tick.sent,
                reaped = tick.reaped,
                connections = self.connections.len(),
                "Tick"
            );
        }

        Ok(())
    }

    /// Accept until the listener would block.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(
                            peer = %peer,
                            max_connections = self.connections.capacity(),
                            "Connection limit reached, rejecting"
                        );
                        continue;
                    }

                    let mut conn = BufferedConnection::new(
                        TcpTransport::new(stream),
                        peer,
                        self.max_buffer_size,
                    );
                    let token = conn.token();
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut conn, token, Interest::READABLE)
                    {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    info!(peer = %peer, "Connected");
                    self.connections.insert(token, conn);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn drain_signals(&mut self) {
        if let Some(pipe) = self.signal_pipe.as_mut() {
            let mut buf = [0u8; 64];
            loop {
                match pipe.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        info!("Interrupt received");
        self.shutdown.shutdown();
    }

    fn teardown(&mut self) {
        info!(connections = self.connections.len(), "Shutting down");

        for id in self.signal_ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }

        let registry = self.poll.registry();
        if let Err(e) = registry.deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }
        for (_, mut conn) in self.connections.drain() {
            let _ = registry.deregister(&mut conn);
            conn.close();
        }
    }
}

/// One non-blocking dispatch pass over every registered connection.
///
/// Readiness is sampled once for the current handle set, then all reads run
/// before any write. Connections marked closed are deregistered and
/// released; the rest have their poll interest brought in line with whether
/// output is still pending.
pub fn service<T: Transport>(registry: &Registry, connections: &mut ConnectionRegistry<T>) -> Tick {
    let mut tick = Tick::default();

    let mut readable = Vec::new();
    let mut writable = Vec::new();
    for token in connections.tokens() {
        if let Some(conn) = connections.get(token) {
            if conn.readable() {
                readable.push(token);
            }
            if conn.writable() {
                writable.push(token);
            }
        }
    }

    for token in readable {
        if let Some(conn) = connections.get_mut(token) {
            tick.received += conn.receive();
        }
    }

    for token in writable {
        if let Some(conn) = connections.get_mut(token) {
            tick.sent += conn.echo();
        }
    }

    for token in connections.tokens() {
        if let Some(conn) = connections.get_mut(token) {
            conn.finish_if_drained();
        }
    }

    for token in connections.tokens() {
        if let Some(conn) = connections.get_mut(token) {
            if conn.is_closed() {
                continue;
            }
            if let Err(e) = conn.sync_interest(registry) {
                debug!(peer = %conn.peer(), error = %e, "Failed to update interest");
                conn.mark_closed();
            }
        }
    }

    for (_, mut conn) in connections.reap() {
        if let Err(e) = registry.deregister(&mut conn) {
            trace!(peer = %conn.peer(), error = %e, "Failed to deregister connection");
        }
        conn.close();
        tick.reaped += 1;
    }

    tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::listener::create_listener;
    use crate::runtime::transport::mock::{MockState, MockTransport};
    use std::cell::RefCell;
    use std::io::{ErrorKind, Write};
    use std::net::{Shutdown, TcpStream};
    use std::rc::Rc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    fn add_mock(
        registry: &Registry,
        connections: &mut ConnectionRegistry<MockTransport>,
        id: usize,
    ) -> Rc<RefCell<MockState>> {
        let transport = MockTransport::new(id);
        let state = transport.handle();
        let mut conn =
            BufferedConnection::new(transport, "127.0.0.1:40000".parse().unwrap(), 1024 * 1024);
        let token = conn.token();
        registry
            .register(&mut conn, token, Interest::READABLE)
            .unwrap();
        connections.insert(token, conn);
        state
    }

    #[test]
    fn test_service_echoes_each_connection_separately() {
        let poll = Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(16);
        let a = add_mock(poll.registry(), &mut connections, 3);
        let b = add_mock(poll.registry(), &mut connections, 4);

        a.borrow_mut().inbound.push_back(b"from a\n".to_vec());
        b.borrow_mut().inbound.push_back(b"from b\nand more\n".to_vec());

        let tick = service(poll.registry(), &mut connections);
        assert_eq!(tick.received, 23);
        assert_eq!(tick.sent, 23);
        assert_eq!(tick.reaped, 0);
        assert_eq!(a.borrow().sent, b"from a\n");
        assert_eq!(b.borrow().sent, b"from b\nand more\n");
    }

    #[test]
    fn test_service_reads_before_writes() {
        let poll = Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(16);
        let state = add_mock(poll.registry(), &mut connections, 3);

        // A line that arrives in this tick's read phase is echoed in the same tick.
        state.borrow_mut().inbound.push_back(b"same tick\n".to_vec());
        service(poll.registry(), &mut connections);
        assert_eq!(state.borrow().sent, b"same tick\n");
    }

    #[test]
    fn test_service_holds_partial_line_across_ticks() {
        let poll = Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(16);
        let state = add_mock(poll.registry(), &mut connections, 3);

        state.borrow_mut().inbound.push_back(b"partial".to_vec());
        let tick = service(poll.registry(), &mut connections);
        assert_eq!(tick.sent, 0);
        assert!(state.borrow().sent.is_empty());

        state.borrow_mut().inbound.push_back(b"tail\n".to_vec());
        service(poll.registry(), &mut connections);
        assert_eq!(state.borrow().sent, b"partialtail\n");
    }

    #[test]
    fn test_service_tracks_write_interest() {
        let poll = Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(16);
        let state = add_mock(poll.registry(), &mut connections, 3);
        {
            let mut s = state.borrow_mut();
            s.inbound.push_back(b"stuck\n".to_vec());
            s.writable = false;
        }

        service(poll.registry(), &mut connections);
        assert_eq!(
            state.borrow().interest,
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        state.borrow_mut().writable = true;
        service(poll.registry(), &mut connections);
        assert_eq!(state.borrow().sent, b"stuck\n");
        assert_eq!(state.borrow().interest, Some(Interest::READABLE));
    }

    #[test]
    fn test_service_reaps_disconnected_once() {
        let poll = Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(16);
        let gone = add_mock(poll.registry(), &mut connections, 3);
        let alive = add_mock(poll.registry(), &mut connections, 4);

        gone.borrow_mut().eof = true;

        let tick = service(poll.registry(), &mut connections);
        assert_eq!(tick.reaped, 1);
        assert_eq!(connections.len(), 1);
        assert!(connections.contains(Token(4)));
        assert_eq!(gone.borrow().shutdowns, 1);
        assert_eq!(gone.borrow().interest, None);

        let tick = service(poll.registry(), &mut connections);
        assert_eq!(tick.reaped, 0);
        assert_eq!(gone.borrow().shutdowns, 1);
        assert_eq!(alive.borrow().shutdowns, 0);
    }

    #[test]
    fn test_service_echoes_lines_that_arrive_with_end_of_stream() {
        let poll = Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(16);
        let state = add_mock(poll.registry(), &mut connections, 3);
        {
            let mut s = state.borrow_mut();
            s.inbound.push_back(b"hi\nbye\n".to_vec());
            s.eof = true;
        }

        let tick = service(poll.registry(), &mut connections);
        assert_eq!(state.borrow().sent, b"hi\nbye\n");
        assert_eq!(tick.reaped, 1);
        assert_eq!(state.borrow().shutdowns, 1);
    }

    #[test]
    fn test_service_keeps_half_closed_connection_until_echoed() {
        let poll = Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(16);
        let state = add_mock(poll.registry(), &mut connections, 3);
        {
            let mut s = state.borrow_mut();
            s.inbound.push_back(b"later\n".to_vec());
            s.eof = true;
            s.writable = false;
        }

        let tick = service(poll.registry(), &mut connections);
        assert_eq!(tick.reaped, 0);
        assert_eq!(
            state.borrow().interest,
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        state.borrow_mut().writable = true;
        let tick = service(poll.registry(), &mut connections);
        assert_eq!(state.borrow().sent, b"later\n");
        assert_eq!(tick.reaped, 1);
        assert!(connections.is_empty());
    }

    #[test]
    fn test_service_reaps_on_zero_byte_send() {
        let poll = Poll::new().unwrap();
        let mut connections = ConnectionRegistry::new(16);
        let state = add_mock(poll.registry(), &mut connections, 3);
        {
            let mut s = state.borrow_mut();
            s.inbound.push_back(b"line\n".to_vec());
            s.send_limit = Some(0);
        }

        let tick = service(poll.registry(), &mut connections);
        assert_eq!(tick.reaped, 1);
        assert!(connections.is_empty());
    }

    fn start_reactor(max_connections: usize) -> (SocketAddr, ShutdownHandle, JoinHandle<io::Result<()>>) {
        start_reactor_with(max_connections, 16 * 1024 * 1024)
    }

    fn start_reactor_with(
        max_connections: usize,
        max_buffer_size: usize,
    ) -> (SocketAddr, ShutdownHandle, JoinHandle<io::Result<()>>) {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let reactor = Reactor::new(listener, max_connections, 64, max_buffer_size).unwrap();
        let addr = reactor.local_addr().unwrap();
        let handle = reactor.shutdown_handle();
        let join = thread::spawn(move || reactor.run());
        (addr, handle, join)
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn stop(handle: ShutdownHandle, join: JoinHandle<io::Result<()>>) {
        handle.shutdown();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn test_echo_session() {
        let (addr, handle, join) = start_reactor(16);
        let mut client = connect(addr);

        client.write_all(b"Hello, world, 1\n").unwrap();
        assert_eq!(read_exactly(&mut client, 16), b"Hello, world, 1\n");

        client.write_all(b"Hello, world, 2\n").unwrap();
        assert_eq!(read_exactly(&mut client, 16), b"Hello, world, 2\n");

        client.write_all(b"partial").unwrap();
        client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        let mut buf = [0u8; 32];
        let err = client.read(&mut buf).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut));

        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(b"tail\n").unwrap();
        assert_eq!(read_exactly(&mut client, 12), b"partialtail\n");

        stop(handle, join);
    }

    #[test]
    fn test_fragmented_input_echoes_lines_in_order() {
        let (addr, handle, join) = start_reactor(16);
        let mut client = connect(addr);
        client.set_nodelay(true).unwrap();

        for fragment in [&b"ab"[..], b"c\nd", b"ef\n\n", b"g", b"\n"] {
            client.write_all(fragment).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(read_exactly(&mut client, 11), b"abc\ndef\n\ng\n");

        stop(handle, join);
    }

    #[test]
    fn test_half_closed_client_gets_its_lines_back() {
        let (addr, handle, join) = start_reactor(16);

        // Repeat so the line and the FIN regularly land in the same read pass.
        for _ in 0..20 {
            let mut client = connect(addr);
            client.write_all(b"hi\n").unwrap();
            client.shutdown(Shutdown::Write).unwrap();

            let mut echoed = Vec::new();
            client.read_to_end(&mut echoed).unwrap();
            assert_eq!(echoed, b"hi\n");
        }

        stop(handle, join);
    }

    #[test]
    fn test_oversized_input_closes_connection() {
        let (addr, handle, join) = start_reactor_with(16, 64);
        let mut client = connect(addr);

        client.write_all(&[b'x'; 100]).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));

        // Other clients are unaffected.
        let mut other = connect(addr);
        other.write_all(b"ok\n").unwrap();
        assert_eq!(read_exactly(&mut other, 3), b"ok\n");

        stop(handle, join);
    }

    #[test]
    fn test_large_line_survives_partial_writes() {
        let (addr, handle, join) = start_reactor(16);
        let mut client = connect(addr);

        let mut payload: Vec<u8> = (0..4 * 1024 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
        payload.push(b'\n');
        let expected = payload.clone();

        let mut writer = client.try_clone().unwrap();
        let sender = thread::spawn(move || writer.write_all(&payload).unwrap());

        assert_eq!(read_exactly(&mut client, expected.len()), expected);
        sender.join().unwrap();

        stop(handle, join);
    }

    #[test]
    fn test_concurrent_clients_get_only_their_own_lines() {
        let (addr, handle, join) = start_reactor(16);
        let mut a = connect(addr);
        let mut b = connect(addr);

        a.write_all(b"a1\n").unwrap();
        b.write_all(b"b1\n").unwrap();
        a.write_all(b"a2\n").unwrap();
        b.write_all(b"b2\n").unwrap();

        assert_eq!(read_exactly(&mut a, 6), b"a1\na2\n");
        assert_eq!(read_exactly(&mut b, 6), b"b1\nb2\n");

        stop(handle, join);
    }

    #[test]
    fn test_reconnect_after_disconnect() {
        let (addr, handle, join) = start_reactor(1);

        let mut first = connect(addr);
        first.write_all(b"one\n").unwrap();
        assert_eq!(read_exactly(&mut first, 4), b"one\n");
        drop(first);

        // The slot is released once the disconnect is reaped.
        let mut echoed = None;
        for _ in 0..50 {
            let mut second = connect(addr);
            let mut buf = [0u8; 4];
            if second.write_all(b"two\n").is_ok() && second.read_exact(&mut buf).is_ok() {
                echoed = Some(buf);
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(echoed.as_ref().map(|b| &b[..]), Some(&b"two\n"[..]));

        stop(handle, join);
    }

    #[test]
    fn test_connection_limit_rejects_extra_clients() {
        let (addr, handle, join) = start_reactor(1);

        let mut admitted = connect(addr);
        admitted.write_all(b"in\n").unwrap();
        assert_eq!(read_exactly(&mut admitted, 3), b"in\n");

        let mut rejected = connect(addr);
        let mut buf = [0u8; 8];
        // Closed by the server without an echo.
        assert!(matches!(rejected.read(&mut buf), Ok(0) | Err(_)));

        stop(handle, join);
    }

    #[test]
    fn test_shutdown_closes_open_connections() {
        let (addr, handle, join) = start_reactor(16);
        let mut client = connect(addr);
        client.write_all(b"ping\n").unwrap();
        assert_eq!(read_exactly(&mut client, 5), b"ping\n");

        stop(handle, join);

        let mut buf = [0u8; 8];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert!(TcpStream::connect(addr).is_err());
    }

    #[test]
    fn test_shutdown_before_run_returns_immediately() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let reactor = Reactor::new(listener, 16, 64, 16 * 1024 * 1024).unwrap();
        let handle = reactor.shutdown_handle();
        handle.shutdown();
        assert!(handle.is_shutdown());
        reactor.run().unwrap();
    }

    #[test]
    fn test_zero_events_capacity_still_serves() {
        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let reactor = Reactor::new(listener, 16, 0, 1024).unwrap();
        let addr = reactor.local_addr().unwrap();
        let handle = reactor.shutdown_handle();
        let join = thread::spawn(move || reactor.run());

        let mut client = connect(addr);
        client.write_all(b"still here\n").unwrap();
        assert_eq!(read_exactly(&mut client, 11), b"still here\n");

        stop(handle, join);
    }

    #[test]
    fn test_signal_stops_reactor() {
        use signal_hook::consts::SIGUSR1;

        let listener = create_listener("127.0.0.1:0".parse().unwrap(), 10).unwrap();
        let mut reactor = Reactor::new(listener, 16, 64, 1024).unwrap();
        reactor.watch_signals(&[SIGUSR1]).unwrap();
        let addr = reactor.local_addr().unwrap();
        let join = thread::spawn(move || reactor.run());

        // Make sure the loop is up before signalling.
        let mut client = connect(addr);
        client.write_all(b"up\n").unwrap();
        assert_eq!(read_exactly(&mut client, 3), b"up\n");

        signal_hook::low_level::raise(SIGUSR1).unwrap();
        join.join().unwrap().unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
        assert!(TcpStream::connect(addr).is_err());
    }
}
