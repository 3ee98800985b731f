use std::{
    fmt,
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::{AsRawFd, RawFd},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, error, info, warn};
use mio::{Events, Interest, Poll, Registry, Token, Waker, unix::SourceFd};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::config::{ConfigError, ServerConfig};

use super::{
    EndpointInfo, ProtocolTransport,
    thread::{PoolError, PoolMonitor, ThreadPool},
    transport::TransportError,
};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);
const EVENTS_CAPACITY: usize = 128;

/// Turns one request into one response.
pub type Handler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to set up listening socket: {0}")]
    Socket(#[source] io::Error),
    #[error("binding {address} failed: {source}")]
    Bind {
        address: SocketAddr,
        source: io::Error,
    },
    #[error("can't listen on {address}, perhaps the port is unavailable: {source}")]
    Listen {
        address: SocketAddr,
        source: io::Error,
    },
    #[error("server can't be started: request handler isn't set")]
    HandlerNotSet,
    #[error("connection polling failed: {0}")]
    Poll(#[source] io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error("server has already been run or stopped")]
    AlreadyStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// One thread multiplexes the listener and every connection.
    Sequential,
    /// One acceptor thread plus a pool where each connection holds a worker
    /// for its whole lifetime, so at most `workers` connections are served
    /// at once and the rest wait in the pool queue.
    Parallel { workers: usize },
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Sequential => write!(f, "sequential"),
            RunMode::Parallel { workers } => write!(f, "parallel ({workers} workers)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Graceful,
    /// Busy workers were reported and the caller asked to force termination.
    /// The server is marked stopped either way; exiting is up to the caller.
    ForceRequested,
}

struct Control {
    state: Mutex<ServerState>,
    pool: Mutex<Option<PoolMonitor>>,
    waker: Waker,
}

impl Control {
    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        *self.state() == ServerState::Running
    }

    fn set_monitor(&self, monitor: Option<PoolMonitor>) {
        *self.pool.lock().unwrap_or_else(PoisonError::into_inner) = monitor;
    }

    fn busy_workers(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, PoolMonitor::busy_count)
    }

    fn mark_stopped(&self) {
        *self.state() = ServerState::Stopped;
        if let Err(e) = self.waker.wake() {
            warn!("failed to wake the server loop: {e}");
        }
    }
}

/// Cloneable control handle for a [`Server`], usable from other threads.
#[derive(Clone)]
pub struct ServerHandle {
    control: Arc<Control>,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        *self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    /// Workers currently serving a connection. Always zero in sequential mode.
    pub fn busy_workers(&self) -> usize {
        self.control.busy_workers()
    }

    pub fn stop(&self) {
        self.control.mark_stopped();
    }

    /// Stop the server, first asking `confirm_force` whether to force
    /// termination when workers are still busy.
    ///
    /// Declining does not cancel the stop: the server stops accepting and
    /// drains the busy workers.
    pub fn stop_with<F>(&self, confirm_force: F) -> StopOutcome
    where
        F: FnOnce(usize) -> bool,
    {
        let busy = self.busy_workers();
        let outcome = if busy > 0 && confirm_force(busy) {
            StopOutcome::ForceRequested
        } else {
            StopOutcome::Graceful
        };

        self.control.mark_stopped();
        outcome
    }
}

/// TCP server dispatching framed requests to a [`Handler`].
pub struct Server {
    listener: Option<TcpListener>,
    poll: Poll,
    info: EndpointInfo,
    read_timeout: Option<Duration>,
    handler: Option<Handler>,
    control: Arc<Control>,
}

impl Server {
    pub fn bind(config: &ServerConfig) -> Result<Self, ServerError> {
        let address = SocketAddr::new(config.ip()?, config.port);
        let listener = open_listener(address, config.backlog)?;
        let local = listener.local_addr().map_err(ServerError::Socket)?;

        let poll = Poll::new().map_err(ServerError::Socket)?;
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER,
                Interest::READABLE,
            )
            .map_err(ServerError::Socket)?;
        let waker = Waker::new(poll.registry(), WAKER).map_err(ServerError::Socket)?;

        info!("listening at {local}");
        Ok(Self {
            listener: Some(listener),
            poll,
            info: local.into(),
            read_timeout: config.read_timeout,
            handler: None,
            control: Arc::new(Control {
                state: Mutex::new(ServerState::Created),
                pool: Mutex::new(None),
                waker,
            }),
        })
    }

    pub fn set_handler<F>(&mut self, handler: F)
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.info.address(), self.info.port())
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            control: Arc::clone(&self.control),
        }
    }

    /// Serve connections until [`ServerHandle::stop`] is called.
    ///
    /// In parallel mode this returns once every open connection has closed.
    /// A server stopped before it ran just closes its listener; running it a
    /// second time fails.
    pub fn run(&mut self, mode: RunMode) -> Result<(), ServerError> {
        let handler = self.handler.clone().ok_or(ServerError::HandlerNotSet)?;
        let stopped_early = {
            let mut state = self.control.state();
            if self.listener.is_none() {
                return Err(ServerError::AlreadyStopped);
            }
            if *state == ServerState::Created {
                *state = ServerState::Running;
                false
            } else {
                true
            }
        };
        if stopped_early {
            info!("server stopped before it started running");
            self.close();
            return Ok(());
        }

        info!("server running in {mode} mode");
        let result = match mode {
            RunMode::Sequential => self.run_sequential(&handler),
            RunMode::Parallel { workers } => self.run_parallel(workers, &handler),
        };
        self.close();

        info!("server is terminated");
        result
    }

    fn run_sequential(&mut self, handler: &Handler) -> Result<(), ServerError> {
        let listener = self.listener.as_ref().ok_or(ServerError::AlreadyStopped)?;
        let registry = self.poll.registry().try_clone().map_err(ServerError::Poll)?;
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut connections: Slab<Connection> = Slab::new();

        let result = loop {
            if !self.control.is_running() {
                break Ok(());
            }
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                break Err(ServerError::Poll(e));
            }

            for event in events.iter() {
                match event.token() {
                    WAKER => {}
                    LISTENER => {
                        for conn in accept_pending(listener, &registry, self.read_timeout) {
                            let entry = connections.vacant_entry();
                            let token = Token(entry.key());
                            match registry.register(
                                &mut SourceFd(&conn.fd()),
                                token,
                                Interest::READABLE,
                            ) {
                                Ok(()) => {
                                    entry.insert(conn);
                                }
                                Err(e) => warn!("dropping client {}: {e}", conn.peer),
                            }
                        }
                    }
                    Token(key) => {
                        let Some(conn) = connections.get_mut(key) else {
                            continue;
                        };
                        let outcome = conn.handle_request(handler).and_then(|()| {
                            // re-arm so data or EOF that arrived during the cycle is reported again
                            registry
                                .reregister(
                                    &mut SourceFd(&conn.fd()),
                                    Token(key),
                                    Interest::READABLE,
                                )
                                .map_err(|e| TransportError::Read(e).into())
                        });
                        if let Err(e) = outcome {
                            conn.report(&e);
                            release(&registry, connections.remove(key));
                        }
                    }
                }
            }
        };

        if !connections.is_empty() {
            debug!("closing {} open connections", connections.len());
        }
        for conn in connections.drain() {
            release(&registry, conn);
        }
        result
    }

    fn run_parallel(&mut self, workers: usize, handler: &Handler) -> Result<(), ServerError> {
        let mut pool = ThreadPool::start(workers)?;
        self.control.set_monitor(Some(pool.monitor()));

        let result = self.accept_into(&pool, handler);
        self.close();

        let busy = pool.busy_count();
        if busy > 0 {
            info!("waiting for {busy} connections to close...");
        }
        pool.stop();
        self.control.set_monitor(None);
        result
    }

    fn accept_into(&mut self, pool: &ThreadPool, handler: &Handler) -> Result<(), ServerError> {
        let listener = self.listener.as_ref().ok_or(ServerError::AlreadyStopped)?;
        let registry = self.poll.registry().try_clone().map_err(ServerError::Poll)?;
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if !self.control.is_running() {
                return Ok(());
            }
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Poll(e));
            }

            if !events.iter().any(|event| event.token() == LISTENER) {
                continue;
            }
            for conn in accept_pending(listener, &registry, self.read_timeout) {
                let handler = Arc::clone(handler);
                if let Err(e) = pool.submit(move || serve_connection(conn, &handler)) {
                    error!("failed to dispatch connection: {e}");
                }
            }
        }
    }

    /// Stop accepting and close the listening socket. Safe to call twice.
    fn close(&mut self) {
        *self.control.state() = ServerState::Stopped;

        if let Some(listener) = self.listener.take() {
            if let Err(e) = self
                .poll
                .registry()
                .deregister(&mut SourceFd(&listener.as_raw_fd()))
            {
                debug!("failed to deregister listener: {e}");
            }
            info!("stopped listening at {}", self.info);
        }
    }
}

fn open_listener(address: SocketAddr, backlog: i32) -> Result<TcpListener, ServerError> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::Socket)?;
    socket
        .set_reuse_address(true)
        .map_err(ServerError::Socket)?;
    socket
        .bind(&address.into())
        .map_err(|source| ServerError::Bind { address, source })?;
    socket
        .listen(backlog)
        .map_err(|source| ServerError::Listen { address, source })?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;

    Ok(socket.into())
}

/// Accept every connection the listener has queued.
///
/// An accept failure ends the drain early, so the listener is re-armed to get
/// notified again about connections still waiting in the backlog.
fn accept_pending(
    listener: &TcpListener,
    registry: &Registry,
    read_timeout: Option<Duration>,
) -> Vec<Connection> {
    let mut accepted = Vec::new();

    loop {
        match listener.accept() {
            Ok((stream, peer)) => match Connection::new(stream, peer, read_timeout) {
                Ok(conn) => {
                    info!("client {} connected to the server", conn.peer);
                    accepted.push(conn);
                }
                Err(e) => warn!("dropping client {peer}: {e}"),
            },
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("broken connection: {e}");
                if let Err(e) = rearm_listener(registry, listener) {
                    error!("failed to re-arm listener: {e}");
                }
                break;
            }
        }
    }

    accepted
}

fn rearm_listener(registry: &Registry, listener: &TcpListener) -> io::Result<()> {
    registry.reregister(
        &mut SourceFd(&listener.as_raw_fd()),
        LISTENER,
        Interest::READABLE,
    )
}

/// Owns the connection until the peer goes away or a transfer fails.
fn serve_connection(mut conn: Connection, handler: &Handler) {
    loop {
        if let Err(e) = conn.handle_request(handler) {
            conn.report(&e);
            return;
        }
    }
}

fn release(registry: &Registry, conn: Connection) {
    if let Err(e) = registry.deregister(&mut SourceFd(&conn.fd())) {
        debug!("failed to deregister {}: {e}", conn.peer);
    }
}

/// Why a request/response cycle ended the connection.
#[derive(Debug, Error)]
enum CycleError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("request handler panicked")]
    HandlerPanicked,
}

struct Connection {
    transport: ProtocolTransport<TcpStream>,
    peer: EndpointInfo,
}

impl Connection {
    fn new(
        stream: TcpStream,
        peer: SocketAddr,
        read_timeout: Option<Duration>,
    ) -> io::Result<Self> {
        // request reads block until the terminator arrives
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(read_timeout)?;

        Ok(Self {
            transport: ProtocolTransport::new(stream),
            peer: peer.into(),
        })
    }

    fn fd(&self) -> RawFd {
        self.transport.get_ref().as_raw_fd()
    }

    /// One request/response cycle.
    fn handle_request(&mut self, handler: &Handler) -> Result<(), CycleError> {
        let request = self.transport.read_message()?;
        info!(
            "request from {}: {}",
            self.peer,
            String::from_utf8_lossy(&request)
        );

        let response = panic::catch_unwind(AssertUnwindSafe(|| handler(&request)))
            .map_err(|_| CycleError::HandlerPanicked)?;
        self.transport.write_message(&response)?;
        Ok(())
    }

    fn report(&self, err: &CycleError) {
        match err {
            CycleError::Transport(TransportError::PeerClosed) => {
                info!("client {} closed the connection", self.peer)
            }
            e => warn!("client {}: {e}, closing connection", self.peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        sync::{Barrier, mpsc},
        thread::{self, JoinHandle},
    };

    use crate::protocol::{Session, SessionError};

    use super::*;

    fn echo_server(
        config: ServerConfig,
        mode: RunMode,
    ) -> (SocketAddr, ServerHandle, JoinHandle<Result<(), ServerError>>) {
        let mut server = Server::bind(&config).unwrap();
        server.set_handler(|request| {
            let mut response = b"echo: ".to_vec();
            response.extend_from_slice(request);
            response
        });

        let address = server.local_addr();
        let handle = server.handle();
        let join = thread::spawn(move || server.run(mode));
        (address, handle, join)
    }

    fn local_config() -> ServerConfig {
        ServerConfig {
            backlog: 16,
            ..ServerConfig::new("127.0.0.1", 0)
        }
    }

    fn session(address: SocketAddr) -> Session {
        Session::connect(&address.ip().to_string(), address.port()).unwrap()
    }

    #[test]
    fn bind_rejects_invalid_address() {
        let err = Server::bind(&ServerConfig::new("300.1.1.1", 0)).err().unwrap();
        assert!(matches!(
            err,
            ServerError::Config(ConfigError::InvalidAddress(_))
        ));
    }

    #[test]
    fn bind_fails_on_taken_port() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let err = Server::bind(&ServerConfig::new("127.0.0.1", port)).err().unwrap();
        assert!(matches!(err, ServerError::Bind { .. }));
    }

    #[test]
    fn bind_reports_ephemeral_port() {
        let server = Server::bind(&local_config()).unwrap();
        assert_ne!(server.local_addr().port(), 0);
        assert_eq!(server.info().endpoint(), server.local_addr().to_string());
        assert_eq!(server.handle().state(), ServerState::Created);
    }

    #[test]
    fn run_without_handler_fails() {
        let mut server = Server::bind(&local_config()).unwrap();
        assert!(matches!(
            server.run(RunMode::Sequential),
            Err(ServerError::HandlerNotSet)
        ));
        assert_eq!(server.handle().state(), ServerState::Created);
    }

    #[test]
    fn stop_before_run_returns_cleanly() {
        let mut server = Server::bind(&local_config()).unwrap();
        server.set_handler(|request| request.to_vec());
        let address = server.local_addr();
        server.handle().stop();

        server.run(RunMode::Parallel { workers: 2 }).unwrap();
        assert_eq!(server.handle().state(), ServerState::Stopped);
        assert!(TcpStream::connect(address).is_err());
    }

    #[test]
    fn stop_racing_run_start_is_clean() {
        for mode in [RunMode::Sequential, RunMode::Parallel { workers: 1 }] {
            let (_, handle, join) = echo_server(local_config(), mode);
            handle.stop();
            join.join().unwrap().unwrap();
        }
    }

    #[test]
    fn second_run_fails() {
        let mut server = Server::bind(&local_config()).unwrap();
        server.set_handler(|request| request.to_vec());
        server.handle().stop();
        server.run(RunMode::Sequential).unwrap();

        assert!(matches!(
            server.run(RunMode::Sequential),
            Err(ServerError::AlreadyStopped)
        ));
    }

    #[test]
    fn parallel_mode_rejects_zero_workers() {
        let mut server = Server::bind(&local_config()).unwrap();
        server.set_handler(|request| request.to_vec());

        assert!(matches!(
            server.run(RunMode::Parallel { workers: 0 }),
            Err(ServerError::Pool(PoolError::NoWorkers))
        ));
        assert_eq!(server.handle().state(), ServerState::Stopped);
    }

    #[test]
    fn sequential_serves_each_client_its_own_response() {
        let (address, handle, join) = echo_server(local_config(), RunMode::Sequential);
        let mut clients: Vec<Session> = (0..3).map(|_| session(address)).collect();

        for round in 0..2 {
            for (i, client) in clients.iter_mut().enumerate() {
                client.send(format!("client {i} round {round}").as_bytes()).unwrap();
            }
            for (i, client) in clients.iter_mut().enumerate() {
                let response = client.receive().unwrap();
                assert_eq!(response, format!("echo: client {i} round {round}").as_bytes());
            }
        }

        handle.stop();
        join.join().unwrap().unwrap();
        assert_eq!(handle.state(), ServerState::Stopped);
    }

    #[test]
    fn sequential_drops_failing_client_only() {
        let (address, handle, join) = echo_server(local_config(), RunMode::Sequential);
        let mut first = session(address);
        let mut second = session(address);

        {
            let mut abrupt = TcpStream::connect(address).unwrap();
            abrupt.write_all(b"half a request").unwrap();
        }

        assert_eq!(first.request(b"one").unwrap(), b"echo: one");
        assert_eq!(second.request(b"two").unwrap(), b"echo: two");
        assert_eq!(first.request(b"again").unwrap(), b"echo: again");

        handle.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn sequential_large_message() {
        let (address, handle, join) = echo_server(local_config(), RunMode::Sequential);
        let mut client = session(address);

        let message: Vec<u8> = (0..10_000).map(|i| b'a' + (i % 26) as u8).collect();
        let response = client.request(&message).unwrap();
        assert_eq!(&response[..6], b"echo: ");
        assert_eq!(&response[6..], &message[..]);

        handle.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn parallel_serves_clients_concurrently() {
        let (address, handle, join) =
            echo_server(local_config(), RunMode::Parallel { workers: 2 });

        let mut a = session(address);
        assert_eq!(a.request(b"from a").unwrap(), b"echo: from a");

        // a still holds its worker, b must get the second one
        let mut b = session(address);
        assert_eq!(b.request(b"from b").unwrap(), b"echo: from b");
        assert_eq!(a.request(b"a again").unwrap(), b"echo: a again");
        assert_eq!(handle.busy_workers(), 2);

        a.close();
        b.close();
        handle.stop();
        join.join().unwrap().unwrap();
        assert_eq!(handle.busy_workers(), 0);
    }

    #[test]
    fn parallel_serves_second_client_while_first_is_in_handler() {
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let mut server = Server::bind(&local_config()).unwrap();
        {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            server.set_handler(move |request| {
                if request == b"slow" {
                    entered.wait();
                    release.wait();
                }
                request.to_vec()
            });
        }
        let address = server.local_addr();
        let handle = server.handle();
        let join = thread::spawn(move || server.run(RunMode::Parallel { workers: 2 }));

        let slow = thread::spawn(move || session(address).request(b"slow").unwrap());
        entered.wait();

        // the first request is parked inside the handler
        let mut fast = session(address);
        assert_eq!(fast.request(b"fast").unwrap(), b"fast");

        release.wait();
        assert_eq!(slow.join().unwrap(), b"slow");

        fast.close();
        handle.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn sequential_survives_panicking_handler() {
        let mut server = Server::bind(&local_config()).unwrap();
        server.set_handler(|request| {
            if request == b"boom" {
                panic!("handler failure");
            }
            request.to_vec()
        });
        let address = server.local_addr();
        let handle = server.handle();
        let join = thread::spawn(move || server.run(RunMode::Sequential));

        let mut healthy = session(address);
        let mut failing = session(address);
        assert_eq!(healthy.request(b"before").unwrap(), b"before");

        assert!(matches!(
            failing.request(b"boom"),
            Err(SessionError::Transport(TransportError::PeerClosed))
        ));
        assert_eq!(healthy.request(b"after").unwrap(), b"after");

        handle.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn rearmed_listener_reports_waiting_connections_again() {
        let listener = open_listener("127.0.0.1:0".parse().unwrap(), 4).unwrap();
        let mut poll = Poll::new().unwrap();
        poll.registry()
            .register(
                &mut SourceFd(&listener.as_raw_fd()),
                LISTENER,
                Interest::READABLE,
            )
            .unwrap();
        let _waiting = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let mut events = Events::with_capacity(8);

        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|event| event.token() == LISTENER));

        // edge-triggered: nothing new until the listener is re-armed
        poll.poll(&mut events, Some(Duration::from_millis(50))).unwrap();
        assert!(events.is_empty());

        rearm_listener(poll.registry(), &listener).unwrap();
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().any(|event| event.token() == LISTENER));
    }

    #[test]
    fn parallel_queues_connections_beyond_worker_count() {
        let (address, handle, join) =
            echo_server(local_config(), RunMode::Parallel { workers: 1 });

        let mut a = session(address);
        assert_eq!(a.request(b"a").unwrap(), b"echo: a");

        let (sender, receiver) = mpsc::channel();
        let waiting = thread::spawn(move || {
            let mut b = session(address);
            sender.send(b.request(b"b").unwrap()).unwrap();
        });

        assert!(receiver.recv_timeout(Duration::from_millis(300)).is_err());
        a.close();
        let response = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(response, b"echo: b");

        waiting.join().unwrap();
        handle.stop();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn stop_with_busy_workers_asks_before_stopping() {
        let (address, handle, join) =
            echo_server(local_config(), RunMode::Parallel { workers: 2 });
        let mut client = session(address);
        assert_eq!(client.request(b"hold").unwrap(), b"echo: hold");

        let mut asked = None;
        let outcome = handle.stop_with(|busy| {
            asked = Some(busy);
            false
        });
        assert_eq!(asked, Some(1));
        assert_eq!(outcome, StopOutcome::Graceful);
        assert_eq!(handle.state(), ServerState::Stopped);

        // the open connection keeps its worker until it closes
        assert_eq!(client.request(b"still served").unwrap(), b"echo: still served");
        client.close();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn stop_with_confirmed_force_still_marks_stopped() {
        let (address, handle, join) =
            echo_server(local_config(), RunMode::Parallel { workers: 1 });
        let mut client = session(address);
        client.request(b"hold").unwrap();

        assert_eq!(handle.stop_with(|_| true), StopOutcome::ForceRequested);
        assert!(!handle.is_running());

        client.close();
        join.join().unwrap().unwrap();
    }

    #[test]
    fn stop_without_busy_workers_does_not_ask() {
        let (_, handle, join) = echo_server(local_config(), RunMode::Sequential);
        let outcome = handle.stop_with(|_| panic!("nothing is busy"));
        assert_eq!(outcome, StopOutcome::Graceful);
        join.join().unwrap().unwrap();
    }

    #[test]
    fn read_timeout_closes_silent_connection() {
        let config = ServerConfig {
            read_timeout: Some(Duration::from_millis(100)),
            ..local_config()
        };
        let (address, handle, join) = echo_server(config, RunMode::Parallel { workers: 1 });

        let mut silent = TcpStream::connect(address).unwrap();
        silent
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(silent.read(&mut buf).unwrap(), 0);

        // the worker is free again for the next client
        let mut client = session(address);
        assert_eq!(client.request(b"next").unwrap(), b"echo: next");

        client.close();
        handle.stop();
        join.join().unwrap().unwrap();
    }
}
