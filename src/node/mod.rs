//! Single-threaded reactor node.
//!
//! One event loop polls every socket for readiness and routes each event
//! to the owning framed connection or listener. All registry mutation
//! happens on the loop thread, so connection bookkeeping needs no locks.
//! Automaton handlers must return quickly; a slow transition starves every
//! other connection.

pub mod connection;
pub mod listener;
pub mod registry;
pub mod shutdown;

pub use connection::{FrameBuffer, FramedConnection, Phase, ReadOutcome};
pub use listener::Listener;
pub use registry::{ConnectionId, Direction, NodeError, Record, Registry};

use crate::automaton::{Action, Automaton, Label};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Poll tick. Bounds how stale the stop flag and idle sweep can get.
const TICK: Duration = Duration::from_millis(100);

type Factory = Box<dyn Fn() -> Box<dyn Automaton> + Send>;

/// Tunables for the reactor loop.
#[derive(Debug, Clone)]
pub struct NodeOptions {
    /// Upper bound on unterminated inbound bytes per connection. Exceeding
    /// it closes the connection.
    pub max_buffer: usize,
    /// Close connections with no socket activity for this long. Zero
    /// disables the sweep.
    pub idle_timeout: Duration,
}

impl Default for NodeOptions {
    fn default() -> Self {
        NodeOptions {
            max_buffer: 1024 * 1024,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Cross-thread handle that makes [`Node::run`] return at the next tick.
#[derive(Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Reactor, connection factory and registry in one place.
///
/// `listen` installs an inbound factory per listening socket, `send`
/// starts an outbound session, and `run` drives everything until no
/// sockets remain or a stop is requested.
pub struct Node {
    poll: Poll,
    registry: Registry,
    listeners: HashMap<usize, (Listener, Factory)>,
    conns: HashMap<ConnectionId, FramedConnection>,
    options: NodeOptions,
    stop: Arc<AtomicBool>,
}

impl Node {
    pub fn new(options: NodeOptions) -> io::Result<Self> {
        Ok(Node {
            poll: Poll::new()?,
            registry: Registry::new(),
            listeners: HashMap::new(),
            conns: HashMap::new(),
            options,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    /// Bind a listening socket; every accepted connection gets a fresh
    /// automaton from `factory`. Returns the bound address (useful with
    /// port 0).
    pub fn listen<F>(&mut self, host: &str, port: u16, factory: F) -> Result<SocketAddr, NodeError>
    where
        F: Fn() -> Box<dyn Automaton> + Send + 'static,
    {
        let addr = resolve(host, port)?;
        let mut listener = Listener::bind(addr)?;
        let token = self.registry.allocate() as usize;
        self.poll
            .registry()
            .register(listener.source_mut(), Token(token), Interest::READABLE)?;

        let local = listener.local_addr();
        info!(addr = %local, "Listening");
        self.listeners.insert(token, (listener, Box::new(factory)));
        Ok(local)
    }

    /// Start an outbound session with a non-blocking connect. The
    /// automaton's `Initial` transition runs immediately; `Connect` is
    /// delivered once the socket is established.
    pub fn send(
        &mut self,
        host: &str,
        port: u16,
        automaton: Box<dyn Automaton>,
    ) -> Result<ConnectionId, NodeError> {
        let addr = resolve(host, port)?;
        let stream = mio::net::TcpStream::connect(addr)?;

        let id = self.registry.allocate();
        self.registry.insert(id, automaton, Direction::Outbound);

        let mut conn = FramedConnection::outbound(id, stream);
        let interests = conn.interests();
        self.poll
            .registry()
            .register(conn.stream_mut(), Token(id as usize), interests)?;
        info!(conn_id = id, addr = %addr, "Connecting");
        self.conns.insert(id, conn);

        if let Some(action) = self.dispatch(id, Label::Initial, b"")? {
            self.apply(id, action)?;
        }
        Ok(id)
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Run the reactor until no listeners or connections remain, or a stop
    /// is requested via [`StopHandle`] or SIGINT.
    pub fn run(&mut self) -> Result<(), NodeError> {
        let mut events = Events::with_capacity(256);

        loop {
            if self.stop.load(Ordering::SeqCst) || shutdown::requested() {
                info!("Stop requested, shutting down");
                self.teardown_all()?;
                return Ok(());
            }
            if self.listeners.is_empty() && self.conns.is_empty() {
                debug!("Nothing left to drive, loop done");
                return Ok(());
            }

            match self.poll.poll(&mut events, Some(TICK)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            let ready: Vec<(usize, bool, bool)> = events
                .iter()
                .map(|e| (e.token().0, e.is_readable(), e.is_writable()))
                .collect();

            for (token, readable, writable) in ready {
                if self.listeners.contains_key(&token) {
                    self.handle_accept(token)?;
                    continue;
                }
                let id = token as ConnectionId;
                // Stale event for an already-removed connection.
                if !self.conns.contains_key(&id) {
                    continue;
                }
                self.handle_connection_event(id, readable, writable)?;
            }

            self.sweep_idle()?;
        }
    }

    fn handle_accept(&mut self, token: usize) -> Result<(), NodeError> {
        let mut accepted = Vec::new();
        if let Some((listener, factory)) = self.listeners.get(&token) {
            loop {
                match listener.accept() {
                    Ok((stream, peer)) => accepted.push((stream, peer, factory())),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        break;
                    }
                }
            }
        }

        for (stream, peer, automaton) in accepted {
            if let Err(e) = self.adopt(stream, peer, automaton) {
                error!(peer = %peer, error = %e, "Failed to adopt connection");
            }
        }
        Ok(())
    }

    fn adopt(
        &mut self,
        stream: mio::net::TcpStream,
        peer: SocketAddr,
        automaton: Box<dyn Automaton>,
    ) -> Result<(), NodeError> {
        let id = self.registry.allocate();
        self.registry.insert(id, automaton, Direction::Inbound);

        let mut conn = FramedConnection::inbound(id, stream);
        let interests = conn.interests();
        self.poll
            .registry()
            .register(conn.stream_mut(), Token(id as usize), interests)?;
        info!(conn_id = id, peer = %peer, "Incoming connection");
        self.conns.insert(id, conn);

        if let Some(action) = self.dispatch(id, Label::Initial, b"")? {
            self.apply(id, action)?;
        }
        Ok(())
    }

    fn handle_connection_event(
        &mut self,
        id: ConnectionId,
        readable: bool,
        writable: bool,
    ) -> Result<(), NodeError> {
        if writable {
            if let Some(conn) = self.conns.get_mut(&id) {
                if conn.phase() == Phase::Connecting {
                    match conn.try_finish_connect() {
                        Ok(true) => {
                            debug!(conn_id = id, "Connected");
                            if self.registry.direction(id) == Some(Direction::Outbound) {
                                if let Some(action) = self.dispatch(id, Label::Connect, b"")? {
                                    self.apply(id, action)?;
                                }
                            }
                        }
                        Ok(false) => {}
                        Err(e) => {
                            debug!(conn_id = id, error = %e, "Connect failed");
                            return self.transport_close(id);
                        }
                    }
                }
            }
            if let Some(conn) = self.conns.get_mut(&id) {
                if let Err(e) = conn.flush() {
                    debug!(conn_id = id, error = %e, "Write failed");
                    return self.transport_close(id);
                }
            }
        }

        if readable {
            self.handle_readable(id)?;
        }

        if let Some(conn) = self.conns.get(&id) {
            if conn.phase() == Phase::Closed {
                self.reclaim(id);
            } else {
                self.refresh(id)?;
            }
        }
        Ok(())
    }

    fn handle_readable(&mut self, id: ConnectionId) -> Result<(), NodeError> {
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        if conn.phase() == Phase::Connecting {
            return Ok(());
        }

        let outcome = match conn.fill(self.options.max_buffer) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(conn_id = id, error = %e, "Read failed");
                return self.transport_close(id);
            }
        };

        loop {
            let Some(conn) = self.conns.get_mut(&id) else {
                return Ok(());
            };
            let Some(chunk) = conn.next_frame() else {
                break;
            };
            debug!(conn_id = id, bytes = chunk.len(), "<= chunk");
            match self.dispatch(id, Label::Operative, &chunk)? {
                Some(action) => self.apply(id, action)?,
                None => return Ok(()),
            }
        }

        if outcome == ReadOutcome::Eof {
            debug!(conn_id = id, "Peer closed");
            return self.transport_close(id);
        }
        Ok(())
    }

    /// Route one transition through the registry. An automaton failure
    /// aborts that session (record removed, socket dropped) and yields
    /// `None`; an unknown identity is a defect and propagates.
    fn dispatch(
        &mut self,
        id: ConnectionId,
        label: Label,
        chunk: &[u8],
    ) -> Result<Option<Action>, NodeError> {
        match self.registry.dispatch(id, label, chunk) {
            Ok(action) => Ok(Some(action)),
            Err(NodeError::Automaton(_, e)) => {
                error!(conn_id = id, error = %e, "Automaton failed, aborting session");
                self.registry.remove(id);
                self.reclaim(id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply an action to the owning framed connection: terminator first,
    /// then push, then close/done, then an eager flush attempt.
    fn apply(&mut self, id: ConnectionId, action: Action) -> Result<(), NodeError> {
        let Some(conn) = self.conns.get_mut(&id) else {
            return Ok(());
        };
        if let Some(terminator) = action.terminator {
            conn.set_terminator(terminator);
        }
        if let Some(data) = action.push {
            debug!(conn_id = id, bytes = data.len(), "=> push");
            conn.queue(&data);
        }
        if action.close {
            conn.request_close();
        }
        if action.done {
            conn.finish();
        }

        if let Err(e) = conn.flush() {
            debug!(conn_id = id, error = %e, "Write failed");
            return self.transport_close(id);
        }
        if conn.phase() == Phase::Closed {
            self.reclaim(id);
        } else {
            self.refresh(id)?;
        }
        Ok(())
    }

    /// Synthesized terminal transition: transport error or peer close. The
    /// record is reclaimed whatever the error handler returns.
    fn transport_close(&mut self, id: ConnectionId) -> Result<(), NodeError> {
        if self.registry.contains(id) {
            match self.registry.dispatch(id, Label::Error, b"") {
                Ok(_) => {}
                Err(NodeError::Automaton(_, e)) => {
                    warn!(conn_id = id, error = %e, "Error handler failed");
                }
                Err(e) => return Err(e),
            }
            self.registry.remove(id);
        }
        self.reclaim(id);
        Ok(())
    }

    /// Drop the framed connection and deregister its socket. Any record
    /// still present (close without done) is reclaimed with it.
    fn reclaim(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.conns.remove(&id) {
            let _ = self.poll.registry().deregister(conn.stream_mut());
            debug!(conn_id = id, "Connection closed");
        }
        self.registry.remove(id);
    }

    fn refresh(&mut self, id: ConnectionId) -> Result<(), NodeError> {
        if let Some(conn) = self.conns.get_mut(&id) {
            let interests = conn.interests();
            self.poll
                .registry()
                .reregister(conn.stream_mut(), Token(id as usize), interests)?;
        }
        Ok(())
    }

    fn sweep_idle(&mut self) -> Result<(), NodeError> {
        if self.options.idle_timeout.is_zero() {
            return Ok(());
        }
        let stale: Vec<ConnectionId> = self
            .conns
            .values()
            .filter(|c| c.idle_for() >= self.options.idle_timeout)
            .map(|c| c.id())
            .collect();
        for id in stale {
            warn!(conn_id = id, "Idle timeout");
            self.transport_close(id)?;
        }
        Ok(())
    }

    fn teardown_all(&mut self) -> Result<(), NodeError> {
        let ids: Vec<ConnectionId> = self.conns.keys().copied().collect();
        for id in ids {
            self.transport_close(id)?;
        }
        self.listeners.clear();
        Ok(())
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address found for {host}:{port}"),
        )
    })
}
