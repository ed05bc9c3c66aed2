//! Load client: opens many connections to a server and discards what arrives.
//!
//! Same single-owner event loop as the server. Each connection starts in
//! `Connecting`, becomes `Active` on its first write readiness without a
//! socket error, and leaves the registry on connect failure, EOF or a read
//! error. The loop ends when it is stopped or when no connection is left.

use crate::config::ClientConfig;
use crate::runtime::{ConnPhase, Registry, StopHandle, EVENTS_CAPACITY, WAKER_TOKEN};
use mio::event::Event;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

/// Size of the shared discard buffer.
const DISCARD_BUFFER_SIZE: usize = 1 << 20;

/// Counters describing a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStats {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub bytes_received: u64,
    /// Connections still registered when `run` returned.
    pub live_connections: usize,
}

struct Connection {
    stream: TcpStream,
    phase: ConnPhase,
    bytes_received: u64,
}

enum ReadOutcome {
    WouldBlock,
    Eof,
    Failed(io::Error),
}

impl Connection {
    fn discard_input(&mut self, scratch: &mut [u8]) -> (u64, ReadOutcome) {
        let mut total = 0u64;
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return (total, ReadOutcome::Eof),
                Ok(n) => {
                    total += n as u64;
                    self.bytes_received += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return (total, ReadOutcome::WouldBlock);
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return (total, ReadOutcome::Failed(e)),
            }
        }
    }
}

/// Drives `num_clients` connections against one server.
pub struct LoadClient {
    config: ClientConfig,
    poll: Poll,
    stop: StopHandle,
}

impl LoadClient {
    pub fn new(config: ClientConfig) -> io::Result<Self> {
        let poll = Poll::new()?;
        let stop = StopHandle::new(poll.registry())?;
        Ok(Self { config, poll, stop })
    }

    /// Handle that stops `run` from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Connect every client, then discard input until stopped or all are gone.
    pub fn run(self) -> io::Result<ClientStats> {
        let LoadClient { config, poll, stop } = self;

        info!(
            server = %config.server_addr,
            num_clients = config.num_clients,
            report_interval = config.report_interval,
            "Starting load client"
        );

        let mut event_loop = EventLoop {
            poll,
            connections: Registry::new(config.num_clients as usize),
            stop,
            scratch: vec![0u8; DISCARD_BUFFER_SIZE],
            opened: 0,
            closed: 0,
            bytes_received: 0,
        };

        for client_id in 0..config.num_clients {
            debug!(client_id, "Starting client");
            event_loop.connect(config.server_addr);
        }

        let result = event_loop.run();
        event_loop.shutdown();

        let stats = event_loop.stats();
        info!(
            opened = stats.connections_opened,
            bytes = stats.bytes_received,
            "Load client finished"
        );

        result.map(|()| stats)
    }
}

struct EventLoop {
    poll: Poll,
    connections: Registry<Connection>,
    stop: StopHandle,
    scratch: Vec<u8>,
    opened: u64,
    closed: u64,
    bytes_received: u64,
}

impl EventLoop {
    fn connect(&mut self, addr: SocketAddr) {
        let mut stream = match TcpStream::connect(addr) {
            Ok(stream) => stream,
            Err(e) => {
                error!(addr = %addr, error = %e, "Connect failed");
                return;
            }
        };

        let conn_id = self.connections.next_key();
        if let Err(e) = self.poll.registry().register(
            &mut stream,
            Token(conn_id),
            Interest::READABLE | Interest::WRITABLE,
        ) {
            error!(addr = %addr, error = %e, "Failed to register connection");
            return;
        }

        let connection = Connection {
            stream,
            phase: ConnPhase::Connecting,
            bytes_received: 0,
        };
        if self.connections.insert(connection).is_some() {
            self.opened += 1;
        }
    }

    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if self.stop.is_stopped() {
                debug!("Stop requested");
                return Ok(());
            }
            if self.connections.is_empty() {
                info!("No connections left");
                return Ok(());
            }

            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.handle_event(conn_id, event),
                }
            }
        }
    }

    fn handle_event(&mut self, conn_id: usize, event: &Event) {
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };

        if conn.phase == ConnPhase::Connecting && (event.is_writable() || event.is_error()) {
            match connect_result(&conn.stream) {
                Ok(true) => {
                    if let Err(e) = self.poll.registry().reregister(
                        &mut conn.stream,
                        Token(conn_id),
                        Interest::READABLE,
                    ) {
                        error!(conn_id, error = %e, "Failed to reregister connection");
                        self.close_connection(conn_id);
                        return;
                    }
                    conn.phase = ConnPhase::Active;
                    debug!(conn_id, "Connected");
                }
                Ok(false) => return,
                Err(e) => {
                    error!(conn_id, error = %e, "Connect failed");
                    self.close_connection(conn_id);
                    return;
                }
            }
        }

        if event.is_readable() {
            let (n, outcome) = conn.discard_input(&mut self.scratch);
            self.bytes_received += n;
            match outcome {
                ReadOutcome::WouldBlock => {}
                ReadOutcome::Eof => {
                    warn!(conn_id, "EOF");
                    self.close_connection(conn_id);
                }
                ReadOutcome::Failed(e) => {
                    error!(conn_id, error = %e, "read() failed");
                    self.close_connection(conn_id);
                }
            }
        }
    }

    /// Tear down a connection. Only the first call for a given key has any effect.
    fn close_connection(&mut self, conn_id: usize) {
        let Some(mut conn) = self.connections.remove(conn_id) else {
            return;
        };
        if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
            debug!(conn_id, error = %e, "Failed to deregister connection");
        }
        self.closed += 1;
        debug!(
            conn_id,
            phase = ?conn.phase,
            bytes_received = conn.bytes_received,
            "Connection closed"
        );
    }

    fn shutdown(&mut self) {
        for conn_id in self.connections.snapshot() {
            self.close_connection(conn_id);
        }
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            connections_opened: self.opened,
            connections_closed: self.closed,
            bytes_received: self.bytes_received,
            live_connections: self.connections.len(),
        }
    }
}

/// Whether a non-blocking connect has completed.
///
/// `Ok(false)` means the handshake is still in progress.
fn connect_result(stream: &TcpStream) -> io::Result<bool> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(e),
    }
}
