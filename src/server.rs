//! Frame broadcast server.
//!
//! A single mio event loop owns the listener, the session registry and the
//! frame producer. Accepts, readiness events, the frame timer and the exit
//! timer are all handled on that loop, so no lock guards the registry: a tick
//! always sees a consistent set of sessions.
//!
//! ## Fan-out
//!
//! Each timer firing produces `burst` frames. For every frame the loop takes a
//! snapshot of the registry keys, enqueues one clone of the frame on each
//! session's `DeferredSender` and flushes it. Sessions accepted after the
//! snapshot start receiving from the next frame on.

use crate::config::ServerConfig;
use crate::frame::FrameProducer;
use crate::runtime::{
    poll_timeout, Deadline, DeferredSender, FlushStatus, PagePool, PeriodicTimer, PoolStats,
    Registry, StopHandle, EVENTS_CAPACITY, LISTENER_TOKEN, WAKER_TOKEN,
};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Listen backlog for the server socket.
const LISTEN_BACKLOG: i32 = 1024;

/// Scratch space for discarding inbound bytes.
const DISCARD_BUFFER_SIZE: usize = 4096;

/// Counters describing a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStats {
    /// Frame timer firings.
    pub ticks: u64,
    pub frames_produced: u64,
    /// Ticks abandoned because a frame could not be allocated.
    pub failed_ticks: u64,
    pub sessions_accepted: u64,
    /// Sessions torn down by EOF or an I/O error.
    pub sessions_closed_on_error: u64,
    /// Sessions torn down by the shutdown sweep.
    pub sessions_closed_on_shutdown: u64,
    /// Sessions still registered when `run` returned.
    pub live_sessions: usize,
    pub pool: PoolStats,
}

/// Why a session is being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    Eof,
    ReadError,
    WriteError,
    Hangup,
    Shutdown,
}

/// One accepted client.
struct Session {
    stream: TcpStream,
    peer: SocketAddr,
    sender: DeferredSender,
    /// Whether WRITABLE is part of the registered interest.
    write_interest: bool,
}

impl Session {
    /// Flush queued frames and keep write interest in line with what's pending.
    fn flush(&mut self, registry: &mio::Registry, token: Token) -> io::Result<()> {
        match self.sender.flush(&mut self.stream)? {
            FlushStatus::Pending if !self.write_interest => {
                registry.reregister(
                    &mut self.stream,
                    token,
                    Interest::READABLE | Interest::WRITABLE,
                )?;
                self.write_interest = true;
            }
            FlushStatus::Drained if self.write_interest => {
                registry.reregister(&mut self.stream, token, Interest::READABLE)?;
                self.write_interest = false;
            }
            _ => {}
        }
        Ok(())
    }

    /// Read and throw away whatever the peer sent.
    fn discard_input(&mut self, scratch: &mut [u8]) -> Result<(), CloseReason> {
        loop {
            match self.stream.read(scratch) {
                Ok(0) => return Err(CloseReason::Eof),
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "Session read failed");
                    return Err(CloseReason::ReadError);
                }
            }
        }
    }
}

/// A bound, not yet running, broadcast server.
pub struct Server {
    config: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    stop: StopHandle,
}

impl Server {
    /// Bind the listening socket and prepare the event loop.
    pub fn bind(config: ServerConfig) -> io::Result<Self> {
        let poll = Poll::new()?;

        let listener = create_listener(config.bind)?;
        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        let stop = StopHandle::new(poll.registry())?;

        Ok(Self {
            config,
            poll,
            listener,
            local_addr,
            stop,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops `run` from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Run until stopped or the exit timer expires, then tear down every session.
    pub fn run(self) -> io::Result<ServerStats> {
        let mut event_loop = self.into_event_loop(Instant::now());

        let result = event_loop.run();
        event_loop.shutdown();

        let stats = event_loop.stats();
        info!(
            ticks = stats.ticks,
            frames = stats.frames_produced,
            sessions = stats.sessions_accepted,
            "Broadcast server finished"
        );

        result.map(|()| stats)
    }

    fn into_event_loop(self, now: Instant) -> EventLoop {
        let Server {
            config,
            poll,
            listener,
            local_addr,
            stop,
        } = self;

        let pool = PagePool::new(config.page_size, config.min_pages, config.max_pages);

        info!(
            addr = %local_addr,
            frame_duration_ms = config.duration.as_millis() as u64,
            frame_size = config.frame_size,
            burst_width = config.burst,
            exit_after_secs = config.exit_after.map(|d| d.as_secs()),
            "Starting broadcast server"
        );

        EventLoop {
            poll,
            listener,
            sessions: Registry::new(config.max_sessions),
            producer: FrameProducer::new(pool, config.frame_size),
            burst: config.burst,
            frame_timer: PeriodicTimer::new(config.tick_period(), now),
            exit_timer: Deadline::after(now, config.exit_after),
            stop,
            scratch: vec![0u8; DISCARD_BUFFER_SIZE],
            stats: Counters::default(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    ticks: u64,
    failed_ticks: u64,
    sessions_accepted: u64,
    closed_on_error: u64,
    closed_on_shutdown: u64,
}

struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    sessions: Registry<Session>,
    producer: FrameProducer,
    burst: u32,
    frame_timer: PeriodicTimer,
    exit_timer: Deadline,
    stop: StopHandle,
    scratch: Vec<u8>,
    stats: Counters,
}

impl EventLoop {
    fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            if self.stop.is_stopped() {
                debug!("Stop requested");
                return Ok(());
            }

            let now = Instant::now();
            if self.exit_timer.expired(now) {
                info!("Exit timer expired");
                return Ok(());
            }
            if self.frame_timer.fire(now) {
                self.tick();
            }

            let timeout = poll_timeout(
                Instant::now(),
                [Some(self.frame_timer.deadline()), self.exit_timer.instant()],
            );
            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.handle_session_event(conn_id, event),
                }
            }
        }
    }

    /// Produce and fan out one burst of frames.
    fn tick(&mut self) {
        self.stats.ticks += 1;

        for _ in 0..self.burst {
            let frame = match self.producer.produce() {
                Ok(frame) => frame,
                Err(e) => {
                    error!(error = %e, "Frame allocation failed, abandoning tick");
                    self.stats.failed_ticks += 1;
                    return;
                }
            };

            for conn_id in self.sessions.snapshot() {
                let Some(session) = self.sessions.get_mut(conn_id) else {
                    continue;
                };
                session.sender.enqueue(frame.clone());
                if let Err(e) = session.flush(self.poll.registry(), Token(conn_id)) {
                    debug!(conn_id, error = %e, "Session write failed");
                    self.close_session(conn_id, CloseReason::WriteError);
                }
            }
            // Pages return to the pool once every sender has let go
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.register_session(stream, peer),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn register_session(&mut self, mut stream: TcpStream, peer: SocketAddr) {
        if self.sessions.is_full() {
            warn!(peer = %peer, "Session limit reached, rejecting connection");
            return;
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let conn_id = self.sessions.next_key();
        if let Err(e) =
            self.poll
                .registry()
                .register(&mut stream, Token(conn_id), Interest::READABLE)
        {
            error!(peer = %peer, error = %e, "Failed to register session");
            return;
        }

        let session = Session {
            stream,
            peer,
            sender: DeferredSender::new(),
            write_interest: false,
        };
        if self.sessions.insert(session).is_none() {
            // Capacity was checked above; nothing else inserts in between
            return;
        }
        self.stats.sessions_accepted += 1;
        debug!(conn_id, peer = %peer, "Accepted session");
    }

    fn handle_session_event(&mut self, conn_id: usize, event: &Event) {
        let Some(session) = self.sessions.get_mut(conn_id) else {
            return;
        };

        if event.is_readable() {
            if let Err(reason) = session.discard_input(&mut self.scratch) {
                self.close_session(conn_id, reason);
                return;
            }
        }

        if event.is_writable() {
            if let Err(e) = session.flush(self.poll.registry(), Token(conn_id)) {
                debug!(conn_id, error = %e, "Session write failed");
                self.close_session(conn_id, CloseReason::WriteError);
                return;
            }
        }

        if event.is_error() || (event.is_read_closed() && event.is_write_closed()) {
            self.close_session(conn_id, CloseReason::Hangup);
        }
    }

    /// Tear down a session. Only the first call for a given key has any effect.
    fn close_session(&mut self, conn_id: usize, reason: CloseReason) {
        let Some(mut session) = self.sessions.remove(conn_id) else {
            return;
        };

        if let Err(e) = self.poll.registry().deregister(&mut session.stream) {
            debug!(conn_id, error = %e, "Failed to deregister session");
        }
        let dropped = session.sender.close();

        if reason == CloseReason::Shutdown {
            self.stats.closed_on_shutdown += 1;
        } else {
            self.stats.closed_on_error += 1;
        }

        debug!(
            conn_id,
            peer = %session.peer,
            reason = ?reason,
            bytes_sent = session.sender.bytes_sent(),
            dropped_frames = dropped,
            "Session closed"
        );
    }

    /// Push every remaining session through the regular teardown path.
    fn shutdown(&mut self) {
        for conn_id in self.sessions.snapshot() {
            self.close_session(conn_id, CloseReason::Shutdown);
        }
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }
    }

    fn stats(&self) -> ServerStats {
        ServerStats {
            ticks: self.stats.ticks,
            frames_produced: self.producer.produced(),
            failed_ticks: self.stats.failed_ticks,
            sessions_accepted: self.stats.sessions_accepted,
            sessions_closed_on_error: self.stats.closed_on_error,
            sessions_closed_on_shutdown: self.stats.closed_on_shutdown,
            live_sessions: self.sessions.len(),
            pool: self.producer.pool().stats(),
        }
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::frame_fills;
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::Duration;

    fn test_config(duration_ms: u64, frame_size: usize, burst: u32) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            duration: Duration::from_millis(duration_ms),
            frame_size,
            burst,
            exit_after: None,
            max_sessions: 64,
            page_size: 4096,
            min_pages: 16,
            max_pages: 0,
            log_level: "info".to_string(),
        }
    }

    /// Read everything the server sends until it closes the connection.
    fn read_to_close(mut stream: StdTcpStream) -> Vec<u8> {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut received = Vec::new();
        let _ = stream.read_to_end(&mut received);
        received
    }

    fn assert_consecutive(fills: &[u8]) {
        for pair in fills.windows(2) {
            assert_eq!(pair[1], pair[0].wrapping_add(1), "fills: {:?}", fills);
        }
    }

    #[test]
    fn test_broadcast_frames_to_client() {
        let server = Server::bind(test_config(40, 100, 1)).unwrap();
        let addr = server.local_addr();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());

        let client = StdTcpStream::connect(addr).unwrap();
        let reader = thread::spawn(move || read_to_close(client));

        thread::sleep(Duration::from_millis(300));
        stop.stop();
        let stats = handle.join().unwrap().unwrap();
        let received = reader.join().unwrap();

        assert_eq!(received.len() % 100, 0);
        let fills = frame_fills(&received, 100).expect("frames must be uniform");
        assert!(fills.len() >= 4, "only {} frames received", fills.len());
        assert_consecutive(&fills);

        assert_eq!(stats.sessions_accepted, 1);
        assert_eq!(stats.sessions_closed_on_shutdown, 1);
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.frames_produced, stats.ticks);
    }

    #[test]
    fn test_burst_groups_are_spaced_by_tick_period() {
        let config = test_config(50, 10, 3);
        let period = config.tick_period();
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());

        let mut client = StdTcpStream::connect(addr).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = thread::spawn(move || {
            // Arrival time of every received byte's read
            let mut arrivals = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match client.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => arrivals.extend(std::iter::repeat(Instant::now()).take(n)),
                }
            }
            arrivals
        });

        thread::sleep(Duration::from_millis(800));
        stop.stop();
        handle.join().unwrap().unwrap();
        let arrivals = reader.join().unwrap();

        let groups: Vec<&[Instant]> = arrivals.chunks_exact(30).collect();
        assert!(groups.len() >= 3, "only {} groups received", groups.len());

        for group in &groups {
            let spread = group[29].duration_since(group[0]);
            assert!(spread < Duration::from_millis(20), "burst spread {:?}", spread);
        }
        for pair in groups.windows(2) {
            let gap = pair[1][0].duration_since(pair[0][0]);
            assert!(
                gap >= period - Duration::from_millis(30) && gap <= period * 2,
                "gap {:?} for period {:?}",
                gap,
                period
            );
        }
    }

    #[test]
    fn test_burst_sends_whole_groups() {
        let server = Server::bind(test_config(20, 10, 3)).unwrap();
        let addr = server.local_addr();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());

        let client = StdTcpStream::connect(addr).unwrap();
        let reader = thread::spawn(move || read_to_close(client));

        thread::sleep(Duration::from_millis(300));
        stop.stop();
        let stats = handle.join().unwrap().unwrap();
        let received = reader.join().unwrap();

        assert_eq!(stats.frames_produced, stats.ticks * 3);
        assert!(!received.is_empty());
        // Every tick enqueues three frames at once
        assert_eq!(received.len() % 30, 0);
        let fills = frame_fills(&received, 10).unwrap();
        assert_consecutive(&fills);
    }

    #[test]
    fn test_every_session_gets_the_same_frames() {
        let server = Server::bind(test_config(20, 64, 1)).unwrap();
        let addr = server.local_addr();
        let stop = server.stop_handle();

        // Both connections sit in the backlog before the loop starts
        let a = StdTcpStream::connect(addr).unwrap();
        let b = StdTcpStream::connect(addr).unwrap();
        let handle = thread::spawn(move || server.run());
        let reader_a = thread::spawn(move || read_to_close(a));
        let reader_b = thread::spawn(move || read_to_close(b));

        thread::sleep(Duration::from_millis(200));
        stop.stop();
        let stats = handle.join().unwrap().unwrap();
        let fills_a = frame_fills(&reader_a.join().unwrap(), 64).unwrap();
        let fills_b = frame_fills(&reader_b.join().unwrap(), 64).unwrap();

        assert_eq!(stats.sessions_accepted, 2);
        assert!(!fills_a.is_empty());
        assert_eq!(fills_a, fills_b);
    }

    #[test]
    fn test_exit_after_tears_down_sessions() {
        let mut config = test_config(40, 32, 1);
        config.exit_after = Some(Duration::from_secs(1));
        let server = Server::bind(config).unwrap();
        let addr = server.local_addr();

        let started = Instant::now();
        let handle = thread::spawn(move || server.run());
        let client = StdTcpStream::connect(addr).unwrap();
        let reader = thread::spawn(move || read_to_close(client));

        let stats = handle.join().unwrap().unwrap();
        let elapsed = started.elapsed();
        let received = reader.join().unwrap();

        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.sessions_closed_on_shutdown, 1);
        assert!(!received.is_empty());

        // With every session gone the pool has all pages back
        assert_eq!(stats.pool.pages_in_use(), 0);
    }

    #[test]
    fn test_disconnected_client_is_removed() {
        let server = Server::bind(test_config(10, 16, 1)).unwrap();
        let addr = server.local_addr();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());

        let client = StdTcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(100));
        drop(client);
        thread::sleep(Duration::from_millis(200));

        stop.stop();
        let stats = handle.join().unwrap().unwrap();

        assert_eq!(stats.sessions_accepted, 1);
        assert_eq!(stats.sessions_closed_on_error, 1);
        assert_eq!(stats.sessions_closed_on_shutdown, 0);
        assert_eq!(stats.live_sessions, 0);
    }

    #[test]
    fn test_reset_peer_is_closed_once() {
        let server = Server::bind(test_config(10, 64, 1)).unwrap();
        let addr = server.local_addr();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());

        let client = StdTcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(100));
        socket2::SockRef::from(&client)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(client);
        thread::sleep(Duration::from_millis(200));

        stop.stop();
        let stats = handle.join().unwrap().unwrap();

        assert_eq!(stats.sessions_accepted, 1);
        assert_eq!(stats.sessions_closed_on_error, 1);
        assert_eq!(stats.sessions_closed_on_shutdown, 0);
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.pool.pages_in_use(), 0);
    }

    #[test]
    fn test_write_error_during_tick_tears_down_once() {
        let server = Server::bind(test_config(1000, 64, 2)).unwrap();
        let addr = server.local_addr();
        let mut event_loop = server.into_event_loop(Instant::now());

        let peer = StdTcpStream::connect(addr).unwrap();
        let healthy = StdTcpStream::connect(addr).unwrap();
        thread::sleep(Duration::from_millis(50));
        event_loop.accept_connections();
        let keys = event_loop.sessions.snapshot();
        assert_eq!(keys.len(), 2);

        // Reset the first peer without letting the loop see a read event
        socket2::SockRef::from(&peer)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(peer);
        thread::sleep(Duration::from_millis(50));

        event_loop.tick();
        assert_eq!(event_loop.stats.closed_on_error, 1);
        assert!(event_loop.sessions.get(keys[0]).is_none());
        assert!(event_loop.sessions.get(keys[1]).is_some());

        // Closing an already closed session changes nothing
        event_loop.close_session(keys[0], CloseReason::WriteError);
        event_loop.close_session(keys[0], CloseReason::Shutdown);
        assert_eq!(event_loop.stats.closed_on_error, 1);
        assert_eq!(event_loop.stats.closed_on_shutdown, 0);

        event_loop.shutdown();
        event_loop.close_session(keys[1], CloseReason::Shutdown);
        let stats = event_loop.stats();

        assert_eq!(stats.frames_produced, 2);
        assert_eq!(stats.sessions_closed_on_error, 1);
        assert_eq!(stats.sessions_closed_on_shutdown, 1);
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.pool.pages_in_use(), 0);
        drop(healthy);
    }

    #[test]
    fn test_exit_after_overflow_never_expires() {
        use crate::config::ServerArgs;
        use clap::Parser;

        let args = ServerArgs::try_parse_from([
            "bmeter-server",
            "--bind",
            "127.0.0.1:0",
            "--exit-after",
            "18446744073709551615",
        ])
        .unwrap();
        let config = ServerConfig::from_args(args).unwrap();
        let server = Server::bind(config).unwrap();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());

        thread::sleep(Duration::from_millis(100));
        stop.stop();
        let stats = handle.join().unwrap().unwrap();
        assert_eq!(stats.live_sessions, 0);
    }

    #[test]
    fn test_exhausted_pool_abandons_ticks() {
        let mut config = test_config(10, 8192, 1);
        config.page_size = 4096;
        config.min_pages = 1;
        config.max_pages = 1;
        let server = Server::bind(config).unwrap();
        let stop = server.stop_handle();
        let handle = thread::spawn(move || server.run());

        thread::sleep(Duration::from_millis(100));
        stop.stop();
        let stats = handle.join().unwrap().unwrap();

        assert!(stats.ticks > 0);
        assert_eq!(stats.failed_ticks, stats.ticks);
        assert_eq!(stats.frames_produced, 0);
    }

    #[test]
    fn test_bind_conflict_is_an_error() {
        let server = Server::bind(test_config(40, 10, 1)).unwrap();
        let mut config = test_config(40, 10, 1);
        config.bind = server.local_addr();

        // SO_REUSEADDR does not allow two live listeners on one port
        assert!(Server::bind(config).is_err());
    }
}
