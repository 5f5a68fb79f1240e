//! The multiplex engine.
//!
//! An [`Engine`] owns a set of connections and turns "make progress across
//! all of them" into a single readiness wait. It also carries the
//! blocking/non-blocking mode, the last-error surface, and the optional
//! sinks.
//!
//! The engine is single-threaded cooperative: exactly one caller drives it
//! at a time, and only [`wait`](Engine::wait) may suspend. Parallelism comes
//! from using several engines.

use crate::connection::{Connection, ConnectionId, READ_BUFFER_SIZE};
use crate::error::{ClientError, Progress};
use crate::poll::{self, PollEvents};
use crate::sink::{EventWatch, LogSink, PayloadAllocator, Verbose};
use gearman_protocol::{Command, Magic, Packet};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// Upper bound on the stored last-error message, in bytes.
pub const MAX_ERROR_SIZE: usize = 1024;

/// Engine behavior toggles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineOption {
    /// Send/recv/flush return instead of suspending; the caller drives
    /// progress through [`Engine::wait`] and [`Engine::ready`].
    NonBlocking,
    /// Inbound packets are not retained by the engine. Packets are always
    /// handed straight to callers here, so this toggle only affects the
    /// reported configuration; it exists for wire-API parity.
    DontTrackPackets,
}

impl EngineOption {
    /// Parses a protocol option token. Unrecognized tokens (including the
    /// `MAX` sentinel) are rejected.
    pub fn from_name(name: &str) -> Result<Self, ClientError> {
        match name {
            "NON_BLOCKING" => Ok(EngineOption::NonBlocking),
            "DONT_TRACK_PACKETS" => Ok(EngineOption::DontTrackPackets),
            other => Err(ClientError::UnknownOption(other.to_string())),
        }
    }
}

/// Connection multiplexer for one or more job-server links.
pub struct Engine {
    connections: HashMap<ConnectionId, Connection>,
    next_id: u64,
    /// Descriptor scratch for `wait`; grows with the connection count and
    /// never shrinks below it.
    pfds: Vec<libc::pollfd>,
    pfd_ids: Vec<ConnectionId>,
    timeout_ms: i32,
    non_blocking: bool,
    dont_track_packets: bool,
    verbose: Verbose,
    last_error: String,
    last_errno: i32,
    log_sink: Option<Box<dyn LogSink>>,
    event_watch: Option<Box<dyn EventWatch>>,
    allocator: Option<Box<dyn PayloadAllocator>>,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
            next_id: 1,
            pfds: Vec::new(),
            pfd_ids: Vec::new(),
            timeout_ms: -1,
            non_blocking: false,
            dont_track_packets: false,
            verbose: Verbose::Fatal,
            last_error: String::new(),
            last_errno: 0,
            log_sink: None,
            event_watch: None,
            allocator: None,
        }
    }

    pub fn with_options(options: &[EngineOption]) -> Self {
        let mut engine = Self::new();
        for option in options {
            engine.set_option(*option, true);
        }
        engine
    }

    /// A new engine with the same timeout and options, plus a fresh
    /// connection to every endpoint of this one. Transient packet and
    /// readiness state is not carried over, and sinks are not shared.
    pub fn try_clone(&self) -> Result<Self, ClientError> {
        let mut clone = Self::new();
        clone.timeout_ms = self.timeout_ms;
        clone.non_blocking = self.non_blocking;
        clone.dont_track_packets = self.dont_track_packets;
        for conn in self.connections.values() {
            clone.insert_connection(conn.clone_endpoint());
        }
        Ok(clone)
    }

    // =========================================================================
    // Options and configuration
    // =========================================================================

    pub fn set_option(&mut self, option: EngineOption, value: bool) {
        match option {
            EngineOption::NonBlocking => self.non_blocking = value,
            EngineOption::DontTrackPackets => self.dont_track_packets = value,
        }
    }

    pub fn option(&self, option: EngineOption) -> bool {
        match option {
            EngineOption::NonBlocking => self.non_blocking,
            EngineOption::DontTrackPackets => self.dont_track_packets,
        }
    }

    /// Wait timeout in milliseconds; negative waits indefinitely.
    pub fn timeout(&self) -> i32 {
        self.timeout_ms
    }

    pub fn set_timeout(&mut self, timeout_ms: i32) {
        self.timeout_ms = timeout_ms;
    }

    pub fn verbose(&self) -> Verbose {
        self.verbose
    }

    pub fn set_verbose(&mut self, verbose: Verbose) {
        self.verbose = verbose;
    }

    pub fn set_log_sink(&mut self, sink: Box<dyn LogSink>) {
        self.log_sink = Some(sink);
    }

    pub fn set_event_watch(&mut self, watch: Box<dyn EventWatch>) {
        self.event_watch = Some(watch);
    }

    pub fn set_payload_allocator(&mut self, allocator: Box<dyn PayloadAllocator>) {
        self.allocator = Some(allocator);
    }

    // =========================================================================
    // Connection set
    // =========================================================================

    fn insert_connection(&mut self, conn: Connection) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.connections.insert(id, conn);
        id
    }

    pub fn add_connection(&mut self, host: &str, port: u16) -> ConnectionId {
        let mut conn = Connection::new(host, port);
        if let Some(allocator) = &self.allocator {
            conn.set_read_buffer(allocator.allocate(READ_BUFFER_SIZE));
        }
        let id = self.insert_connection(conn);
        debug!(%id, host, port, "added connection");
        id
    }

    /// A fresh connection to the same endpoint as `id`, owned by this engine.
    pub fn clone_connection(&mut self, id: ConnectionId) -> Result<ConnectionId, ClientError> {
        let conn = self
            .connections
            .get(&id)
            .ok_or(ClientError::UnknownConnection(id))?;
        let clone = conn.clone_endpoint();
        Ok(self.insert_connection(clone))
    }

    /// Closes the socket and drops the connection. Returns whether `id` was
    /// present.
    pub fn remove_connection(&mut self, id: ConnectionId) -> bool {
        self.connections.remove(&id).is_some()
    }

    /// Tears down every connection, closing all sockets and discarding any
    /// in-flight packets.
    pub fn free_all_connections(&mut self) {
        self.connections.clear();
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn connection_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Handles of all current connections, in no particular order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    // =========================================================================
    // Packet I/O
    // =========================================================================

    /// Queues a packet on one connection; drains the send buffer when
    /// `flush_now` is set and the mode allows it.
    pub fn send(
        &mut self,
        id: ConnectionId,
        packet: &Packet,
        flush_now: bool,
    ) -> Result<Progress, ClientError> {
        let blocking = flush_now && !self.non_blocking;
        self.drive(id, "send", blocking, |conn, blocking, timeout_ms| {
            conn.send_packet(packet, flush_now, blocking, timeout_ms)
        })
    }

    /// Receives the next packet from one connection.
    ///
    /// With `flush` unset, or in non-blocking mode, `Ok(None)` means the
    /// frame is still incomplete; wait for readiness and retry. With `flush`
    /// set in blocking mode the call completes the frame before returning.
    pub fn recv(&mut self, id: ConnectionId, flush: bool) -> Result<Option<Packet>, ClientError> {
        let blocking = flush && !self.non_blocking;
        self.drive(id, "recv", blocking, |conn, blocking, timeout_ms| {
            conn.recv_packet(blocking, timeout_ms)
        })
    }

    /// Drains one connection's send buffer.
    pub fn flush(&mut self, id: ConnectionId) -> Result<Progress, ClientError> {
        let blocking = !self.non_blocking;
        self.drive(id, "flush", blocking, |conn, blocking, timeout_ms| {
            conn.flush(blocking, timeout_ms)
        })
    }

    /// Flushes every connection that is not already parked on the poller
    /// awaiting writability.
    ///
    /// A would-suspend outcome on any connection is swallowed; the caller is
    /// expected to `wait` next. The first hard error stops the pass.
    pub fn flush_all(&mut self) -> Result<(), ClientError> {
        let blocking = !self.non_blocking;
        let ids = self.connection_ids();
        for id in ids {
            let parked = self
                .connections
                .get(&id)
                .map(|conn| conn.is_write_pending())
                .unwrap_or(true);
            if parked {
                continue;
            }
            match self.drive(id, "flush_all", blocking, |conn, blocking, timeout_ms| {
                conn.flush(blocking, timeout_ms)
            }) {
                Ok(_) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    fn drive<T>(
        &mut self,
        id: ConnectionId,
        function: &'static str,
        blocking: bool,
        op: impl FnOnce(&mut Connection, bool, i32) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let timeout_ms = self.timeout_ms;
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(ClientError::UnknownConnection(id))?;

        let before = conn.interest();
        let result = op(conn, blocking, timeout_ms);
        let after = conn.interest();

        if before != after {
            if let Some(watch) = &self.event_watch {
                watch.watch(id, after);
            }
        }
        if let Err(err) = &result {
            self.record_error(function, err);
        }
        result
    }

    // =========================================================================
    // Readiness
    // =========================================================================

    /// Waits until at least one connection with non-zero interest becomes
    /// ready, or the engine timeout elapses.
    ///
    /// On success the readiness bits are dispatched back to the connections
    /// in the order they were polled; `ready` then yields them one by one.
    pub fn wait(&mut self) -> Result<(), ClientError> {
        self.pfds.clear();
        self.pfd_ids.clear();
        // Grow-only: capacity tracks the connection count even when fewer
        // connections carry interest right now
        self.pfds.reserve(self.connections.len());

        for (&id, conn) in &self.connections {
            let interest = conn.interest();
            if interest.is_empty() {
                continue;
            }
            let Some(fd) = conn.fd() else { continue };
            self.pfds.push(libc::pollfd {
                fd,
                events: interest.bits(),
                revents: 0,
            });
            self.pfd_ids.push(id);
        }

        if self.pfds.is_empty() {
            self.set_error("wait", format_args!("no active file descriptors"));
            return Err(ClientError::NoActiveFds);
        }

        let ready = match poll::poll(&mut self.pfds, self.timeout_ms) {
            Ok(n) => n,
            Err(err) => {
                self.last_errno = err.raw_os_error().unwrap_or(0);
                self.set_error("wait", format_args!("poll:{err}"));
                return Err(ClientError::Io(err));
            }
        };

        if ready == 0 {
            self.set_error("wait", format_args!("timeout reached"));
            return Err(ClientError::Timeout);
        }

        for index in 0..self.pfds.len() {
            let revents = PollEvents::from_bits_truncate(self.pfds[index].revents);
            let id = self.pfd_ids[index];
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.set_revents(revents)?;
            }
        }

        Ok(())
    }

    /// The next connection marked ready by the latest wait, with its ready
    /// flag cleared.
    ///
    /// No cursor is kept between calls: connections may be removed while the
    /// caller processes one, and the next call simply rescans.
    pub fn ready(&mut self) -> Option<ConnectionId> {
        for (&id, conn) in self.connections.iter_mut() {
            if conn.take_ready() {
                return Some(id);
            }
        }
        None
    }

    // =========================================================================
    // Synchronous helpers
    // =========================================================================

    /// One blocking request/response round trip on a single connection,
    /// regardless of the engine's caller-visible mode.
    pub fn request(&mut self, id: ConnectionId, packet: &Packet) -> Result<Packet, ClientError> {
        self.with_blocking(|engine| {
            let _ = engine.send(id, packet, true)?;
            engine.recv(id, true)?.ok_or(ClientError::ConnectionLost)
        })
    }

    /// Round-trips `workload` through every connection and verifies each
    /// reply byte-for-byte.
    pub fn echo(&mut self, workload: &[u8]) -> Result<(), ClientError> {
        let packet = Packet::with_args(Magic::Request, Command::EchoReq, &[workload])?;

        self.with_blocking(|engine| {
            let ids = engine.connection_ids();
            for id in ids {
                let _ = engine.send(id, &packet, true)?;
                let reply = engine.recv(id, true)?.ok_or(ClientError::ConnectionLost)?;

                let data = reply.workload().unwrap_or(&[]);
                if data != workload {
                    engine.set_error("echo", format_args!("corruption during echo"));
                    return Err(ClientError::EchoCorruption);
                }
            }
            Ok(())
        })
    }

    /// Runs `body` in a blocking scope: the non-blocking option is cleared
    /// on entry and restored on every exit path, errors included.
    fn with_blocking<T>(
        &mut self,
        body: impl FnOnce(&mut Self) -> Result<T, ClientError>,
    ) -> Result<T, ClientError> {
        let saved = self.non_blocking;
        self.non_blocking = false;
        let result = body(self);
        self.non_blocking = saved;
        result
    }

    // =========================================================================
    // Error and log surface
    // =========================================================================

    /// The most recent error message, formatted `"<function>:<message>"`.
    /// Empty until the first failure; overwritten by each subsequent one.
    pub fn last_error(&self) -> &str {
        &self.last_error
    }

    /// OS errno of the most recent system-call failure, zero otherwise.
    pub fn last_errno(&self) -> i32 {
        self.last_errno
    }

    pub(crate) fn set_error(&mut self, function: &str, args: fmt::Arguments<'_>) {
        let message = format!("{function}:{args}");
        if let Some(sink) = &self.log_sink {
            sink.log(Verbose::Fatal, &message);
            return;
        }
        self.last_error = truncate_to(message, MAX_ERROR_SIZE);
    }

    fn record_error(&mut self, function: &'static str, err: &ClientError) {
        if let ClientError::Io(io_err) = err {
            self.last_errno = io_err.raw_os_error().unwrap_or(0);
        }
        self.set_error(function, format_args!("{err}"));
    }

    /// Emits a log line, honoring the verbosity filter. Delivered to the log
    /// sink when installed, printed to stdout otherwise.
    pub fn log(&self, verbose: Verbose, message: &str) {
        if verbose > self.verbose {
            return;
        }
        match &self.log_sink {
            Some(sink) => sink.log(verbose, message),
            None => println!("{:>5}: {}", verbose.name(), message),
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate_to(mut message: String, max: usize) -> String {
    if message.len() > max {
        let mut end = max;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};

    /// Accepts one connection and answers every request with an ECHO_RES
    /// carrying `reply`, or mirroring the request workload when `reply` is
    /// `None`. Exits once the peer closes.
    fn spawn_echo_broker(reply: Option<Vec<u8>>) -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut decoder = gearman_protocol::Decoder::new();
            let mut buf = [0u8; 1024];
            loop {
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => n,
                };
                decoder.extend(&buf[..n]);
                while let Some(packet) = decoder.decode_packet().unwrap() {
                    let workload = match &reply {
                        Some(bytes) => bytes.clone(),
                        None => packet.workload().unwrap_or(&[]).to_vec(),
                    };
                    let response = Packet::with_args(
                        Magic::Response,
                        Command::EchoRes,
                        &[workload.as_slice()],
                    )
                    .unwrap();
                    // The peer may tear down without reading the reply
                    if stream.write_all(&response.encode()).is_err() {
                        return;
                    }
                }
            }
        });
        (addr, handle)
    }

    /// Accepts one connection, consumes everything, never replies.
    fn spawn_silent_broker() -> (SocketAddr, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(_) => continue,
                }
            }
        });
        (addr, handle)
    }

    fn echo_packet(workload: &[u8]) -> Packet {
        Packet::with_args(Magic::Request, Command::EchoReq, &[workload]).unwrap()
    }

    #[test]
    fn test_connection_accounting() {
        let mut engine = Engine::new();
        assert_eq!(engine.connection_count(), 0);

        let a = engine.add_connection("localhost", 4730);
        let b = engine.add_connection("localhost", 4731);
        assert_eq!(engine.connection_count(), 2);
        assert_eq!(engine.connection_ids().len(), 2);

        assert!(engine.remove_connection(a));
        assert!(!engine.remove_connection(a));
        assert_eq!(engine.connection_count(), 1);
        assert!(engine.connection(b).is_some());

        engine.free_all_connections();
        assert_eq!(engine.connection_count(), 0);
    }

    #[test]
    fn test_clone_connection_copies_endpoint_only() {
        let mut engine = Engine::new();
        let a = engine.add_connection("job-server.example", 4730);
        let b = engine.clone_connection(a).unwrap();

        assert_ne!(a, b);
        assert_eq!(engine.connection_count(), 2);
        let clone = engine.connection(b).unwrap();
        assert_eq!(clone.host(), "job-server.example");
        assert_eq!(clone.port(), 4730);
        assert!(!clone.is_connected());
    }

    #[test]
    fn test_wait_without_interest_returns_no_active_fds() {
        let mut engine = Engine::new();
        assert!(matches!(engine.wait(), Err(ClientError::NoActiveFds)));

        // A connection with zero interest does not change that
        engine.add_connection("localhost", 4730);
        assert!(matches!(engine.wait(), Err(ClientError::NoActiveFds)));
        assert_eq!(engine.last_error(), "wait:no active file descriptors");
    }

    #[test]
    fn test_wait_timeout_leaves_connection_state_unchanged() {
        let (addr, handle) = spawn_silent_broker();
        let mut engine = Engine::new();
        let id = engine.add_connection(&addr.ip().to_string(), addr.port());

        // Establish the connection and ask for a reply that will never come
        let progress = engine.send(id, &echo_packet(b"ping"), true).unwrap();
        assert!(progress.is_complete());
        engine.set_option(EngineOption::NonBlocking, true);
        assert!(engine.recv(id, true).unwrap().is_none());

        let interest = engine.connection(id).unwrap().interest();
        assert!(interest.readable());

        engine.set_timeout(50);
        assert!(matches!(engine.wait(), Err(ClientError::Timeout)));
        assert_eq!(engine.connection(id).unwrap().interest(), interest);
        assert!(matches!(engine.wait(), Err(ClientError::Timeout)));
        assert_eq!(engine.last_error(), "wait:timeout reached");

        engine.free_all_connections();
        handle.join().unwrap();
    }

    #[test]
    fn test_echo_round_trip() {
        let (addr, handle) = spawn_echo_broker(None);
        let mut engine = Engine::new();
        let id = engine.add_connection(&addr.ip().to_string(), addr.port());

        engine.echo(b"hello").unwrap();

        assert_eq!(engine.last_error(), "");
        assert!(!engine.option(EngineOption::NonBlocking));
        let conn = engine.connection(id).unwrap();
        assert_eq!(conn.send_buffered(), 0);
        assert_eq!(conn.recv_buffered(), 0);

        engine.free_all_connections();
        handle.join().unwrap();
    }

    #[test]
    fn test_echo_detects_corruption() {
        let (addr, handle) = spawn_echo_broker(Some(b"hellp".to_vec()));
        let mut engine = Engine::new();
        engine.set_option(EngineOption::NonBlocking, true);
        engine.add_connection(&addr.ip().to_string(), addr.port());

        let result = engine.echo(b"hello");
        assert!(matches!(result, Err(ClientError::EchoCorruption)));

        // The blocking scope restored the caller-visible mode
        assert!(engine.option(EngineOption::NonBlocking));
        assert_eq!(engine.last_error(), "echo:corruption during echo");

        engine.free_all_connections();
        handle.join().unwrap();
    }

    #[test]
    fn test_nonblocking_wait_ready_recv_cycle() {
        let (addr, handle) = spawn_echo_broker(None);
        let mut engine = Engine::new();
        engine.set_option(EngineOption::NonBlocking, true);
        let id = engine.add_connection(&addr.ip().to_string(), addr.port());

        // Drive the send until it completes without ever blocking
        let mut progress = engine.send(id, &echo_packet(b"marco"), true).unwrap();
        while progress.is_pending() {
            engine.wait().unwrap();
            progress = engine.flush(id).unwrap();
        }

        // Drive the receive through wait/ready
        let reply = loop {
            if let Some(packet) = engine.recv(id, false).unwrap() {
                break packet;
            }
            engine.wait().unwrap();
            assert_eq!(engine.ready(), Some(id));
            assert_eq!(engine.ready(), None);
        };

        assert_eq!(reply.command(), Command::EchoRes);
        assert_eq!(reply.workload().unwrap(), b"marco");

        engine.free_all_connections();
        handle.join().unwrap();
    }

    #[test]
    fn test_flush_all_drains_queued_packets() {
        let (addr_a, handle_a) = spawn_echo_broker(None);
        let (addr_b, handle_b) = spawn_echo_broker(None);
        let mut engine = Engine::new();
        let a = engine.add_connection(&addr_a.ip().to_string(), addr_a.port());
        let b = engine.add_connection(&addr_b.ip().to_string(), addr_b.port());

        let packet = echo_packet(b"bulk");
        assert!(engine.send(a, &packet, false).unwrap().is_pending());
        assert!(engine.send(b, &packet, false).unwrap().is_pending());
        assert!(engine.connection(a).unwrap().send_buffered() > 0);
        assert!(engine.connection(b).unwrap().send_buffered() > 0);

        engine.flush_all().unwrap();

        assert_eq!(engine.connection(a).unwrap().send_buffered(), 0);
        assert_eq!(engine.connection(b).unwrap().send_buffered(), 0);

        engine.free_all_connections();
        handle_a.join().unwrap();
        handle_b.join().unwrap();
    }

    #[test]
    fn test_try_clone_copies_configuration() {
        let mut engine = Engine::new();
        engine.set_timeout(750);
        engine.set_option(EngineOption::NonBlocking, true);
        engine.add_connection("a.example", 4730);
        engine.add_connection("b.example", 4731);

        let clone = engine.try_clone().unwrap();
        assert_eq!(clone.timeout(), 750);
        assert!(clone.option(EngineOption::NonBlocking));
        assert_eq!(clone.connection_count(), 2);

        let mut hosts: Vec<String> = clone
            .connection_ids()
            .into_iter()
            .map(|id| clone.connection(id).unwrap().host().to_string())
            .collect();
        hosts.sort();
        assert_eq!(hosts, vec!["a.example".to_string(), "b.example".to_string()]);
    }

    #[test]
    fn test_option_token_parsing() {
        assert_eq!(
            EngineOption::from_name("NON_BLOCKING").unwrap(),
            EngineOption::NonBlocking
        );
        assert_eq!(
            EngineOption::from_name("DONT_TRACK_PACKETS").unwrap(),
            EngineOption::DontTrackPackets
        );
        assert!(matches!(
            EngineOption::from_name("MAX"),
            Err(ClientError::UnknownOption(_))
        ));
        assert!(matches!(
            EngineOption::from_name("bogus"),
            Err(ClientError::UnknownOption(_))
        ));
    }

    struct CapturingSink {
        lines: Arc<Mutex<Vec<(Verbose, String)>>>,
    }

    impl LogSink for CapturingSink {
        fn log(&self, verbose: Verbose, message: &str) {
            self.lines.lock().unwrap().push((verbose, message.to_string()));
        }
    }

    #[test]
    fn test_log_sink_receives_errors_instead_of_buffer() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        engine.set_log_sink(Box::new(CapturingSink {
            lines: lines.clone(),
        }));

        assert!(matches!(engine.wait(), Err(ClientError::NoActiveFds)));

        // Delivered to the sink at FATAL; the buffer stays empty
        assert_eq!(engine.last_error(), "");
        let captured = lines.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].0, Verbose::Fatal);
        assert_eq!(captured[0].1, "wait:no active file descriptors");
    }

    #[test]
    fn test_log_verbosity_filter() {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let mut engine = Engine::new();
        engine.set_log_sink(Box::new(CapturingSink {
            lines: lines.clone(),
        }));

        engine.log(Verbose::Debug, "hidden");
        assert!(lines.lock().unwrap().is_empty());

        engine.set_verbose(Verbose::Debug);
        engine.log(Verbose::Debug, "shown");
        engine.log(Verbose::Crazy, "still hidden");

        let captured = lines.lock().unwrap();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].1, "shown");
    }

    #[test]
    fn test_bulk_teardown_closes_every_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = thread::spawn(move || {
            let mut peers = Vec::new();
            for _ in 0..3 {
                let (mut stream, _) = listener.accept().unwrap();
                // Leave a partial frame in each client's receive buffer
                stream.write_all(b"\0RES\x00\x00").unwrap();
                peers.push(stream);
            }
            // Every socket must observe EOF once the engine goes away
            for mut stream in peers {
                let mut buf = [0u8; 64];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
            }
        });

        let mut engine = Engine::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = engine.add_connection("127.0.0.1", addr.port());
            let progress = engine.send(id, &echo_packet(b"x"), true).unwrap();
            assert!(progress.is_complete());
            ids.push(id);
        }

        engine.set_option(EngineOption::NonBlocking, true);
        for &id in &ids {
            // Pull the partial frame into the connection's decoder
            loop {
                if engine.connection(id).unwrap().recv_buffered() > 0 {
                    break;
                }
                assert!(engine.recv(id, false).unwrap().is_none());
                if engine.connection(id).unwrap().recv_buffered() > 0 {
                    break;
                }
                engine.wait().unwrap();
            }
        }

        drop(engine);
        handle.join().unwrap();
    }

    #[test]
    fn test_last_error_is_bounded() {
        let mut engine = Engine::new();
        let long = "x".repeat(4 * MAX_ERROR_SIZE);
        engine.set_error("op", format_args!("{long}"));
        assert_eq!(engine.last_error().len(), MAX_ERROR_SIZE);
        assert!(engine.last_error().starts_with("op:"));
    }
}
