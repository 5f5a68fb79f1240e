//! Connection management.
//!
//! A [`Connection`] owns one non-blocking stream socket to a job server,
//! plus the send buffer, the in-flight receive decoder, and the readiness
//! bookkeeping the engine uses to drive it. Connections are created through
//! an engine and addressed by [`ConnectionId`].

use crate::error::{ClientError, Progress};
use crate::poll::{self, PollEvents};
use bytes::{Buf, BytesMut};
use gearman_protocol::{Decoder, Packet};
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::{debug, trace, warn};

/// Default receive buffer size (8 KiB).
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Stable handle for a connection owned by an engine.
///
/// Handles stay valid across removals of other connections and are never
/// reused within one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Offline,
    Connecting,
    Connected,
}

/// One stream connection to a job server.
pub struct Connection {
    host: String,
    port: u16,
    addr: Option<SocketAddr>,
    stream: Option<TcpStream>,
    state: ConnState,
    send_buf: BytesMut,
    decoder: Decoder,
    read_buf: BytesMut,
    interest: PollEvents,
    revents: PollEvents,
    ready: bool,
    write_pending: bool,
}

impl Connection {
    pub(crate) fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            addr: None,
            stream: None,
            state: ConnState::Offline,
            send_buf: BytesMut::new(),
            decoder: Decoder::new(),
            read_buf: BytesMut::zeroed(READ_BUFFER_SIZE),
            interest: PollEvents::empty(),
            revents: PollEvents::empty(),
            ready: false,
            write_pending: false,
        }
    }

    /// A fresh connection to the same endpoint. Transient state (buffers,
    /// sockets, readiness) is never carried over.
    pub(crate) fn clone_endpoint(&self) -> Self {
        Self::new(&self.host, self.port)
    }

    pub(crate) fn set_read_buffer(&mut self, mut buf: BytesMut) {
        buf.resize(READ_BUFFER_SIZE, 0);
        self.read_buf = buf;
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Connected
    }

    /// The events this connection wants from the next readiness wait.
    pub fn interest(&self) -> PollEvents {
        self.interest
    }

    /// Readiness snapshot from the latest wait.
    pub fn revents(&self) -> PollEvents {
        self.revents
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub(crate) fn take_ready(&mut self) -> bool {
        std::mem::take(&mut self.ready)
    }

    /// True while a write or connect is parked on the poller: flushing again
    /// before the next readiness report cannot make progress.
    pub(crate) fn is_write_pending(&self) -> bool {
        self.write_pending
    }

    /// Bytes queued for sending but not yet written to the socket.
    pub fn send_buffered(&self) -> usize {
        self.send_buf.len()
    }

    /// Bytes received but not yet consumed as a complete packet.
    pub fn recv_buffered(&self) -> usize {
        self.decoder.buffered()
    }

    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(|stream| stream.as_raw_fd())
    }

    /// Stores the readiness bits from the last wait and marks the connection
    /// ready iff they intersect its interest.
    ///
    /// A hang-up with nothing left to read means the peer is gone; the
    /// connection is closed and `ConnectionLost` returned.
    pub fn set_revents(&mut self, revents: PollEvents) -> Result<(), ClientError> {
        self.revents = revents;
        self.ready = revents.intersects(self.interest);
        if revents.writable() {
            self.write_pending = false;
        }

        if revents.hangup() && !revents.readable() {
            debug!(host = %self.host, port = self.port, "peer hung up");
            self.close();
            return Err(ClientError::ConnectionLost);
        }

        Ok(())
    }

    /// Drops the socket and clears all transient state.
    pub(crate) fn close(&mut self) {
        if self.stream.take().is_some() {
            trace!(host = %self.host, port = self.port, "closing connection");
        }
        self.state = ConnState::Offline;
        self.send_buf.clear();
        self.decoder.clear();
        self.interest = PollEvents::empty();
        self.revents = PollEvents::empty();
        self.ready = false;
        self.write_pending = false;
    }

    fn resolve(&mut self) -> Result<SocketAddr, ClientError> {
        if let Some(addr) = self.addr {
            return Ok(addr);
        }
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                ClientError::Io(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "address resolution returned no results",
                ))
            })?;
        self.addr = Some(addr);
        Ok(addr)
    }

    /// Starts a non-blocking connect. `Pending` means completion will be
    /// signalled by writability.
    fn connect(&mut self) -> Result<Progress, ClientError> {
        let addr = self.resolve()?;
        debug!(host = %self.host, port = self.port, %addr, "initiating connection");

        let (stream, connected) = poll::connect_nonblocking(&addr)?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);

        if connected {
            self.state = ConnState::Connected;
            Ok(Progress::Complete)
        } else {
            self.state = ConnState::Connecting;
            self.interest.insert(PollEvents::OUT);
            Ok(Progress::Pending)
        }
    }

    /// Finishes an in-flight connect once the socket reported writable.
    fn finish_connect(&mut self) -> Result<(), ClientError> {
        let stream = self.stream.as_ref().ok_or(ClientError::NotConnected)?;
        match stream.take_error()? {
            None => {
                debug!(host = %self.host, port = self.port, "connection established");
                self.state = ConnState::Connected;
                self.revents.remove(PollEvents::OUT);
                Ok(())
            }
            Some(err) => {
                warn!(host = %self.host, port = self.port, ?err, "connect failed");
                self.close();
                Err(ClientError::Io(err))
            }
        }
    }

    /// Appends the serialized packet to the send buffer.
    ///
    /// With `flush_now` the buffer is drained as far as the mode allows;
    /// otherwise the packet stays queued with write-interest set, to be
    /// pushed by a later flush or wait cycle.
    pub(crate) fn send_packet(
        &mut self,
        packet: &Packet,
        flush_now: bool,
        blocking: bool,
        timeout_ms: i32,
    ) -> Result<Progress, ClientError> {
        let encoded = packet.encode();
        trace!(
            command = %packet.command(),
            len = encoded.len(),
            "queueing packet"
        );
        self.send_buf.extend_from_slice(&encoded);

        if !flush_now {
            if self.state == ConnState::Offline {
                // Get a socket in flight so the next wait can watch it
                let _ = self.connect()?;
            }
            self.interest.insert(PollEvents::OUT);
            return Ok(Progress::Pending);
        }

        self.flush(blocking, timeout_ms)
    }

    /// Drains the send buffer, establishing the connection first if needed.
    pub(crate) fn flush(&mut self, blocking: bool, timeout_ms: i32) -> Result<Progress, ClientError> {
        loop {
            match self.state {
                ConnState::Offline => {
                    if self.send_buf.is_empty() {
                        return Ok(Progress::Complete);
                    }
                    if self.connect()?.is_complete() {
                        continue;
                    }
                    if !blocking {
                        self.write_pending = true;
                        return Ok(Progress::Pending);
                    }
                    self.wait_io(PollEvents::OUT, timeout_ms)?;
                    self.finish_connect()?;
                }
                ConnState::Connecting => {
                    if !blocking && !self.revents.writable() {
                        self.interest.insert(PollEvents::OUT);
                        self.write_pending = true;
                        return Ok(Progress::Pending);
                    }
                    if !self.revents.writable() {
                        self.wait_io(PollEvents::OUT, timeout_ms)?;
                    }
                    self.finish_connect()?;
                }
                ConnState::Connected => return self.drain_send_buffer(blocking, timeout_ms),
            }
        }
    }

    fn drain_send_buffer(&mut self, blocking: bool, timeout_ms: i32) -> Result<Progress, ClientError> {
        while !self.send_buf.is_empty() {
            let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
            match stream.write(&self.send_buf) {
                Ok(0) => {
                    warn!(host = %self.host, port = self.port, "write returned zero");
                    self.close();
                    return Err(ClientError::ConnectionLost);
                }
                Ok(n) => {
                    trace!(len = n, remaining = self.send_buf.len() - n, "wrote to socket");
                    self.send_buf.advance(n);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.interest.insert(PollEvents::OUT);
                    if !blocking {
                        self.write_pending = true;
                        return Ok(Progress::Pending);
                    }
                    self.wait_io(PollEvents::OUT, timeout_ms)?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(host = %self.host, port = self.port, ?err, "write failed");
                    self.close();
                    return Err(ClientError::Io(err));
                }
            }
        }

        self.interest.remove(PollEvents::OUT);
        self.write_pending = false;
        Ok(Progress::Complete)
    }

    /// Reads available bytes and returns the next complete packet.
    ///
    /// In non-blocking mode `Ok(None)` means the frame is still incomplete
    /// and read-interest has been set. In blocking mode the call keeps
    /// reading until a frame completes, the peer closes, or an error occurs.
    pub(crate) fn recv_packet(
        &mut self,
        blocking: bool,
        timeout_ms: i32,
    ) -> Result<Option<Packet>, ClientError> {
        loop {
            if let Some(packet) = self.decoder.decode_packet()? {
                trace!(command = %packet.command(), "received packet");
                if self.decoder.buffered() == 0 {
                    // No further frame in flight
                    self.interest.remove(PollEvents::IN);
                }
                return Ok(Some(packet));
            }

            let stream = self.stream.as_mut().ok_or(ClientError::NotConnected)?;
            match stream.read(&mut self.read_buf[..]) {
                Ok(0) => {
                    debug!(host = %self.host, port = self.port, "connection closed by peer");
                    self.close();
                    return Err(ClientError::ConnectionLost);
                }
                Ok(n) => {
                    trace!(len = n, "read from socket");
                    self.decoder.extend(&self.read_buf[..n]);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.interest.insert(PollEvents::IN);
                    if !blocking {
                        return Ok(None);
                    }
                    self.wait_io(PollEvents::IN, timeout_ms)?;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(host = %self.host, port = self.port, ?err, "read failed");
                    self.close();
                    return Err(ClientError::Io(err));
                }
            }
        }
    }

    /// Blocks on this connection's descriptor alone.
    ///
    /// Error conditions are reported alongside the readable/writable bits;
    /// they are left for the following read or write attempt to surface
    /// precisely.
    fn wait_io(&mut self, events: PollEvents, timeout_ms: i32) -> Result<(), ClientError> {
        let fd = self.fd().ok_or(ClientError::NotConnected)?;
        match poll::poll_one(fd, events, timeout_ms)? {
            Some(_) => Ok(()),
            None => Err(ClientError::Timeout),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_connection_is_idle() {
        let conn = Connection::new("localhost", 4730);
        assert!(!conn.is_connected());
        assert!(conn.interest().is_empty());
        assert!(!conn.is_ready());
        assert_eq!(conn.send_buffered(), 0);
        assert_eq!(conn.recv_buffered(), 0);
    }

    #[test]
    fn test_ready_tracks_interest_intersection() {
        let mut conn = Connection::new("localhost", 4730);

        // No interest: readable revents do not mark the connection ready
        conn.set_revents(PollEvents::IN).unwrap();
        assert!(!conn.is_ready());

        conn.interest.insert(PollEvents::IN);
        conn.set_revents(PollEvents::IN).unwrap();
        assert!(conn.is_ready());

        conn.set_revents(PollEvents::OUT).unwrap();
        assert!(!conn.is_ready());
    }

    #[test]
    fn test_take_ready_clears_flag() {
        let mut conn = Connection::new("localhost", 4730);
        conn.interest.insert(PollEvents::IN);
        conn.set_revents(PollEvents::IN).unwrap();

        assert!(conn.take_ready());
        assert!(!conn.is_ready());
        assert!(!conn.take_ready());
    }

    #[test]
    fn test_hangup_without_data_is_fatal() {
        let mut conn = Connection::new("localhost", 4730);
        conn.interest.insert(PollEvents::IN);

        let result = conn.set_revents(PollEvents::HUP);
        assert!(matches!(result, Err(ClientError::ConnectionLost)));
        assert!(conn.interest().is_empty());
    }

    #[test]
    fn test_hangup_with_pending_data_is_survivable() {
        let mut conn = Connection::new("localhost", 4730);
        conn.interest.insert(PollEvents::IN);

        // Readable data accompanies the hang-up: drain before giving up
        conn.set_revents(PollEvents::IN | PollEvents::HUP).unwrap();
        assert!(conn.is_ready());
    }

    #[test]
    fn test_clone_endpoint_drops_transient_state() {
        let mut conn = Connection::new("example.net", 4731);
        conn.send_buf.extend_from_slice(b"queued");
        conn.interest.insert(PollEvents::OUT);
        conn.ready = true;

        let clone = conn.clone_endpoint();
        assert_eq!(clone.host(), "example.net");
        assert_eq!(clone.port(), 4731);
        assert_eq!(clone.send_buffered(), 0);
        assert!(clone.interest().is_empty());
        assert!(!clone.is_ready());
    }
}
