//! Readiness primitives over `poll(2)`.
//!
//! The engine rebuilds its descriptor set from connection interest masks on
//! every wait, so the level-triggered `poll(2)` interface fits directly: one
//! `pollfd` per interested connection, a millisecond timeout (negative waits
//! indefinitely), and interrupted waits restarted transparently.

use bitflags::bitflags;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{FromRawFd, RawFd};

bitflags! {
    /// Readiness event mask, matching the `poll(2)` event bits.
    pub struct PollEvents: libc::c_short {
        const IN = libc::POLLIN;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

impl PollEvents {
    pub fn readable(&self) -> bool {
        self.contains(PollEvents::IN)
    }

    pub fn writable(&self) -> bool {
        self.contains(PollEvents::OUT)
    }

    /// The peer hung up or the descriptor is in an error state.
    pub fn hangup(&self) -> bool {
        self.intersects(PollEvents::ERR | PollEvents::HUP | PollEvents::NVAL)
    }
}

fn cvt(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Waits for readiness on a set of descriptors.
///
/// Returns the number of descriptors with events; zero means the timeout
/// elapsed. `EINTR` restarts the wait with the full timeout, so the
/// interruption is invisible to the caller.
pub fn poll(fds: &mut [libc::pollfd], timeout_ms: i32) -> io::Result<usize> {
    loop {
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        match cvt(rc) {
            Ok(n) => return Ok(n as usize),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Waits for readiness on a single descriptor and returns its revents.
pub fn poll_one(fd: RawFd, events: PollEvents, timeout_ms: i32) -> io::Result<Option<PollEvents>> {
    let mut pfd = [libc::pollfd {
        fd,
        events: events.bits(),
        revents: 0,
    }];
    let n = poll(&mut pfd, timeout_ms)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(PollEvents::from_bits_truncate(pfd[0].revents)))
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::c_int, libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            (
                libc::AF_INET,
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            (
                libc::AF_INET6,
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

/// Starts a non-blocking TCP connect.
///
/// Returns the stream and whether the connect already completed. When it has
/// not, completion is signalled by writability; check `take_error()` then.
pub fn connect_nonblocking(addr: &SocketAddr) -> io::Result<(TcpStream, bool)> {
    let (domain, storage, len) = sockaddr_from(addr);

    let fd = cvt(unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;

    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc == 0 {
        return Ok((unsafe { TcpStream::from_raw_fd(fd) }, true));
    }

    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok((unsafe { TcpStream::from_raw_fd(fd) }, false))
    } else {
        unsafe { libc::close(fd) };
        Err(err)
    }
}
