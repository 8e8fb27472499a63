use std::{
    io, mem,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
};

use tracing::error;

/// Owned TCP socket fd plus the handful of syscall wrappers the reactor
/// needs. The fd closes when the socket drops; channels referring to it
/// never own it.
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking close-on-exec IPv4 stream socket.
    ///
    /// # Panics
    /// Socket creation failing is an operator/resource problem the reactor
    /// cannot limp past, so it panics.
    pub fn new_nonblocking() -> Socket {
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                libc::IPPROTO_TCP,
            )
        };
        if fd < 0 {
            panic!("couldn't create a tcp socket: {}", io::Error::last_os_error());
        }
        Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    pub(crate) fn from_accepted(fd: RawFd) -> Socket {
        Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// # Panics
    /// A bind failure means a bad address or a port conflict; both are
    /// configuration errors and fatal.
    pub fn bind_address(&self, addr: SocketAddr) {
        let (sin, len) = to_sockaddr_in(addr);
        let rc = unsafe {
            libc::bind(
                self.fd(),
                (&sin as *const libc::sockaddr_in).cast::<libc::sockaddr>(),
                len,
            )
        };
        if rc != 0 {
            panic!("couldn't bind {addr}: {}", io::Error::last_os_error());
        }
    }

    /// # Panics
    /// On listen failure, for the same reason as [`bind_address`](Socket::bind_address).
    pub fn listen(&self) {
        if unsafe { libc::listen(self.fd(), 1024) } != 0 {
            panic!(
                "couldn't listen on fd {}: {}",
                self.fd(),
                io::Error::last_os_error()
            );
        }
    }

    /// Accepts one pending connection. The returned socket is already
    /// non-blocking and close-on-exec.
    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut peer: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let conn_fd = unsafe {
            libc::accept4(
                self.fd(),
                (&mut peer as *mut libc::sockaddr_in).cast::<libc::sockaddr>(),
                &mut len,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if conn_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((Socket::from_accepted(conn_fd), from_sockaddr_in(&peer)))
    }

    /// Half-closes the write side; the peer observes EOF once in-flight
    /// data drains.
    pub fn shutdown_write(&self) {
        if unsafe { libc::shutdown(self.fd(), libc::SHUT_WR) } < 0 {
            error!(fd = self.fd(), err = %io::Error::last_os_error(), "shutdown write failed");
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        set_bool_opt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on);
    }

    pub fn set_reuse_addr(&self, on: bool) {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on);
    }

    pub fn set_reuse_port(&self, on: bool) {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEPORT, on);
    }

    pub fn set_keep_alive(&self, on: bool) {
        set_bool_opt(self.fd(), libc::SOL_SOCKET, libc::SO_KEEPALIVE, on);
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) {
    let value: libc::c_int = i32::from(on);
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            (&value as *const libc::c_int).cast::<libc::c_void>(),
            size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        error!(fd, opt, err = %io::Error::last_os_error(), "setsockopt failed");
    }
}

/// One-shot write of `data` to a non-blocking fd.
pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr().cast::<libc::c_void>(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Address the kernel bound this socket to.
pub fn local_addr(fd: RawFd) -> SocketAddr {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, (&mut sin as *mut libc::sockaddr_in).cast::<libc::sockaddr>(), &mut len)
    };
    if rc < 0 {
        error!(fd, err = %io::Error::last_os_error(), "getsockname failed");
    }
    from_sockaddr_in(&sin)
}

/// Address of the connected peer.
pub fn peer_addr(fd: RawFd) -> SocketAddr {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let rc = unsafe {
        libc::getpeername(fd, (&mut sin as *mut libc::sockaddr_in).cast::<libc::sockaddr>(), &mut len)
    };
    if rc < 0 {
        error!(fd, err = %io::Error::last_os_error(), "getpeername failed");
    }
    from_sockaddr_in(&sin)
}

/// Drains and returns the socket's pending `SO_ERROR`.
pub fn socket_error(fd: RawFd) -> i32 {
    let mut value: libc::c_int = 0;
    let mut len = size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut value as *mut libc::c_int).cast::<libc::c_void>(),
            &mut len,
        )
    };
    if rc < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        value
    }
}

fn to_sockaddr_in(addr: SocketAddr) -> (libc::sockaddr_in, libc::socklen_t) {
    let SocketAddr::V4(v4) = addr else {
        panic!("only ipv4 listen addresses are supported, got {addr}");
    };
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = v4.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*v4.ip()).to_be(),
    };
    (sin, size_of::<libc::sockaddr_in>() as libc::socklen_t)
}

fn from_sockaddr_in(sin: &libc::sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use super::*;

    #[test]
    fn sockaddr_conversion_round_trips() {
        let addr = SocketAddr::from((Ipv4Addr::new(127, 0, 0, 1), 4567));
        let (sin, _) = to_sockaddr_in(addr);
        assert_eq!(from_sockaddr_in(&sin), addr);
    }

    #[test]
    fn bound_socket_reports_its_local_addr() {
        let socket = Socket::new_nonblocking();
        socket.set_reuse_addr(true);
        socket.bind_address(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)));
        let bound = local_addr(socket.fd());
        assert_eq!(bound.ip(), Ipv4Addr::LOCALHOST);
        assert_ne!(bound.port(), 0);
    }
}
