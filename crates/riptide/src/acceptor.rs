use std::{
    io,
    net::SocketAddr,
    os::fd::{FromRawFd, OwnedFd},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::{error, info, warn};

use crate::{
    channel::Channel,
    event_loop::EventLoop,
    sockets::{self, Socket},
};

pub type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr) + Send + Sync>;

/// Turns listen-socket readiness into accepted connections on the base loop.
///
/// The acceptor binds at construction; `listen` arms the channel. Each
/// readiness event accepts one connection and hands the already-non-blocking
/// fd to the new-connection callback (the server's entry point). Without a
/// callback installed the fd is closed on the spot.
pub struct Acceptor {
    owner_loop: Arc<EventLoop>,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    // reserve fd burned to accept-and-close when the process runs out of fds
    idle_fd: Mutex<Option<OwnedFd>>,
    listening: AtomicBool,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(owner_loop: &Arc<EventLoop>, listen_addr: SocketAddr, reuse_port: bool) -> Arc<Acceptor> {
        let accept_socket = Socket::new_nonblocking();
        accept_socket.set_reuse_addr(true);
        if reuse_port {
            accept_socket.set_reuse_port(true);
        }
        accept_socket.bind_address(listen_addr);

        let accept_channel = Channel::new(owner_loop, accept_socket.fd());
        let acceptor = Arc::new(Acceptor {
            owner_loop: owner_loop.clone(),
            accept_socket,
            accept_channel,
            idle_fd: Mutex::new(open_idle_fd()),
            listening: AtomicBool::new(false),
            new_connection_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.accept_channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        acceptor
    }

    pub fn set_new_connection_callback(&self, cb: impl Fn(Socket, SocketAddr) + Send + Sync + 'static) {
        *self.new_connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Address the listen socket is actually bound to, useful when binding
    /// port 0.
    pub fn local_addr(&self) -> SocketAddr {
        sockets::local_addr(self.accept_socket.fd())
    }

    /// Starts listening and arms the accept channel. Must run on the owning
    /// loop's thread.
    pub fn listen(&self) {
        self.owner_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        self.accept_socket.listen();
        self.accept_channel.enable_reading();
        info!(fd = self.accept_socket.fd(), addr = %self.local_addr(), "listening");
    }

    fn handle_read(&self) {
        self.owner_loop.assert_in_loop_thread();
        match self.accept_socket.accept() {
            Ok((socket, peer_addr)) => {
                let callback = self.new_connection_callback.lock().unwrap();
                if let Some(callback) = callback.as_ref() {
                    callback(socket, peer_addr);
                } else {
                    warn!(%peer_addr, "no new-connection callback, closing the accepted fd");
                }
            }
            Err(err) if err.raw_os_error() == Some(libc::EMFILE) => {
                warn!("accept hit the process fd limit, shedding one connection");
                self.shed_one_connection();
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!(%err, "accept failed"),
        }
    }

    /// Frees the reserve fd, accepts the pending connection just to close
    /// it, then takes the reserve back. The peer sees a clean close instead
    /// of a connection parked forever in the backlog.
    fn shed_one_connection(&self) {
        let mut idle_fd = self.idle_fd.lock().unwrap();
        if idle_fd.take().is_none() {
            return;
        }
        if let Ok((socket, peer_addr)) = self.accept_socket.accept() {
            info!(%peer_addr, "closed a connection over the fd limit");
            drop(socket);
        }
        *idle_fd = open_idle_fd();
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.owner_loop.is_in_loop_thread() {
            self.accept_channel.disable_all();
            self.accept_channel.remove();
        } else {
            // unregister on the owning loop; the channel handle keeps the
            // bookkeeping alive until the task runs
            let accept_channel = self.accept_channel.clone();
            self.owner_loop.run_in_loop(move || {
                accept_channel.disable_all();
                accept_channel.remove();
            });
        }
    }
}

fn open_idle_fd() -> Option<OwnedFd> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        warn!(err = %io::Error::last_os_error(), "couldn't reserve an idle fd");
        None
    } else {
        Some(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}
