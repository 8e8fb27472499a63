use std::{
    any::Any,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicUsize, Ordering},
    },
};

use tracing::{debug, error, info, trace, warn};

use crate::{
    buffer::Buffer,
    callbacks::{
        CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
        WriteCompleteCallback, default_connection_callback, default_message_callback,
    },
    channel::Channel,
    event_loop::EventLoop,
    sockets::{self, Socket},
    timestamp::Timestamp,
};

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Lifecycle of one accepted connection. The only legal walk is
/// `Connecting → Connected → Disconnecting → Disconnected`, where
/// `Disconnecting` is skipped when the peer goes away without a local
/// `shutdown`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnState {
    fn from_u8(value: u8) -> ConnState {
        match value {
            0 => ConnState::Connecting,
            1 => ConnState::Connected,
            2 => ConnState::Disconnecting,
            _ => ConnState::Disconnected,
        }
    }
}

struct ConnectionCallbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One established TCP connection, pinned to the loop that polls its fd.
///
/// All I/O goes through the userspace buffers: reads land in the input
/// buffer before the message callback sees them, writes drain from the
/// output buffer whenever the socket turns writable. `send` may be called
/// from any thread; the bytes hop onto the owning loop and everything after
/// that is single-threaded.
///
/// Ownership is shared between the server's registry and whatever handlers
/// are currently running (the channel pins the connection through its tie
/// for the duration of each dispatch), so the connection is destroyed only
/// after both have let go.
pub struct TcpConnection {
    owner_loop: Arc<EventLoop>,
    name: String,
    state: AtomicU8,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<ConnectionCallbacks>,
}

impl TcpConnection {
    pub fn new(
        owner_loop: Arc<EventLoop>,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        socket.set_keep_alive(true);
        let channel = Channel::new(&owner_loop, socket.fd());
        let conn = Arc::new(TcpConnection {
            owner_loop,
            name,
            state: AtomicU8::new(ConnState::Connecting as u8),
            socket,
            channel,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(ConnectionCallbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                high_water_mark: None,
                close: None,
            }),
        });
        info!(name = conn.name.as_str(), fd = conn.socket.fd(), "connection created");

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        conn
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.owner_loop
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    #[inline]
    pub fn disconnected(&self) -> bool {
        self.state() == ConnState::Disconnected
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        self.socket.set_tcp_no_delay(on);
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = cb;
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = cb;
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    /// Installs the backpressure callback, fired once each time the queued
    /// output crosses `high_water_mark` from below.
    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, high_water_mark: usize) {
        self.callbacks.lock().unwrap().high_water_mark = Some(cb);
        self.high_water_mark.store(high_water_mark, Ordering::Release);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    /// Sends `message` over the connection. Accepted only while
    /// `Connected`; from foreign threads the bytes are captured by value
    /// and written by the owning loop.
    pub fn send(self: &Arc<Self>, message: impl Into<Vec<u8>>) {
        if self.state() != ConnState::Connected {
            return;
        }
        let message = message.into();
        if self.owner_loop.is_in_loop_thread() {
            self.send_in_loop(&message);
        } else {
            let conn = self.clone();
            self.owner_loop
                .run_in_loop(move || conn.send_in_loop(&message));
        }
    }

    /// Half-closes the write side once the output buffer drains; the peer's
    /// EOF then drives the close path.
    pub fn shutdown(self: &Arc<Self>) {
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnecting);
            let conn = self.clone();
            self.owner_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// First task a new connection runs on its loop: arm the channel, tie
    /// it to the connection, and tell the user.
    pub fn connect_established(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        assert_eq!(self.state(), ConnState::Connecting);
        self.set_state(ConnState::Connected);
        let owner: Arc<dyn Any + Send + Sync> = self.clone();
        self.channel.tie(&owner);
        self.channel.enable_reading();

        let connection_cb = self.callbacks.lock().unwrap().connection.clone();
        connection_cb(self);
    }

    /// Final teardown on the owning loop. Idempotent: the close path may
    /// already have walked the state machine to `Disconnected`.
    pub fn connect_destroyed(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        if self.state() == ConnState::Connected {
            self.set_state(ConnState::Disconnected);
            self.channel.disable_all();
            let connection_cb = self.callbacks.lock().unwrap().connection.clone();
            connection_cb(self);
        }
        self.channel.remove();
    }

    fn handle_read(self: &Arc<Self>, receive_time: Timestamp) {
        self.owner_loop.assert_in_loop_thread();
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_from_fd(self.channel.fd()) {
            Ok(0) => {
                // peer closed its write side
                drop(input);
                self.handle_close();
            }
            Ok(n) => {
                trace!(name = self.name.as_str(), bytes = n, "readable");
                let message_cb = self.callbacks.lock().unwrap().message.clone();
                message_cb(self, &mut input, receive_time);
            }
            Err(err) => {
                drop(input);
                error!(name = self.name.as_str(), %err, "read failed");
                self.handle_error();
            }
        }
    }

    fn handle_write(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            warn!(fd = self.channel.fd(), "connection is down, no more writing");
            return;
        }
        let mut output = self.output_buffer.lock().unwrap();
        match output.write_to_fd(self.channel.fd()) {
            Ok(n) if n > 0 => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    self.channel.disable_writing();
                    if let Some(write_complete_cb) =
                        self.callbacks.lock().unwrap().write_complete.clone()
                    {
                        let conn = self.clone();
                        self.owner_loop
                            .queue_in_loop(move || write_complete_cb(&conn));
                    }
                    if self.state() == ConnState::Disconnecting {
                        self.shutdown_in_loop();
                    }
                }
            }
            Ok(_) => error!(name = self.name.as_str(), "write returned zero"),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!(name = self.name.as_str(), %err, "write failed"),
        }
    }

    fn handle_close(self: &Arc<Self>) {
        self.owner_loop.assert_in_loop_thread();
        info!(fd = self.channel.fd(), state = ?self.state(), "closing connection");
        debug_assert!(matches!(
            self.state(),
            ConnState::Connected | ConnState::Disconnecting
        ));
        self.set_state(ConnState::Disconnected);
        self.channel.disable_all();

        // keep a strong handle across both callbacks, the close callback
        // drops the registry's reference
        let conn = self.clone();
        let (connection_cb, close_cb) = {
            let callbacks = self.callbacks.lock().unwrap();
            (callbacks.connection.clone(), callbacks.close.clone())
        };
        connection_cb(&conn);
        if let Some(close_cb) = close_cb {
            close_cb(&conn);
        }
    }

    fn handle_error(&self) {
        let err = sockets::socket_error(self.channel.fd());
        error!(
            name = self.name.as_str(),
            err = %io::Error::from_raw_os_error(err),
            "connection error"
        );
    }

    fn send_in_loop(self: &Arc<Self>, data: &[u8]) {
        self.owner_loop.assert_in_loop_thread();
        if self.state() == ConnState::Disconnected {
            warn!(name = self.name.as_str(), "disconnected, giving up the write");
            return;
        }

        let mut wrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        let mut output = self.output_buffer.lock().unwrap();
        // fast path: nothing queued and the channel idle, try the kernel
        // directly
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            match sockets::write(self.channel.fd(), data) {
                Ok(n) => {
                    wrote = n;
                    remaining = data.len() - n;
                    if remaining == 0
                        && let Some(write_complete_cb) =
                            self.callbacks.lock().unwrap().write_complete.clone()
                    {
                        let conn = self.clone();
                        self.owner_loop
                            .queue_in_loop(move || write_complete_cb(&conn));
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!(name = self.name.as_str(), %err, "direct write failed");
                        if matches!(err.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) {
                            fault = true;
                        }
                    }
                }
            }
        }

        debug_assert!(remaining <= data.len());
        if !fault && remaining > 0 {
            let queued = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Acquire);
            // fire only on the rising edge across the mark
            if queued + remaining >= high_water_mark && queued < high_water_mark {
                if let Some(high_water_cb) = self.callbacks.lock().unwrap().high_water_mark.clone()
                {
                    let conn = self.clone();
                    let queued_total = queued + remaining;
                    self.owner_loop
                        .queue_in_loop(move || high_water_cb(&conn, queued_total));
                }
            }
            output.append(&data[wrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.owner_loop.assert_in_loop_thread();
        // only half-close once the output buffer has drained
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            name = self.name.as_str(),
            fd = self.socket.fd(),
            state = ?self.state(),
            "connection dropped"
        );
    }
}
