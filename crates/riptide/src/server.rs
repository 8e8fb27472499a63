use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicI32, AtomicI64, Ordering},
    },
};

use tracing::info;

use crate::{
    acceptor::Acceptor,
    buffer::Buffer,
    callbacks::{
        ConnectionCallback, MessageCallback, TcpConnectionRef, ThreadInitCallback,
        WriteCompleteCallback, default_connection_callback, default_message_callback,
    },
    connection::TcpConnection,
    event_loop::EventLoop,
    loop_pool::LoopThreadPool,
    sockets::{self, Socket},
    timestamp::Timestamp,
};

/// Whether the listen socket sets `SO_REUSEPORT`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ServerOption {
    #[default]
    NoReusePort,
    ReusePort,
}

/// Facade over the whole reactor stack: the acceptor runs on the base loop,
/// accepted connections are dealt to the pool's subloops round-robin, and
/// the registry of live connections is mutated only on the base loop.
///
/// Typical use:
///
/// ```no_run
/// use std::net::{Ipv4Addr, SocketAddr};
/// use riptide::{EventLoop, ServerOption, TcpServer};
///
/// let base_loop = EventLoop::new();
/// let server = TcpServer::new(
///     &base_loop,
///     SocketAddr::from((Ipv4Addr::UNSPECIFIED, 7000)),
///     "echo",
///     ServerOption::NoReusePort,
/// );
/// server.set_thread_num(4);
/// server.set_message_callback(|conn, buffer, _when| {
///     let bytes = buffer.retrieve_all_as_string();
///     conn.send(bytes);
/// });
/// server.start();
/// base_loop.run();
/// ```
pub struct TcpServer {
    core: Arc<ServerCore>,
}

struct ServerCore {
    base_loop: Arc<EventLoop>,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: Arc<LoopThreadPool>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicI32,
    next_conn_id: AtomicI64,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
}

impl TcpServer {
    pub fn new(
        base_loop: &Arc<EventLoop>,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        option: ServerOption,
    ) -> TcpServer {
        let name = name.into();
        let acceptor = Acceptor::new(base_loop, listen_addr, option == ServerOption::ReusePort);
        let core = Arc::new(ServerCore {
            base_loop: base_loop.clone(),
            ip_port: listen_addr.to_string(),
            name: name.clone(),
            acceptor,
            pool: Arc::new(LoopThreadPool::new(base_loop.clone(), name)),
            connection_callback: Mutex::new(
                Arc::new(default_connection_callback) as ConnectionCallback
            ),
            message_callback: Mutex::new(Arc::new(default_message_callback) as MessageCallback),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicI32::new(0),
            next_conn_id: AtomicI64::new(1),
            connections: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&core);
        core.acceptor.set_new_connection_callback(move |socket, peer_addr| {
            if let Some(core) = weak.upgrade() {
                ServerCore::new_connection(&core, socket, peer_addr);
            }
        });

        TcpServer { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn ip_port(&self) -> &str {
        &self.core.ip_port
    }

    pub fn owner_loop(&self) -> &Arc<EventLoop> {
        &self.core.base_loop
    }

    /// Address the listen socket is bound to; resolves port 0 to the real
    /// port.
    pub fn local_addr(&self) -> SocketAddr {
        self.core.acceptor.local_addr()
    }

    /// Number of live connections in the registry.
    pub fn connection_count(&self) -> usize {
        self.core.connections.lock().unwrap().len()
    }

    /// Number of subloops serving connections; zero keeps everything on the
    /// base loop. Call before [`start`](TcpServer::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.core.pool.set_thread_num(num_threads);
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static) {
        *self.core.connection_callback.lock().unwrap() = Arc::new(cb);
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        *self.core.message_callback.lock().unwrap() = Arc::new(cb);
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static,
    ) {
        *self.core.write_complete_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_thread_init_callback(&self, cb: impl Fn(&Arc<EventLoop>) + Send + Sync + 'static) {
        *self.core.thread_init_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Starts the pool and the listener. Idempotent; only the first call
    /// does anything.
    pub fn start(&self) {
        if self.core.started.fetch_add(1, Ordering::AcqRel) == 0 {
            let init = self.core.thread_init_callback.lock().unwrap().clone();
            self.core.pool.start(init);
            debug_assert!(!self.core.acceptor.listening());
            let acceptor = self.core.acceptor.clone();
            self.core.base_loop.run_in_loop(move || acceptor.listen());
        }
    }
}

impl ServerCore {
    /// Runs on the base loop for every accepted fd: pick a subloop, wire the
    /// connection up, and hand it over through the subloop's task queue.
    fn new_connection(core: &Arc<ServerCore>, socket: Socket, peer_addr: SocketAddr) {
        core.base_loop.assert_in_loop_thread();
        let io_loop = core.pool.next_loop();
        let conn_id = core.next_conn_id.fetch_add(1, Ordering::AcqRel);
        let conn_name = format!("{}-{}#{}", core.name, core.ip_port, conn_id);
        info!(
            server = core.name.as_str(),
            conn = conn_name.as_str(),
            peer = %peer_addr,
            "new connection"
        );

        let local_addr = sockets::local_addr(socket.fd());
        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        core.connections.lock().unwrap().insert(conn_name, conn.clone());

        conn.set_connection_callback(core.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(core.message_callback.lock().unwrap().clone());
        if let Some(write_complete_cb) = core.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(write_complete_cb);
        }
        let weak = Arc::downgrade(core);
        conn.set_close_callback(Arc::new(move |closing| {
            if let Some(core) = weak.upgrade() {
                core.remove_connection(closing);
            }
        }));

        let established = conn.clone();
        io_loop.run_in_loop(move || established.connect_established());
    }

    /// The close event fires on the subloop but the registry lives on the
    /// base loop, hence the hop.
    fn remove_connection(self: &Arc<Self>, conn: &TcpConnectionRef) {
        let core = self.clone();
        let conn = conn.clone();
        self.base_loop
            .run_in_loop(move || core.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionRef) {
        self.base_loop.assert_in_loop_thread();
        info!(
            server = self.name.as_str(),
            conn = conn.name(),
            "removing connection"
        );
        self.connections.lock().unwrap().remove(conn.name());
        // queued, not run inline, so the connection outlives any handler
        // still on the subloop's stack
        let destroyed = conn.clone();
        conn.owner_loop()
            .queue_in_loop(move || destroyed.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        info!(server = self.core.name.as_str(), "server shutting down");
        let connections = std::mem::take(&mut *self.core.connections.lock().unwrap());
        for (_, conn) in connections {
            let destroyed = conn.clone();
            conn.owner_loop()
                .run_in_loop(move || destroyed.connect_destroyed());
        }
    }
}
