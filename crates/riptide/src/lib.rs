//! Non-blocking TCP server library on the multi-reactor pattern: one event
//! loop per thread, an acceptor on the base loop, and a pool of subloops
//! serving the accepted connections.
//!
//! All socket I/O is non-blocking and level-triggered. The only blocking
//! call anywhere is the poller wait, which a private eventfd interrupts
//! whenever another thread queues work onto a loop.

pub mod acceptor;
pub mod buffer;
pub mod callbacks;
pub mod channel;
pub mod connection;
pub mod event_loop;
pub mod loop_pool;
pub mod loop_thread;
pub mod poller;
pub mod server;
pub mod sockets;
pub mod timestamp;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use callbacks::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnectionRef,
    ThreadInitCallback, WriteCompleteCallback,
};
pub use channel::{Channel, EventMask};
pub use connection::{ConnState, TcpConnection};
pub use event_loop::EventLoop;
pub use loop_pool::LoopThreadPool;
pub use loop_thread::LoopThread;
pub use poller::{EpollPoller, PollPoller, Poller, USE_POLL_ENV};
pub use server::{ServerOption, TcpServer};
pub use sockets::Socket;
pub use timestamp::Timestamp;
pub use tracing;
