use std::sync::Arc;

use crate::{buffer::Buffer, connection::TcpConnection, event_loop::EventLoop, timestamp::Timestamp};

/// Shared handle to a live connection, as handed to every user callback.
pub type TcpConnectionRef = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;
pub type ThreadInitCallback = Arc<dyn Fn(&Arc<EventLoop>) + Send + Sync>;

/// Channel-level callbacks, dispatched by the owning loop.
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;
pub type ReadEventCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;

pub(crate) fn default_connection_callback(conn: &TcpConnectionRef) {
    tracing::debug!(
        name = conn.name(),
        connected = conn.connected(),
        "connection state changed"
    );
}

pub(crate) fn default_message_callback(_conn: &TcpConnectionRef, buffer: &mut Buffer, _when: Timestamp) {
    buffer.retrieve_all();
}
