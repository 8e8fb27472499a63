mod epoll;
mod poll;

use std::sync::Arc;

pub use epoll::EpollPoller;
pub use poll::PollPoller;

use crate::{channel::Channel, timestamp::Timestamp};

/// Channel not yet registered with any poller.
pub(crate) const INDEX_NEW: i32 = -1;
/// Channel registered in the kernel interest set.
pub(crate) const INDEX_ADDED: i32 = 1;
/// Channel known to the poller but dropped from the kernel interest set
/// because it declared zero interest.
pub(crate) const INDEX_DELETED: i32 = 2;

/// Environment switch selecting the array-scan poller. Any non-empty value
/// turns it on; the kernel-interest-set poller is the default.
pub const USE_POLL_ENV: &str = "MUDUO_USE_POLL";

/// Demultiplexes I/O readiness for one event loop.
///
/// `poll` blocks up to `timeout_ms`, stamps each ready channel's received
/// mask, pushes the channel into `active_channels`, and returns the wallclock
/// time of wakeup. `update_channel` owns the add/modify/delete bookkeeping
/// driven by the channel's registration index. A poller keeps handles to its
/// channels but never owns their fds.
pub trait Poller: Send {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Arc<Channel>>) -> Timestamp;

    fn update_channel(&mut self, channel: &Arc<Channel>);

    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;
}

pub(crate) fn new_default_poller() -> Box<dyn Poller> {
    if std::env::var_os(USE_POLL_ENV).is_some_and(|v| !v.is_empty()) {
        Box::new(PollPoller::new())
    } else {
        Box::new(EpollPoller::new())
    }
}
