use std::{
    any::Any,
    os::fd::RawFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering},
    },
};

use bitflags::bitflags;
use tracing::trace;

use crate::{
    callbacks::{EventCallback, ReadEventCallback},
    event_loop::EventLoop,
    poller::INDEX_NEW,
    timestamp::Timestamp,
};

bitflags! {
    /// Readiness bits shared by both demultiplexers. The values are the raw
    /// kernel ones, which coincide between the interest-set and array-scan
    /// readiness APIs on Linux.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct EventMask: u32 {
        const READABLE = libc::EPOLLIN as u32;
        const PRIORITY = libc::EPOLLPRI as u32;
        const WRITABLE = libc::EPOLLOUT as u32;
        const ERROR = libc::EPOLLERR as u32;
        const HUP = libc::EPOLLHUP as u32;
        const PEER_HUP = libc::EPOLLRDHUP as u32;
        /// Only ever reported, never requested. The array-scan poller flags
        /// closed-under-us fds this way.
        const INVALID = libc::POLLNVAL as u32;
    }
}

impl EventMask {
    pub const READ_EVENT: EventMask = EventMask::READABLE.union(EventMask::PRIORITY);
    pub const WRITE_EVENT: EventMask = EventMask::WRITABLE;

    #[inline]
    pub(crate) fn to_poll_events(self) -> i16 {
        self.bits() as i16
    }

    #[inline]
    pub(crate) fn from_poll_revents(revents: i16) -> Self {
        EventMask::from_bits_truncate(revents as u16 as u32)
    }
}

#[derive(Default)]
struct ChannelCallbacks {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Binds one fd to its interest mask, the readiness the poller last reported,
/// and the callbacks fired per event kind.
///
/// A channel lives inside exactly one event loop and is mutated only on that
/// loop's thread; every interest change pushes the new mask to the loop's
/// poller. It never owns the fd.
///
/// An owner with a wider lifecycle (a connection) can [`tie`](Channel::tie)
/// itself to the channel. A tied channel upgrades the weak owner handle
/// before dispatching and pins it for the duration of the callbacks, so a
/// readiness event already in flight cannot run against a freed owner.
pub struct Channel {
    owner_loop: Weak<EventLoop>,
    fd: RawFd,
    interest: AtomicU32,
    revents: AtomicU32,
    // registration bookkeeping owned by the poller; see poller::INDEX_*
    index: AtomicI32,
    tied: AtomicBool,
    tie: Mutex<Weak<dyn Any + Send + Sync>>,
    callbacks: Mutex<ChannelCallbacks>,
}

impl Channel {
    pub fn new(owner_loop: &Arc<EventLoop>, fd: RawFd) -> Arc<Channel> {
        Arc::new(Channel {
            owner_loop: Arc::downgrade(owner_loop),
            fd,
            interest: AtomicU32::new(0),
            revents: AtomicU32::new(0),
            index: AtomicI32::new(INDEX_NEW),
            tied: AtomicBool::new(false),
            tie: Mutex::new(Weak::<()>::new()),
            callbacks: Mutex::new(ChannelCallbacks::default()),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn interest(&self) -> EventMask {
        EventMask::from_bits_truncate(self.interest.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_none_event(&self) -> bool {
        self.interest().is_empty()
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest().intersects(EventMask::WRITE_EVENT)
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest().intersects(EventMask::READ_EVENT)
    }

    pub fn owner_loop(&self) -> Option<Arc<EventLoop>> {
        self.owner_loop.upgrade()
    }

    pub(crate) fn set_revents(&self, revents: EventMask) {
        self.revents.store(revents.bits(), Ordering::Release);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.load(Ordering::Acquire)
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Release);
    }

    // sets the mask without pushing it to the poller; interior plumbing for
    // the poller implementations and loop teardown
    pub(crate) fn set_interest(&self, events: EventMask) {
        self.interest.store(events.bits(), Ordering::Release);
    }

    pub fn set_read_callback(&self, cb: impl Fn(Timestamp) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().read = Some(Arc::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().write = Some(Arc::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().close = Some(Arc::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().error = Some(Arc::new(cb));
    }

    /// Installs a liveness guard: events dispatch only while `owner` is
    /// still alive, and the upgrade pins it across the dispatch.
    pub fn tie(&self, owner: &Arc<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Arc::downgrade(owner);
        self.tied.store(true, Ordering::Release);
    }

    pub fn enable_reading(self: &Arc<Self>) {
        self.add_interest(EventMask::READ_EVENT);
    }

    pub fn disable_reading(self: &Arc<Self>) {
        self.remove_interest(EventMask::READ_EVENT);
    }

    pub fn enable_writing(self: &Arc<Self>) {
        self.add_interest(EventMask::WRITE_EVENT);
    }

    pub fn disable_writing(self: &Arc<Self>) {
        self.remove_interest(EventMask::WRITE_EVENT);
    }

    pub fn disable_all(self: &Arc<Self>) {
        self.set_interest(EventMask::empty());
        self.update();
    }

    /// Drops the channel from its loop's poller entirely.
    pub fn remove(self: &Arc<Self>) {
        if let Some(owner_loop) = self.owner_loop.upgrade() {
            owner_loop.remove_channel(self);
        }
    }

    fn add_interest(self: &Arc<Self>, events: EventMask) {
        let mask = self.interest() | events;
        self.interest.store(mask.bits(), Ordering::Release);
        self.update();
    }

    fn remove_interest(self: &Arc<Self>, events: EventMask) {
        let mask = self.interest() & !events;
        self.interest.store(mask.bits(), Ordering::Release);
        self.update();
    }

    fn update(self: &Arc<Self>) {
        if let Some(owner_loop) = self.owner_loop.upgrade() {
            owner_loop.update_channel(self);
        }
    }

    /// Called by the owning loop for every channel the poller reported.
    pub fn handle_event(self: &Arc<Self>, receive_time: Timestamp) {
        if self.tied.load(Ordering::Acquire) {
            let tie = self.tie.lock().unwrap().clone();
            if let Some(_owner) = tie.upgrade() {
                self.dispatch(receive_time);
            }
            // owner already gone, the event dies here
        } else {
            self.dispatch(receive_time);
        }
    }

    fn dispatch(&self, receive_time: Timestamp) {
        let revents = EventMask::from_bits_truncate(self.revents.load(Ordering::Acquire));
        trace!(fd = self.fd, ?revents, "dispatching channel event");

        let (read, write, close, error) = {
            let callbacks = self.callbacks.lock().unwrap();
            (
                callbacks.read.clone(),
                callbacks.write.clone(),
                callbacks.close.clone(),
                callbacks.error.clone(),
            )
        };

        // a hang-up with nothing left to read means the peer is fully gone
        if revents.contains(EventMask::HUP) && !revents.contains(EventMask::READABLE) {
            if let Some(close) = &close {
                close();
            }
        }
        if revents.intersects(EventMask::ERROR | EventMask::INVALID) {
            if let Some(error) = &error {
                error();
            }
        }
        if revents.intersects(EventMask::READ_EVENT | EventMask::PEER_HUP) {
            if let Some(read) = &read {
                read(receive_time);
            }
        }
        if revents.contains(EventMask::WRITE_EVENT) {
            if let Some(write) = &write {
                write();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_event_covers_priority_data() {
        assert!(EventMask::READ_EVENT.contains(EventMask::READABLE));
        assert!(EventMask::READ_EVENT.contains(EventMask::PRIORITY));
        assert!(!EventMask::READ_EVENT.intersects(EventMask::WRITE_EVENT));
    }

    #[test]
    fn poll_bits_round_trip() {
        let mask = EventMask::READABLE | EventMask::WRITABLE | EventMask::PEER_HUP;
        assert_eq!(EventMask::from_poll_revents(mask.to_poll_events()), mask);
    }

    #[test]
    fn unknown_poll_bits_are_dropped() {
        let revents = EventMask::READABLE.to_poll_events() | 0x4000u16 as i16;
        assert_eq!(EventMask::from_poll_revents(revents), EventMask::READABLE);
    }
}
