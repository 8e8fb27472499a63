use std::{collections::HashMap, io, os::fd::RawFd, ptr, sync::Arc};

use tracing::{debug, error, trace};

use crate::{
    channel::{Channel, EventMask},
    poller::{INDEX_ADDED, INDEX_DELETED, INDEX_NEW, Poller},
    timestamp::Timestamp,
};

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Kernel-interest-set poller backed by `epoll`.
///
/// The event scratch starts small and doubles whenever a wakeup fills it, so
/// a loop serving many hot fds converges on a buffer that drains them in one
/// call.
pub struct EpollPoller {
    epoll_fd: RawFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> Self {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            panic!("couldn't create the epoll instance: {}", io::Error::last_os_error());
        }
        EpollPoller {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        }
    }

    fn control(&self, op: libc::c_int, channel: &Channel) {
        let mut event = libc::epoll_event {
            events: channel.interest().bits(),
            u64: channel.fd() as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, op, channel.fd(), &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd = channel.fd(), %err, "epoll_ctl del failed");
            } else {
                // add/mod failures mean the interest set is out of sync with
                // reality, nothing sensible can run after that
                panic!("epoll_ctl add/mod failed for fd {}: {err}", channel.fd());
            }
        }
    }
}

impl Default for EpollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Arc<Channel>>) -> Timestamp {
        trace!(fds = self.channels.len(), "polling");
        let num_events = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if num_events > 0 {
            trace!(events = num_events, "events happened");
            for event in &self.events[..num_events as usize] {
                let fd = event.u64 as RawFd;
                if let Some(channel) = self.channels.get(&fd) {
                    channel.set_revents(EventMask::from_bits_truncate(event.events));
                    active_channels.push(channel.clone());
                }
            }
            if num_events as usize == self.events.len() {
                self.events
                    .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
            }
        } else if num_events == 0 {
            trace!("poll timed out, nothing happened");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!(err = %saved, "epoll_wait failed");
        }

        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        trace!(fd = channel.fd(), interest = ?channel.interest(), index, "updating channel");
        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                self.channels.insert(channel.fd(), channel.clone());
            }
            channel.set_index(INDEX_ADDED);
            self.control(libc::EPOLL_CTL_ADD, channel);
        } else if channel.is_none_event() {
            self.control(libc::EPOLL_CTL_DEL, channel);
            channel.set_index(INDEX_DELETED);
        } else {
            self.control(libc::EPOLL_CTL_MOD, channel);
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        debug!(fd, "removing channel");
        if self
            .channels
            .get(&fd)
            .is_some_and(|known| ptr::eq(Arc::as_ptr(known), channel))
        {
            self.channels.remove(&fd);
        }
        if channel.index() == INDEX_ADDED {
            self.control(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|known| ptr::eq(Arc::as_ptr(known), channel))
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll_fd) };
    }
}
