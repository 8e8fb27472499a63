use std::{collections::HashMap, io, os::fd::RawFd, ptr, sync::Arc};

use tracing::{error, trace};

use crate::{
    channel::{Channel, EventMask},
    poller::{INDEX_NEW, Poller},
    timestamp::Timestamp,
};

/// Array-scan poller backed by `poll(2)`.
///
/// Every registered channel owns one slot in the pollfd array; the channel's
/// registration index is its slot position. A channel with zero interest
/// keeps its slot but stores `-fd - 1` there, which hides the entry from the
/// kernel without reshuffling everyone else's indices.
pub struct PollPoller {
    poll_fds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Arc<Channel>>,
}

impl PollPoller {
    pub fn new() -> Self {
        PollPoller {
            poll_fds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn owns(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|known| ptr::eq(Arc::as_ptr(known), channel))
    }
}

impl Default for PollPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Arc<Channel>>) -> Timestamp {
        let num_events = unsafe {
            libc::poll(
                self.poll_fds.as_mut_ptr(),
                self.poll_fds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let saved = io::Error::last_os_error();
        let now = Timestamp::now();

        if num_events > 0 {
            let mut remaining = num_events;
            for poll_fd in &self.poll_fds {
                if remaining == 0 {
                    break;
                }
                if poll_fd.revents > 0 {
                    remaining -= 1;
                    if let Some(channel) = self.channels.get(&poll_fd.fd) {
                        channel.set_revents(EventMask::from_poll_revents(poll_fd.revents));
                        active_channels.push(channel.clone());
                    }
                }
            }
        } else if num_events == 0 {
            trace!("poll timed out, nothing happened");
        } else if saved.raw_os_error() != Some(libc::EINTR) {
            error!(err = %saved, "poll failed");
        }

        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        trace!(fd = channel.fd(), interest = ?channel.interest(), index = channel.index(), "updating channel");
        if channel.index() < 0 {
            self.poll_fds.push(libc::pollfd {
                fd: channel.fd(),
                events: channel.interest().to_poll_events(),
                revents: 0,
            });
            channel.set_index(self.poll_fds.len() as i32 - 1);
            self.channels.insert(channel.fd(), channel.clone());
        } else {
            if !self.owns(channel) {
                return;
            }
            let index = channel.index() as usize;
            if index >= self.poll_fds.len() {
                return;
            }
            let poll_fd = &mut self.poll_fds[index];
            if poll_fd.fd == channel.fd() || poll_fd.fd == -channel.fd() - 1 {
                poll_fd.fd = channel.fd();
                poll_fd.events = channel.interest().to_poll_events();
                poll_fd.revents = 0;
                if channel.is_none_event() {
                    // keep the slot, hide it from the kernel
                    poll_fd.fd = -channel.fd() - 1;
                }
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        if !self.owns(channel) {
            return;
        }
        let index = channel.index();
        if index < 0 || index as usize >= self.poll_fds.len() {
            return;
        }
        let index = index as usize;

        self.channels.remove(&channel.fd());
        if index == self.poll_fds.len() - 1 {
            self.poll_fds.pop();
        } else {
            // compact by swapping the tail slot in, then repoint its channel
            let last = self.poll_fds.len() - 1;
            self.poll_fds.swap(index, last);
            self.poll_fds.pop();
            let mut moved_fd = self.poll_fds[index].fd;
            if moved_fd < 0 {
                moved_fd = -moved_fd - 1;
            }
            if let Some(moved) = self.channels.get(&moved_fd) {
                moved.set_index(index as i32);
            }
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.owns(channel)
    }
}

#[cfg(test)]
mod tests {
    use std::os::fd::{AsRawFd, OwnedFd};

    use super::*;
    use crate::event_loop::EventLoop;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        unsafe {
            use std::os::fd::FromRawFd;
            (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]))
        }
    }

    #[test]
    fn slot_compaction_repoints_the_moved_channel() {
        // the loop is only needed to construct channels, this test drives
        // the poller directly
        let event_loop = EventLoop::new();
        let mut poller = PollPoller::new();

        let (read_a, _write_a) = pipe_pair();
        let (read_b, write_b) = pipe_pair();

        let first = Channel::new(&event_loop, read_a.as_raw_fd());
        let second = Channel::new(&event_loop, read_b.as_raw_fd());
        for channel in [&first, &second] {
            channel.set_interest(EventMask::READ_EVENT);
            poller.update_channel(channel);
        }
        assert_eq!(first.index(), 0);
        assert_eq!(second.index(), 1);
        assert!(poller.has_channel(&first));

        // removing the front slot swaps the tail into its place
        first.set_interest(EventMask::empty());
        poller.update_channel(&first);
        poller.remove_channel(&first);
        assert_eq!(first.index(), INDEX_NEW);
        assert_eq!(second.index(), 0);
        assert!(!poller.has_channel(&first));
        assert!(poller.has_channel(&second));

        // and the survivor still polls readable
        assert_eq!(unsafe { libc::write(write_b.as_raw_fd(), b"x".as_ptr().cast(), 1) }, 1);
        let mut active = Vec::new();
        poller.poll(100, &mut active);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].fd(), read_b.as_raw_fd());
    }
}
