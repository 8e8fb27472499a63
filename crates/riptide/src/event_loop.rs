use std::{
    cell::RefCell,
    io,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    thread::{self, ThreadId},
};

use once_cell::sync::OnceCell;
use tracing::{debug, error, info};

use crate::{
    channel::{Channel, EventMask},
    poller::{self, Poller},
    timestamp::Timestamp,
};

/// How long one poller wait may block before the loop comes up for air.
pub(crate) const POLL_TIME_MS: i32 = 10_000;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

thread_local! {
    static LOOP_IN_THIS_THREAD: RefCell<Weak<EventLoop>> = const { RefCell::new(Weak::new()) };
}

fn create_event_fd() -> OwnedFd {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        panic!("couldn't create the wakeup eventfd: {}", io::Error::last_os_error());
    }
    unsafe { OwnedFd::from_raw_fd(fd) }
}

fn drain_wakeup(wakeup_fd: RawFd) {
    let mut counter: u64 = 0;
    let n = unsafe {
        libc::read(
            wakeup_fd,
            (&mut counter as *mut u64).cast::<libc::c_void>(),
            size_of::<u64>(),
        )
    };
    if n != size_of::<u64>() as isize {
        error!(bytes = n, "wakeup drain read an unexpected byte count");
    }
}

/// Per-thread reactor: one poller, the channels registered with it, and a
/// cross-thread task queue.
///
/// Exactly one loop may exist per OS thread, and everything loop-affine
/// (poller access, channel mutation, callback bodies) runs only on the
/// thread that constructed the loop. Other threads talk to the loop solely
/// through [`run_in_loop`](EventLoop::run_in_loop) /
/// [`queue_in_loop`](EventLoop::queue_in_loop); a private eventfd breaks the
/// poller wait early whenever work arrives from outside.
pub struct EventLoop {
    thread_id: ThreadId,
    looping: AtomicBool,
    quit: AtomicBool,
    calling_pending: AtomicBool,
    poll_return_time: AtomicI64,
    poller: Mutex<Box<dyn Poller>>,
    wakeup_fd: OwnedFd,
    wakeup_channel: OnceCell<Arc<Channel>>,
    pending_tasks: Mutex<Vec<Task>>,
}

impl EventLoop {
    /// Creates the loop for the calling thread.
    ///
    /// # Panics
    /// Panics if this thread already runs a loop, or if the poller or the
    /// wakeup fd cannot be created.
    pub fn new() -> Arc<EventLoop> {
        LOOP_IN_THIS_THREAD.with(|slot| {
            if slot.borrow().upgrade().is_some() {
                panic!("another event loop already exists on this thread");
            }
        });

        let event_loop = Arc::new(EventLoop {
            thread_id: thread::current().id(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            calling_pending: AtomicBool::new(false),
            poll_return_time: AtomicI64::new(0),
            poller: Mutex::new(poller::new_default_poller()),
            wakeup_fd: create_event_fd(),
            wakeup_channel: OnceCell::new(),
            pending_tasks: Mutex::new(Vec::new()),
        });
        LOOP_IN_THIS_THREAD.with(|slot| *slot.borrow_mut() = Arc::downgrade(&event_loop));

        let wakeup_channel = Channel::new(&event_loop, event_loop.wakeup_fd.as_raw_fd());
        let wakeup_fd = event_loop.wakeup_fd.as_raw_fd();
        wakeup_channel.set_read_callback(move |_| drain_wakeup(wakeup_fd));
        wakeup_channel.enable_reading();
        event_loop
            .wakeup_channel
            .set(wakeup_channel)
            .unwrap_or_else(|_| unreachable!("wakeup channel installed twice"));

        debug!(thread = ?event_loop.thread_id, "event loop created");
        event_loop
    }

    /// Runs the reactor until [`quit`](EventLoop::quit): wait for readiness,
    /// dispatch every active channel, then drain the task queue.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        self.looping.store(true, Ordering::Release);
        info!("event loop starts");

        let mut active_channels: Vec<Arc<Channel>> = Vec::new();
        while !self.quit.load(Ordering::Acquire) {
            active_channels.clear();
            let poll_return_time = self
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIME_MS, &mut active_channels);
            self.poll_return_time
                .store(poll_return_time.micros(), Ordering::Release);

            for channel in &active_channels {
                channel.handle_event(poll_return_time);
            }
            self.run_pending_tasks();
        }

        info!("event loop stops");
        self.looping.store(false, Ordering::Release);
    }

    /// Stops the loop at the end of its current iteration. Safe from any
    /// thread; an off-thread caller also wakes the loop so the flag is seen
    /// promptly.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` on the loop thread: inline when already there, queued
    /// otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Appends `task` to the pending queue. Tasks run in FIFO order after
    /// the channel dispatches of an iteration; tasks queued while the queue
    /// drains run in the next iteration.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.pending_tasks.lock().unwrap().push(Box::new(task));
        if !self.is_in_loop_thread() || self.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Breaks the poller wait by bumping the eventfd counter.
    pub fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.wakeup_fd.as_raw_fd(),
                (&one as *const u64).cast::<libc::c_void>(),
                size_of::<u64>(),
            )
        };
        if n != size_of::<u64>() as isize {
            error!(bytes = n, "wakeup wrote an unexpected byte count");
        }
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Arc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.poller.lock().unwrap().has_channel(channel)
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    /// Loop-affine entry points call this first; crossing threads here is a
    /// programming error, not a recoverable condition.
    pub fn assert_in_loop_thread(&self) {
        assert!(
            self.is_in_loop_thread(),
            "loop-affine call from the wrong thread"
        );
    }

    pub fn is_looping(&self) -> bool {
        self.looping.load(Ordering::Acquire)
    }

    /// Wallclock time at which the poller last woke up.
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp(self.poll_return_time.load(Ordering::Acquire))
    }

    fn run_pending_tasks(&self) {
        self.calling_pending.store(true, Ordering::Release);
        // swap the queue out so tasks can queue more tasks without
        // deadlocking on the mutex
        let tasks = std::mem::take(&mut *self.pending_tasks.lock().unwrap());
        for task in tasks {
            task();
        }
        self.calling_pending.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!(thread = ?self.thread_id, "event loop dropped");
        if let Some(wakeup_channel) = self.wakeup_channel.get() {
            wakeup_channel.set_interest(EventMask::empty());
            if let Ok(poller) = self.poller.get_mut() {
                poller.remove_channel(wakeup_channel);
            }
        }
    }
}
