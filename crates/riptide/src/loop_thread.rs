use std::{
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
};

use crate::{callbacks::ThreadInitCallback, event_loop::EventLoop};

/// One worker thread running one event loop.
///
/// The loop is constructed on the worker's own stack so the one-loop-per-
/// thread rule holds by construction; the spawning thread blocks on a
/// mutex+condvar handshake until the worker has published its loop handle.
pub struct LoopThread {
    handle: Option<JoinHandle<()>>,
    event_loop: Option<Arc<EventLoop>>,
}

impl LoopThread {
    /// Spawns a named worker, waits for its loop to come up, and returns.
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> LoopThread {
        let slot = Arc::new((Mutex::new(None::<Arc<EventLoop>>), Condvar::new()));
        let published = slot.clone();

        let handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                let event_loop = EventLoop::new();
                if let Some(init) = &init {
                    init(&event_loop);
                }
                {
                    let (lock, ready) = &*published;
                    *lock.lock().unwrap() = Some(event_loop.clone());
                    ready.notify_one();
                }
                event_loop.run();
            })
            .expect("couldn't spawn a loop thread");

        let (lock, ready) = &*slot;
        let mut guard = lock.lock().unwrap();
        let event_loop = loop {
            if let Some(event_loop) = guard.as_ref() {
                break event_loop.clone();
            }
            guard = ready.wait(guard).unwrap();
        };
        drop(guard);

        LoopThread {
            handle: Some(handle),
            event_loop: Some(event_loop),
        }
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        self.event_loop
            .as_ref()
            .expect("loop thread has been started")
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        if let Some(event_loop) = self.event_loop.take() {
            event_loop.quit();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
