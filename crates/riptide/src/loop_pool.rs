use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use tracing::info;

use crate::{callbacks::ThreadInitCallback, event_loop::EventLoop, loop_thread::LoopThread};

/// Spawns N worker loops and deals new connections across them round-robin.
///
/// With zero workers the base loop serves everything itself. `next_loop` is
/// only ever called from the base loop's thread, which is what keeps the
/// rotation race-free.
pub struct LoopThreadPool {
    base_loop: Arc<EventLoop>,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    workers: Mutex<Vec<LoopThread>>,
    loops: Mutex<Vec<Arc<EventLoop>>>,
}

impl LoopThreadPool {
    pub fn new(base_loop: Arc<EventLoop>, name: String) -> LoopThreadPool {
        LoopThreadPool {
            base_loop,
            name,
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spawns every worker and blocks until each loop is live.
    pub fn start(&self, init: Option<ThreadInitCallback>) {
        self.base_loop.assert_in_loop_thread();
        self.started.store(true, Ordering::Release);

        let num_threads = self.num_threads.load(Ordering::Acquire);
        info!(name = self.name.as_str(), num_threads, "starting loop threads");

        let mut workers = self.workers.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for i in 0..num_threads {
            let worker = LoopThread::start(format!("{}{}", self.name, i), init.clone());
            loops.push(worker.event_loop().clone());
            workers.push(worker);
        }

        // single-threaded servers run everything on the base loop
        if num_threads == 0 && let Some(init) = &init {
            init(&self.base_loop);
        }
    }

    /// Next loop in rotation, or the base loop when the pool is empty.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            return self.base_loop.clone();
        }
        let next = self.next.fetch_add(1, Ordering::AcqRel);
        loops[next % loops.len()].clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}
