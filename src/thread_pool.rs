use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::debug;

use crate::event_loop::{EventLoop, LoopHandle};

pub type ThreadInitCallback = Arc<dyn Fn(&LoopHandle) + Send + Sync>;

/// Spawns a thread that owns one event loop and runs it until quit.
pub struct EventLoopThread {
    name: String,
    init: Option<ThreadInitCallback>,
    handle: Option<LoopHandle>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn new(name: &str, init: Option<ThreadInitCallback>) -> EventLoopThread {
        EventLoopThread {
            name: name.to_string(),
            init,
            handle: None,
            thread: None,
        }
    }

    /// Spawns the thread and blocks until its loop is live; the returned
    /// handle is the cross-thread face of that loop.
    pub fn start_loop(&mut self) -> LoopHandle {
        assert!(self.thread.is_none(), "event loop thread started twice");

        let (tx, rx) = mpsc::channel();
        let init = self.init.clone();
        let name = self.name.clone();

        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let event_loop = EventLoop::new().expect("failed to create event loop");
                if let Some(init) = init {
                    init(event_loop.handle());
                }
                tx.send(event_loop.handle().clone())
                    .expect("loop starter hung up");
                event_loop.run();
            })
            .expect("failed to spawn event loop thread");

        let handle = rx.recv().expect("event loop thread died during startup");

        self.thread = Some(thread);
        self.handle = Some(handle.clone());
        handle
    }

    pub fn handle(&self) -> Option<&LoopHandle> {
        self.handle.as_ref()
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.quit();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// N loops on N threads; connections shard onto them round-robin and stay
/// pinned for life. With zero threads everything runs on the base loop.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: bool,
    thread_count: usize,
    next: usize,
    threads: Vec<EventLoopThread>,
    loops: Vec<LoopHandle>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            started: false,
            thread_count: 0,
            next: 0,
            threads: Vec::new(),
            loops: Vec::new(),
        }
    }

    pub fn set_thread_count(&mut self, thread_count: usize) {
        assert!(!self.started, "thread count set after start");
        self.thread_count = thread_count;
    }

    pub fn start(&mut self, init: Option<ThreadInitCallback>) {
        assert!(!self.started, "thread pool started twice");
        self.base.assert_in_loop_thread();

        self.started = true;

        for i in 0..self.thread_count {
            let name = format!("{}{}", self.name, i);
            let mut thread = EventLoopThread::new(&name, init.clone());
            self.loops.push(thread.start_loop());
            self.threads.push(thread);
        }

        debug!("pool {} started {} io loops", self.name, self.thread_count);

        if self.thread_count == 0 {
            if let Some(init) = init {
                init(&self.base);
            }
        }
    }

    /// Round-robin pick, or the base loop when the pool is empty. Must run
    /// on the base loop thread.
    pub fn next_loop(&mut self) -> LoopHandle {
        self.base.assert_in_loop_thread();
        assert!(self.started);

        if self.loops.is_empty() {
            return self.base.clone();
        }

        let picked = self.loops[self.next].clone();
        self.next = (self.next + 1) % self.loops.len();
        picked
    }

    /// Deterministic pick for callers that need a stable loop per key.
    pub fn hash_loop(&self, hash: usize) -> LoopHandle {
        self.base.assert_in_loop_thread();

        if self.loops.is_empty() {
            return self.base.clone();
        }

        self.loops[hash % self.loops.len()].clone()
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        self.base.assert_in_loop_thread();

        if self.loops.is_empty() {
            vec![self.base.clone()]
        } else {
            self.loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
