use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak as ArcWeak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use concurrent_queue::ConcurrentQueue;
use log::{debug, error, trace, warn};

use crate::channel::Channel;
use crate::poller::Poller;
use crate::sys::EventFd;
use crate::timer_queue::{TimerId, TimerQueue};
use crate::timestamp::Timestamp;

const POLL_TIME_MS: i32 = 10_000;

static NEXT_LOOP_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Weak<EventLoop>>> = RefCell::new(None);
}

type Task = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    id: usize,
    thread: ThreadId,
    pending: ConcurrentQueue<Task>,
    waker: EventFd,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    iteration: AtomicU64,
    poll_return_micros: AtomicU64,
    timer_queue: OnceLock<ArcWeak<TimerQueue>>,
}

/// The `Send + Sync` half of an event loop.
///
/// Every method here is safe to call from any thread: work is either
/// executed inline when the caller already is the loop thread, or queued
/// and the loop woken. This is the "loop pointer" other threads hold.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "loop {} method called from thread {:?}, owned by {:?}",
                self.shared.id,
                thread::current().id(),
                self.shared.thread
            );
        }
    }

    /// Runs `f` inline when called on the loop thread, otherwise queues it.
    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            f();
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queues `f` for the end of the current (or next) loop tick.
    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        let _ = self.shared.pending.push(Box::new(f));

        // a task queued while tasks are draining would otherwise sit a
        // whole poll timeout away
        if !self.is_in_loop_thread() || self.shared.calling_pending_tasks.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.shared.pending.len()
    }

    pub fn wakeup(&self) {
        if let Err(e) = self.shared.waker.write(1) {
            if e.kind() != io::ErrorKind::WouldBlock {
                error!("loop {} wakeup: {}", self.shared.id, e);
            }
        }
    }

    /// Stops the loop after the current iteration drains.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(when, None, Box::new(cb))
    }

    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Instant::now() + delay, None, Box::new(cb))
    }

    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Instant::now() + interval, Some(interval), Box::new(cb))
    }

    pub fn cancel(&self, timer_id: TimerId) {
        if let Some(timer_queue) = self.timer_queue() {
            timer_queue.cancel(timer_id);
        }
    }

    pub fn iteration(&self) -> u64 {
        self.shared.iteration.load(Ordering::Relaxed)
    }

    /// Wall time of the latest poll return, usually meaning data arrival.
    pub fn poll_return_time(&self) -> Timestamp {
        Timestamp::from_micros(self.shared.poll_return_micros.load(Ordering::Relaxed))
    }

    fn add_timer(
        &self,
        when: Instant,
        interval: Option<Duration>,
        cb: Box<dyn FnMut() + Send>,
    ) -> TimerId {
        match self.timer_queue() {
            Some(timer_queue) => timer_queue.add_timer(cb, when, interval),
            None => {
                warn!("loop {} is gone, timer dropped", self.shared.id);
                TimerId::none()
            }
        }
    }

    fn timer_queue(&self) -> Option<Arc<TimerQueue>> {
        self.shared.timer_queue.get().and_then(ArcWeak::upgrade)
    }

    pub(crate) fn drain_wakeup(&self) {
        match self.shared.waker.read() {
            Ok(n) => trace!("loop {} woke up, count={}", self.shared.id, n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("loop {} wakeup read: {}", self.shared.id, e),
        }
    }

    fn waker_fd(&self) -> RawFd {
        self.shared.waker.as_raw_fd()
    }
}

/// A reactor: one per thread, at most.
///
/// Construction registers the loop in a thread-local cell; [`run`] then
/// cycles poll -> dispatch -> pending tasks until [`LoopHandle::quit`].
/// Cross-thread access goes through the [`LoopHandle`] returned by
/// [`handle`]; the `EventLoop` itself never leaves its thread.
///
/// [`run`]: EventLoop::run
/// [`handle`]: EventLoop::handle
pub struct EventLoop {
    handle: LoopHandle,
    poller: RefCell<Poller>,
    timer_queue: RefCell<Option<Arc<TimerQueue>>>,
    wakeup_channel: RefCell<Option<Arc<Channel>>>,
    active_channels: RefCell<Vec<Arc<Channel>>>,
    current_active: Cell<Option<RawFd>>,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
}

impl EventLoop {
    pub fn new() -> io::Result<Rc<EventLoop>> {
        CURRENT_LOOP.with(|current| {
            if let Some(existing) = current.borrow().as_ref().and_then(Weak::upgrade) {
                panic!(
                    "another event loop ({}) already exists on thread {:?}",
                    existing.id(),
                    thread::current().id()
                );
            }
        });

        let shared = Arc::new(Shared {
            id: NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed),
            thread: thread::current().id(),
            pending: ConcurrentQueue::unbounded(),
            waker: EventFd::new()?,
            quit: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_return_micros: AtomicU64::new(0),
            timer_queue: OnceLock::new(),
        });

        let event_loop = Rc::new(EventLoop {
            handle: LoopHandle { shared },
            poller: RefCell::new(Poller::new()?),
            timer_queue: RefCell::new(None),
            wakeup_channel: RefCell::new(None),
            active_channels: RefCell::new(Vec::new()),
            current_active: Cell::new(None),
            looping: Cell::new(false),
            event_handling: Cell::new(false),
        });

        CURRENT_LOOP.with(|current| {
            *current.borrow_mut() = Some(Rc::downgrade(&event_loop));
        });

        let wakeup_channel = Channel::new(event_loop.handle.clone(), event_loop.handle.waker_fd());
        let handle = event_loop.handle.clone();
        wakeup_channel.set_read_callback(move |_| handle.drain_wakeup());
        wakeup_channel.enable_reading();
        *event_loop.wakeup_channel.borrow_mut() = Some(wakeup_channel);

        let timer_queue = TimerQueue::new(event_loop.handle.clone())?;
        let _ = event_loop
            .handle
            .shared
            .timer_queue
            .set(Arc::downgrade(&timer_queue));
        *event_loop.timer_queue.borrow_mut() = Some(timer_queue);

        debug!(
            "event loop {} created on thread {:?}",
            event_loop.id(),
            thread::current().id()
        );

        Ok(event_loop)
    }

    /// The loop registered on the calling thread, if any.
    pub fn current() -> Option<Rc<EventLoop>> {
        CURRENT_LOOP.with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn id(&self) -> usize {
        self.handle.id()
    }

    pub fn is_in_loop_thread(&self) -> bool {
        self.handle.is_in_loop_thread()
    }

    pub fn assert_in_loop_thread(&self) {
        self.handle.assert_in_loop_thread();
    }

    pub fn run_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.handle.run_in_loop(f);
    }

    pub fn queue_in_loop(&self, f: impl FnOnce() + Send + 'static) {
        self.handle.queue_in_loop(f);
    }

    pub fn run_at(&self, when: Instant, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle.run_at(when, cb)
    }

    pub fn run_after(&self, delay: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle.run_after(delay, cb)
    }

    pub fn run_every(&self, interval: Duration, cb: impl FnMut() + Send + 'static) -> TimerId {
        self.handle.run_every(interval, cb)
    }

    pub fn cancel(&self, timer_id: TimerId) {
        self.handle.cancel(timer_id);
    }

    pub fn quit(&self) {
        self.handle.quit();
    }

    pub fn poll_return_time(&self) -> Timestamp {
        self.handle.poll_return_time()
    }

    pub fn iteration(&self) -> u64 {
        self.handle.iteration()
    }

    pub fn event_handling(&self) -> bool {
        self.event_handling.get()
    }

    /// Poll, dispatch, drain queued tasks; repeat until quit. One more
    /// iteration may complete after `quit` to drain what is already ready.
    pub fn run(&self) {
        assert!(!self.looping.get(), "loop {} is already running", self.id());
        self.assert_in_loop_thread();

        self.looping.set(true);
        self.handle.shared.quit.store(false, Ordering::Release);

        trace!("event loop {} start", self.id());

        while !self.handle.shared.quit.load(Ordering::Acquire) {
            let mut active = self.active_channels.take();
            active.clear();

            let poll_return = self.poller.borrow_mut().poll(POLL_TIME_MS, &mut active);
            self.handle
                .shared
                .poll_return_micros
                .store(poll_return.micros(), Ordering::Relaxed);
            self.handle.shared.iteration.fetch_add(1, Ordering::Relaxed);

            self.event_handling.set(true);
            for channel in &active {
                self.current_active.set(Some(channel.fd()));
                channel.handle_event(poll_return);
            }
            self.current_active.set(None);
            self.event_handling.set(false);

            // hand the scratch list back, keeping its capacity
            *self.active_channels.borrow_mut() = active;

            self.do_pending_tasks();
        }

        trace!("event loop {} stop", self.id());
        self.looping.set(false);
    }

    pub fn update_channel(&self, channel: &Arc<Channel>) {
        assert_eq!(
            channel.owner_loop().id(),
            self.id(),
            "channel fd={} belongs to another loop",
            channel.fd()
        );
        self.assert_in_loop_thread();
        self.poller.borrow_mut().update_channel(channel);
    }

    pub fn remove_channel(&self, channel: &Channel) {
        assert_eq!(
            channel.owner_loop().id(),
            self.id(),
            "channel fd={} belongs to another loop",
            channel.fd()
        );
        self.assert_in_loop_thread();
        if self.event_handling.get() {
            assert_eq!(
                self.current_active.get(),
                Some(channel.fd()),
                "only the channel under dispatch may remove itself mid-tick"
            );
        }
        self.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.poller.borrow().has_channel(channel)
    }

    fn do_pending_tasks(&self) {
        let shared = &self.handle.shared;
        shared.calling_pending_tasks.store(true, Ordering::Release);

        // run only the tasks present at tick start; later arrivals forced a
        // wakeup and run next tick
        let n = shared.pending.len();
        for _ in 0..n {
            match shared.pending.pop() {
                Ok(task) => task(),
                Err(_) => break,
            }
        }

        shared.calling_pending_tasks.store(false, Ordering::Release);
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        debug!("event loop {} destructs", self.id());

        if let Some(timer_queue) = self.timer_queue.borrow_mut().take() {
            timer_queue.teardown(self);
        }
        if let Some(wakeup_channel) = self.wakeup_channel.borrow_mut().take() {
            wakeup_channel.teardown(self);
        }

        // channels that outlive the loop (connections still referenced by
        // queued tasks) must not think they are registered
        for channel in self.poller.borrow_mut().drain_channels() {
            channel.mark_detached();
        }

        // abandoned tasks can hold connection references that point back at
        // this loop's handle; drop them to break the cycle
        while let Ok(task) = self.handle.shared.pending.pop() {
            drop(task);
        }

        CURRENT_LOOP.with(|current| {
            current.borrow_mut().take();
        });
    }
}

#[cfg(test)]
mod test {
    use super::EventLoop;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn run_in_loop_is_inline_on_the_loop_thread() {
        let event_loop = EventLoop::new().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        event_loop.run_in_loop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queued_tasks_run_before_quit() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle().clone();
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        let th = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let inner = counter.clone();
            handle.queue_in_loop(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            });
            handle.quit();
        });

        event_loop.run();
        th.join().unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn task_queued_during_drain_runs_promptly() {
        let event_loop = EventLoop::new().unwrap();
        let handle = event_loop.handle().clone();
        let ran = Arc::new(AtomicUsize::new(0));

        let outer_handle = handle.clone();
        let counter = ran.clone();
        handle.queue_in_loop(move || {
            // queued while tasks drain: must still run this tick
            let inner = counter.clone();
            let quitter = outer_handle.clone();
            outer_handle.queue_in_loop(move || {
                inner.fetch_add(1, Ordering::SeqCst);
                quitter.quit();
            });
        });
        handle.wakeup();

        event_loop.run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "another event loop")]
    fn second_loop_on_one_thread_panics() {
        let _first = EventLoop::new().unwrap();
        let _second = EventLoop::new();
    }

    #[test]
    fn loop_is_recreatable_after_drop() {
        {
            let _ev = EventLoop::new().unwrap();
        }
        let _ev = EventLoop::new().unwrap();
    }
}
