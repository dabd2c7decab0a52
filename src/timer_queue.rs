use std::collections::{BTreeSet, HashSet};
use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{error, trace};
use slab::Slab;

use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::TimerFd;

/// Identifies one scheduled timer for cancellation.
///
/// The slab slot a timer occupies is reused after the timer dies; the
/// sequence number keeps a stale id from cancelling the slot's next tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerId {
    key: usize,
    seq: u64,
}

impl TimerId {
    /// An id that never matches a live timer; cancelling it is a no-op.
    pub(crate) fn none() -> TimerId {
        TimerId { key: 0, seq: 0 }
    }
}

struct Timer {
    /// Taken out while the callback runs, so user code executes unlocked.
    callback: Option<Box<dyn FnMut() + Send>>,
    expiration: Instant,
    interval: Option<Duration>,
    seq: u64,
}

struct State {
    timers: Slab<Timer>,
    /// Expiration order; ties on the same instant break by slab key.
    queue: BTreeSet<(Instant, usize)>,
    calling_expired: bool,
    /// Ids cancelled from within the current expired batch; the reschedule
    /// step drops them instead of re-arming.
    canceling: HashSet<(usize, u64)>,
}

/// Schedules one-shot and repeating callbacks on a monotonic timerfd whose
/// channel lives on the owning loop.
pub struct TimerQueue {
    loop_: LoopHandle,
    timerfd: TimerFd,
    channel: Mutex<Option<Arc<Channel>>>,
    state: Mutex<State>,
    next_seq: AtomicU64,
}

impl TimerQueue {
    pub(crate) fn new(loop_: LoopHandle) -> io::Result<Arc<TimerQueue>> {
        let timer_queue = Arc::new(TimerQueue {
            loop_,
            timerfd: TimerFd::new()?,
            channel: Mutex::new(None),
            state: Mutex::new(State {
                timers: Slab::new(),
                queue: BTreeSet::new(),
                calling_expired: false,
                canceling: HashSet::new(),
            }),
            next_seq: AtomicU64::new(0),
        });

        let channel = Channel::new(
            timer_queue.loop_.clone(),
            timer_queue.timerfd.as_raw_fd(),
        );
        let weak = Arc::downgrade(&timer_queue);
        channel.set_read_callback(move |_| {
            if let Some(timer_queue) = weak.upgrade() {
                timer_queue.handle_read();
            }
        });
        channel.enable_reading();
        *timer_queue.channel.lock().unwrap() = Some(channel);

        Ok(timer_queue)
    }

    /// Safe from any thread. Returns immediately with a stable id.
    pub(crate) fn add_timer(
        &self,
        callback: Box<dyn FnMut() + Send>,
        when: Instant,
        interval: Option<Duration>,
    ) -> TimerId {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;

        let mut state = self.state.lock().unwrap();
        let key = state.timers.insert(Timer {
            callback: Some(callback),
            expiration: when,
            interval,
            seq,
        });

        let earliest_changed = state.queue.first().map_or(true, |&(head, _)| when < head);
        state.queue.insert((when, key));

        if earliest_changed {
            self.arm(when);
        }

        TimerId { key, seq }
    }

    /// Safe from any thread; idempotent. Cancelling from inside a timer
    /// callback cancels that very timer's repetition too.
    pub(crate) fn cancel(&self, timer_id: TimerId) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let found = match state.timers.get(timer_id.key) {
            Some(timer) if timer.seq == timer_id.seq => {
                Some((timer.callback.is_some(), timer.expiration))
            }
            _ => None,
        };

        match found {
            Some((true, expiration)) => {
                state.queue.remove(&(expiration, timer_id.key));
                state.timers.remove(timer_id.key);
            }
            Some((false, _)) => {
                // mid-dispatch: the callback is out being run right now
                debug_assert!(state.calling_expired);
                state.canceling.insert((timer_id.key, timer_id.seq));
            }
            None => {}
        }
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();

        match self.timerfd.read() {
            Ok(n) => trace!("timer queue fired, {} expirations", n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("timerfd read: {}", e),
        }

        let now = Instant::now();

        let mut expired: Vec<(usize, u64, Box<dyn FnMut() + Send>)> = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            while let Some(&(expiration, key)) = state.queue.first() {
                if expiration > now {
                    break;
                }
                state.queue.pop_first();
                let timer = &mut state.timers[key];
                let callback = timer.callback.take().expect("queued timer has no callback");
                expired.push((key, timer.seq, callback));
            }
            state.calling_expired = true;
            state.canceling.clear();
        }

        for (_, _, callback) in expired.iter_mut() {
            callback();
        }

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        for (key, seq, callback) in expired {
            let canceled = state.canceling.contains(&(key, seq));
            let reschedule = match state.timers.get_mut(key) {
                Some(timer) if timer.seq == seq => {
                    if let (Some(interval), false) = (timer.interval, canceled) {
                        timer.callback = Some(callback);
                        timer.expiration = now + interval;
                        Some(timer.expiration)
                    } else {
                        None
                    }
                }
                _ => continue,
            };

            match reschedule {
                Some(expiration) => {
                    state.queue.insert((expiration, key));
                }
                None => {
                    state.timers.remove(key);
                }
            }
        }
        state.calling_expired = false;
        state.canceling.clear();

        if let Some(&(head, _)) = state.queue.first() {
            self.arm(head);
        }
    }

    fn arm(&self, when: Instant) {
        let delay = when.saturating_duration_since(Instant::now());
        if let Err(e) = self.timerfd.set_delay(delay) {
            error!("timerfd_settime: {}", e);
        }
    }

    /// Unregisters the timerfd channel during loop destruction.
    pub(crate) fn teardown(&self, ev: &EventLoop) {
        if let Some(channel) = self.channel.lock().unwrap().take() {
            channel.teardown(ev);
        }
    }
}
