use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use log::{trace, warn};

use crate::event_loop::{EventLoop, LoopHandle};
use crate::ready::Ready;
use crate::timestamp::Timestamp;

pub type ReadCallback = Arc<dyn Fn(Timestamp) + Send + Sync>;
pub type EventCallback = Arc<dyn Fn() + Send + Sync>;

/// The poller's bookkeeping hint for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Never registered with the poller.
    New,
    /// Registered and present in the kernel interest set.
    Added,
    /// Still known to the poller but removed from the kernel interest set.
    Deleted,
}

struct Inner {
    interest: Ready,
    revents: Ready,
    state: ChannelState,
    tied: Option<Weak<dyn Any + Send + Sync>>,
    event_handling: bool,
    added_to_loop: bool,
    log_hup: bool,
}

#[derive(Default)]
struct Callbacks {
    read: Option<ReadCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

/// Binds one file descriptor to interest flags and per-event callbacks.
///
/// A channel never owns its descriptor; the owning object (acceptor,
/// connector, connection, timer queue, wakeup fd) does, and must clear the
/// interest and call [`Channel::remove`] before dropping the channel.
///
/// All interest mutators must run on the owning loop's thread.
pub struct Channel {
    fd: RawFd,
    loop_: LoopHandle,
    weak_self: Weak<Channel>,
    inner: Mutex<Inner>,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub fn new(loop_: LoopHandle, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|weak_self| Channel {
            fd,
            loop_,
            weak_self: weak_self.clone(),
            inner: Mutex::new(Inner {
                interest: Ready::empty(),
                revents: Ready::empty(),
                state: ChannelState::New,
                tied: None,
                event_handling: false,
                added_to_loop: false,
                log_hup: true,
            }),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
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

    /// Ties this channel to its owner, so dispatch can pin the owner alive
    /// across callback execution even while it is being dropped elsewhere.
    pub fn tie<T: Send + Sync + 'static>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        self.inner.lock().unwrap().tied = Some(Arc::downgrade(&owner));
    }

    pub fn interest(&self) -> Ready {
        self.inner.lock().unwrap().interest
    }

    pub fn is_none_interest(&self) -> bool {
        self.interest().is_empty()
    }

    pub fn is_reading(&self) -> bool {
        self.interest().is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest().is_writable()
    }

    pub fn enable_reading(&self) {
        self.inner.lock().unwrap().interest.insert(Ready::readable());
        self.update();
    }

    pub fn disable_reading(&self) {
        self.inner.lock().unwrap().interest.remove(Ready::readable());
        self.update();
    }

    pub fn enable_writing(&self) {
        self.inner.lock().unwrap().interest.insert(Ready::writable());
        self.update();
    }

    pub fn disable_writing(&self) {
        self.inner.lock().unwrap().interest.remove(Ready::writable());
        self.update();
    }

    pub fn disable_all(&self) {
        self.inner.lock().unwrap().interest = Ready::empty();
        self.update();
    }

    /// Suppress the POLLHUP warning, for fds where a hang-up is routine.
    pub fn quiet_hup(&self) {
        self.inner.lock().unwrap().log_hup = false;
    }

    /// Unregisters the channel from its loop. The interest must already be
    /// empty.
    pub fn remove(&self) {
        assert!(self.is_none_interest(), "channel fd={} removed with live interest", self.fd);
        self.inner.lock().unwrap().added_to_loop = false;
        self.with_owner_loop(|ev| ev.remove_channel(self));
    }

    pub fn is_added(&self) -> bool {
        self.inner.lock().unwrap().added_to_loop
    }

    pub(crate) fn state(&self) -> ChannelState {
        self.inner.lock().unwrap().state
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.inner.lock().unwrap().state = state;
    }

    pub(crate) fn set_revents(&self, revents: Ready) {
        self.inner.lock().unwrap().revents = revents;
    }

    pub fn revents(&self) -> Ready {
        self.inner.lock().unwrap().revents
    }

    fn update(&self) {
        self.inner.lock().unwrap().added_to_loop = true;
        let this = self
            .weak_self
            .upgrade()
            .expect("channel updated without a live handle");
        self.with_owner_loop(|ev| ev.update_channel(&this));
    }

    fn with_owner_loop(&self, f: impl FnOnce(&EventLoop)) {
        let ev = EventLoop::current().unwrap_or_else(|| {
            panic!(
                "channel fd={} mutated on a thread with no event loop",
                self.fd
            )
        });
        assert_eq!(
            ev.id(),
            self.loop_.id(),
            "channel fd={} mutated on the wrong loop",
            self.fd
        );
        f(&ev);
    }

    /// Dispatches this tick's ready set to the registered callbacks.
    pub fn handle_event(&self, receive_time: Timestamp) {
        let tied = self.inner.lock().unwrap().tied.clone();

        match tied {
            Some(tie) => {
                // pin the owner for the duration of the callbacks
                if let Some(_guard) = tie.upgrade() {
                    self.handle_event_guarded(receive_time);
                }
            }
            None => self.handle_event_guarded(receive_time),
        }
    }

    fn handle_event_guarded(&self, receive_time: Timestamp) {
        let (revents, log_hup) = {
            let mut inner = self.inner.lock().unwrap();
            inner.event_handling = true;
            (inner.revents, inner.log_hup)
        };

        trace!("channel fd={} handling {:?}", self.fd, revents);

        if revents.is_hup() && !revents.is_readable() {
            if log_hup {
                warn!("channel fd={} got HUP", self.fd);
            }
            if let Some(cb) = self.close_callback() {
                cb();
            }
        }

        if revents.is_invalid() {
            warn!("channel fd={} is invalid", self.fd);
        }

        if revents.is_error() || revents.is_invalid() {
            if let Some(cb) = self.error_callback() {
                cb();
            }
        }

        if revents.is_readable() {
            if let Some(cb) = self.read_callback() {
                cb(receive_time);
            }
        }

        if revents.is_writable() {
            if let Some(cb) = self.write_callback() {
                cb();
            }
        }

        self.inner.lock().unwrap().event_handling = false;
    }

    fn read_callback(&self) -> Option<ReadCallback> {
        self.callbacks.lock().unwrap().read.clone()
    }

    fn write_callback(&self) -> Option<EventCallback> {
        self.callbacks.lock().unwrap().write.clone()
    }

    fn close_callback(&self) -> Option<EventCallback> {
        self.callbacks.lock().unwrap().close.clone()
    }

    fn error_callback(&self) -> Option<EventCallback> {
        self.callbacks.lock().unwrap().error.clone()
    }

    /// Clears the registration bookkeeping when the owning loop itself goes
    /// away; the kernel side dies with the loop's backend fd.
    pub(crate) fn mark_detached(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.interest = Ready::empty();
        inner.added_to_loop = false;
        inner.state = ChannelState::New;
    }

    /// Direct poller access for loop teardown, when the thread-local loop
    /// reference is no longer reachable.
    pub(crate) fn teardown(&self, ev: &EventLoop) {
        let registered = {
            let mut inner = self.inner.lock().unwrap();
            inner.interest = Ready::empty();
            let registered = inner.added_to_loop;
            inner.added_to_loop = false;
            registered
        };

        if registered {
            if let Some(this) = self.weak_self.upgrade() {
                ev.update_channel(&this);
            }
            ev.remove_channel(self);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("interest", &inner.interest)
            .field("state", &inner.state)
            .finish()
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        assert!(
            !inner.event_handling,
            "channel fd={} dropped mid-dispatch",
            self.fd
        );
        assert!(
            !inner.added_to_loop,
            "channel fd={} dropped while still registered",
            self.fd
        );
    }
}
