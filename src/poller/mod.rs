use std::env;
use std::io;
use std::sync::Arc;

use crate::channel::Channel;
use crate::timestamp::Timestamp;

mod epoll;
mod poll;

pub use epoll::EpollPoller;
pub use poll::PollPoller;

/// The multiplexer behind an event loop: keeps the fd -> channel map and
/// mirrors each channel's interest into the kernel.
///
/// The epoll backend is the default; setting `REACTOR_IO_USE_POLL` in the
/// environment selects the poll(2) fallback.
pub enum Poller {
    Epoll(EpollPoller),
    Poll(PollPoller),
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        if env::var_os("REACTOR_IO_USE_POLL").is_some() {
            Ok(Poller::Poll(PollPoller::new()))
        } else {
            Ok(Poller::Epoll(EpollPoller::new()?))
        }
    }

    /// Waits up to `timeout_ms` and appends the ready channels, with their
    /// `revents` set, to `active`. Returns the wall time sampled right
    /// after the wait; callers treat it as the message arrival time.
    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        match self {
            Poller::Epoll(p) => p.poll(timeout_ms, active),
            Poller::Poll(p) => p.poll(timeout_ms, active),
        }
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        match self {
            Poller::Epoll(p) => p.update_channel(channel),
            Poller::Poll(p) => p.update_channel(channel),
        }
    }

    pub fn remove_channel(&mut self, channel: &Channel) {
        match self {
            Poller::Epoll(p) => p.remove_channel(channel),
            Poller::Poll(p) => p.remove_channel(channel),
        }
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        match self {
            Poller::Epoll(p) => p.has_channel(channel),
            Poller::Poll(p) => p.has_channel(channel),
        }
    }

    /// Empties the fd map for loop teardown, handing back whatever is still
    /// registered.
    pub fn drain_channels(&mut self) -> Vec<Arc<Channel>> {
        match self {
            Poller::Epoll(p) => p.drain_channels(),
            Poller::Poll(p) => p.drain_channels(),
        }
    }
}
