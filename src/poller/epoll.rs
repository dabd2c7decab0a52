use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use indexmap::IndexMap;
use libc::{self, c_int};
use log::{error, trace};

use crate::channel::{Channel, ChannelState};
use crate::ready::Ready;
use crate::sys::Epoll;
use crate::timestamp::Timestamp;

const INITIAL_EVENTS: usize = 16;

pub struct EpollPoller {
    epoll: Epoll,
    events: Vec<libc::epoll_event>,
    channels: IndexMap<RawFd, Arc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        Ok(EpollPoller {
            epoll: Epoll::new()?,
            events: Vec::with_capacity(INITIAL_EVENTS),
            channels: IndexMap::new(),
        })
    }

    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        trace!("epoll: {} fds registered", self.channels.len());

        let result = self.epoll.wait(&mut self.events, timeout_ms);
        let now = Timestamp::now();

        match result {
            Ok(n) => {
                for event in &self.events[..n] {
                    let fd = event.u64 as RawFd;
                    let channel = match self.channels.get(&fd) {
                        Some(channel) => channel,
                        None => continue,
                    };
                    channel.set_revents(ready_from_epoll(event.events));
                    active.push(channel.clone());
                }

                if n == self.events.capacity() {
                    self.events.reserve(self.events.capacity());
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!("epoll_wait: {}", e),
        }

        now
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let state = channel.state();
        trace!(
            "epoll: update fd={} interest={:?} state={:?}",
            fd,
            channel.interest(),
            state
        );

        match state {
            ChannelState::New | ChannelState::Deleted => {
                if state == ChannelState::New {
                    assert!(!self.channels.contains_key(&fd));
                    self.channels.insert(fd, channel.clone());
                } else {
                    assert!(self.channels.contains_key(&fd));
                }

                channel.set_state(ChannelState::Added);
                self.ctl(libc::EPOLL_CTL_ADD, channel);
            }
            ChannelState::Added => {
                assert!(self.channels.contains_key(&fd));

                if channel.is_none_interest() {
                    self.ctl(libc::EPOLL_CTL_DEL, channel);
                    channel.set_state(ChannelState::Deleted);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, channel);
                }
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("epoll: remove fd={}", fd);

        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_interest());

        let state = channel.state();
        assert!(state == ChannelState::Added || state == ChannelState::Deleted);

        self.channels.swap_remove(&fd);

        if state == ChannelState::Added {
            self.ctl(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_state(ChannelState::New);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }

    pub fn drain_channels(&mut self) -> Vec<Arc<Channel>> {
        self.channels.drain(..).map(|(_, c)| c).collect()
    }

    fn ctl(&self, op: c_int, channel: &Channel) {
        let fd = channel.fd();
        let events = interest_to_epoll(channel.interest());

        let result = match op {
            libc::EPOLL_CTL_ADD => self.epoll.add(fd, events, fd as u64),
            libc::EPOLL_CTL_MOD => self.epoll.modify(fd, events, fd as u64),
            _ => self.epoll.delete(fd),
        };

        if let Err(err) = result {
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl op=DEL fd={}: {}", fd, err);
            } else {
                panic!("epoll_ctl fd={}: {}", fd, err);
            }
        }
    }
}

fn interest_to_epoll(interest: Ready) -> u32 {
    let mut events = 0;

    if interest.is_readable() {
        events |= libc::EPOLLIN | libc::EPOLLPRI;
    }

    if interest.is_writable() {
        events |= libc::EPOLLOUT;
    }

    events as u32
}

fn ready_from_epoll(events: u32) -> Ready {
    let events = events as c_int;
    let mut ready = Ready::empty();

    if events & (libc::EPOLLIN | libc::EPOLLPRI | libc::EPOLLRDHUP) != 0 {
        ready.insert(Ready::readable());
    }

    if events & libc::EPOLLOUT != 0 {
        ready.insert(Ready::writable());
    }

    if events & libc::EPOLLERR != 0 {
        ready.insert(Ready::error());
    }

    if events & libc::EPOLLHUP != 0 {
        ready.insert(Ready::hup());
    }

    ready
}
