use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use indexmap::IndexMap;
use libc::{self, c_short};
use log::{error, trace};

use crate::channel::{Channel, ChannelState};
use crate::ready::Ready;
use crate::sys::syscall;
use crate::timestamp::Timestamp;

/// The poll(2) fallback backend. Interest is mirrored into a flat pollfd
/// vector; a channel with empty interest keeps its slot with a negated fd
/// so POLLERR/POLLHUP stop being reported for it.
pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    positions: HashMap<RawFd, usize>,
    channels: IndexMap<RawFd, Arc<Channel>>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            positions: HashMap::new(),
            channels: IndexMap::new(),
        }
    }

    pub fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Timestamp {
        trace!("poll: {} fds registered", self.pollfds.len());

        let result = syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout_ms
        ));
        let now = Timestamp::now();

        match result {
            Ok(mut left) => {
                for pollfd in &self.pollfds {
                    if left == 0 {
                        break;
                    }
                    if pollfd.revents == 0 || pollfd.fd < 0 {
                        continue;
                    }
                    left -= 1;

                    if let Some(channel) = self.channels.get(&pollfd.fd) {
                        channel.set_revents(ready_from_poll(pollfd.revents));
                        active.push(channel.clone());
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!("poll: {}", e),
        }

        now
    }

    pub fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        let interest = channel.interest();
        trace!("poll: update fd={} interest={:?}", fd, interest);

        match channel.state() {
            ChannelState::New => {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, channel.clone());
                self.positions.insert(fd, self.pollfds.len());
                self.pollfds.push(libc::pollfd {
                    fd: slot_fd(fd, interest),
                    events: interest_to_poll(interest),
                    revents: 0,
                });
                channel.set_state(ChannelState::Added);
            }
            ChannelState::Added | ChannelState::Deleted => {
                assert!(self.channels.contains_key(&fd));
                let pos = self.positions[&fd];
                let pollfd = &mut self.pollfds[pos];
                pollfd.fd = slot_fd(fd, interest);
                pollfd.events = interest_to_poll(interest);
                pollfd.revents = 0;
                channel.set_state(ChannelState::Added);
            }
        }
    }

    pub fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("poll: remove fd={}", fd);

        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_interest());

        self.channels.swap_remove(&fd);
        let pos = self.positions.remove(&fd).expect("pollfd slot missing");

        self.pollfds.swap_remove(pos);
        if pos < self.pollfds.len() {
            let moved = self.pollfds[pos].fd;
            let moved_fd = if moved < 0 { -moved - 1 } else { moved };
            self.positions.insert(moved_fd, pos);
        }

        channel.set_state(ChannelState::New);
    }

    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|c| std::ptr::eq(Arc::as_ptr(c), channel))
    }

    pub fn drain_channels(&mut self) -> Vec<Arc<Channel>> {
        self.pollfds.clear();
        self.positions.clear();
        self.channels.drain(..).map(|(_, c)| c).collect()
    }
}

fn slot_fd(fd: RawFd, interest: Ready) -> RawFd {
    if interest.is_empty() {
        -fd - 1
    } else {
        fd
    }
}

fn interest_to_poll(interest: Ready) -> c_short {
    let mut events = 0;

    if interest.is_readable() {
        events |= libc::POLLIN | libc::POLLPRI;
    }

    if interest.is_writable() {
        events |= libc::POLLOUT;
    }

    events
}

fn ready_from_poll(revents: c_short) -> Ready {
    let mut ready = Ready::empty();

    if revents & (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) != 0 {
        ready.insert(Ready::readable());
    }

    if revents & libc::POLLOUT != 0 {
        ready.insert(Ready::writable());
    }

    if revents & libc::POLLERR != 0 {
        ready.insert(Ready::error());
    }

    if revents & libc::POLLHUP != 0 {
        ready.insert(Ready::hup());
    }

    if revents & libc::POLLNVAL != 0 {
        ready.insert(Ready::invalid());
    }

    ready
}
