use std::cmp;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sys::socket::family_of;
use crate::sys::Socket;
use crate::timer_queue::TimerId;

pub type NewConnectionCallback = Box<dyn Fn(Socket) + Send + Sync>;

const INIT_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

struct Inner {
    state: State,
    socket: Option<Socket>,
    channel: Option<Arc<Channel>>,
    retry_delay: Duration,
    retry_timer: Option<TimerId>,
}

/// Drives a nonblocking connect with exponential-backoff retry, then hands
/// the connected socket off through the new-connection callback.
pub struct Connector {
    loop_: LoopHandle,
    server_addr: SocketAddr,
    weak_self: Weak<Connector>,
    connect: AtomicBool,
    inner: Mutex<Inner>,
    new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub fn new(loop_: &LoopHandle, server_addr: SocketAddr) -> Arc<Connector> {
        debug!("connector to {} created", server_addr);

        Arc::new_cyclic(|weak_self| Connector {
            loop_: loop_.clone(),
            server_addr,
            weak_self: weak_self.clone(),
            connect: AtomicBool::new(false),
            inner: Mutex::new(Inner {
                state: State::Disconnected,
                socket: None,
                channel: None,
                retry_delay: INIT_RETRY_DELAY,
                retry_timer: None,
            }),
            new_connection: Mutex::new(None),
        })
    }

    fn self_ref(&self) -> Arc<Connector> {
        self.weak_self.upgrade().expect("connector already dropped")
    }

    pub fn server_address(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection.lock().unwrap() = Some(cb);
    }

    /// Begins connecting; safe from any thread.
    pub fn start(&self) {
        self.connect.store(true, Ordering::Release);
        let connector = self.self_ref();
        self.loop_.run_in_loop(move || connector.start_in_loop());
    }

    /// Stops connecting and cancels any pending retry; safe from any
    /// thread.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        let connector = self.self_ref();
        self.loop_.queue_in_loop(move || connector.stop_in_loop());
    }

    /// Forgets the backoff and connects again; used by clients after a
    /// connection they wanted to keep died.
    pub(crate) fn restart(&self) {
        self.loop_.assert_in_loop_thread();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = State::Disconnected;
            inner.retry_delay = INIT_RETRY_DELAY;
        }
        self.connect.store(true, Ordering::Release);
        self.start_in_loop();
    }

    fn start_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        let state = self.inner.lock().unwrap().state;
        assert_eq!(state, State::Disconnected);

        if self.connect.load(Ordering::Acquire) {
            self.do_connect();
        } else {
            debug!("connector to {} told not to connect", self.server_addr);
        }
    }

    fn stop_in_loop(&self) {
        self.loop_.assert_in_loop_thread();

        let socket = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(timer) = inner.retry_timer.take() {
                self.loop_.cancel(timer);
            }
            if inner.state == State::Connecting {
                inner.state = State::Disconnected;
                Self::detach_channel(&mut inner)
            } else {
                None
            }
        };

        if let Some(socket) = socket {
            self.retry(socket);
        }
    }

    fn do_connect(&self) {
        let socket = match Socket::new_nonblocking(family_of(&self.server_addr)) {
            Ok(socket) => socket,
            Err(e) => {
                error!("connector socket(): {}", e);
                return;
            }
        };

        match socket.connect(&self.server_addr) {
            Ok(()) => self.connecting(socket),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(socket)
                }
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => self.retry(socket),
                Some(libc::EACCES)
                | Some(libc::EPERM)
                | Some(libc::EAFNOSUPPORT)
                | Some(libc::EALREADY)
                | Some(libc::EBADF)
                | Some(libc::EFAULT)
                | Some(libc::ENOTSOCK) => {
                    error!("connector connect to {}: {}", self.server_addr, e);
                }
                _ => {
                    error!(
                        "connector unexpected connect error to {}: {}",
                        self.server_addr, e
                    );
                }
            },
        }
    }

    /// Watches the in-flight socket for writability; the write-ready probe
    /// decides between success, self-connect and retry.
    fn connecting(&self, socket: Socket) {
        let channel = Channel::new(self.loop_.clone(), socket.as_raw_fd());

        let weak = self.weak_self.clone();
        channel.set_write_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        });

        let weak = self.weak_self.clone();
        channel.set_error_callback(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error();
            }
        });

        {
            let mut inner = self.inner.lock().unwrap();
            inner.state = State::Connecting;
            inner.socket = Some(socket);
            inner.channel = Some(channel.clone());
        }

        channel.enable_writing();
    }

    fn detach_channel(inner: &mut Inner) -> Option<Socket> {
        if let Some(channel) = inner.channel.take() {
            channel.disable_all();
            channel.remove();
        }
        inner.socket.take()
    }

    fn handle_write(&self) {
        let socket = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Connecting {
                trace!("connector write-ready in state {:?}", inner.state);
                return;
            }
            Self::detach_channel(&mut inner)
        };

        let socket = match socket {
            Some(socket) => socket,
            None => return,
        };

        match socket.take_error() {
            Ok(Some(e)) => {
                warn!("connector to {} - SO_ERROR: {}", self.server_addr, e);
                self.retry(socket);
            }
            Ok(None) if socket.is_self_connect() => {
                warn!("connector to {} - self connect", self.server_addr);
                self.retry(socket);
            }
            Ok(None) => {
                self.inner.lock().unwrap().state = State::Connected;
                if self.connect.load(Ordering::Acquire) {
                    let callback = self.new_connection.lock().unwrap();
                    match &*callback {
                        Some(cb) => cb(socket),
                        None => drop(socket),
                    }
                } else {
                    drop(socket);
                }
            }
            Err(e) => {
                warn!("connector to {} - SO_ERROR probe: {}", self.server_addr, e);
                self.retry(socket);
            }
        }
    }

    fn handle_error(&self) {
        let socket = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != State::Connecting {
                return;
            }
            error!("connector to {} - error event", self.server_addr);
            Self::detach_channel(&mut inner)
        };

        if let Some(socket) = socket {
            if let Ok(Some(e)) = socket.take_error() {
                trace!("connector to {} - SO_ERROR: {}", self.server_addr, e);
            }
            self.retry(socket);
        }
    }

    fn retry(&self, socket: Socket) {
        drop(socket);

        let mut inner = self.inner.lock().unwrap();
        inner.state = State::Disconnected;

        if !self.connect.load(Ordering::Acquire) {
            debug!("connector to {} told not to connect", self.server_addr);
            return;
        }

        let delay = inner.retry_delay;
        inner.retry_delay = cmp::min(delay * 2, MAX_RETRY_DELAY);

        info!(
            "connector retrying {} in {} ms",
            self.server_addr,
            delay.as_millis()
        );

        let weak = self.weak_self.clone();
        inner.retry_timer = Some(self.loop_.run_after(delay, move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        }));
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        debug!("connector to {} dropped", self.server_addr);
    }
}
