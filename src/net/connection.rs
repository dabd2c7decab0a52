use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::net::{
    CloseCallback, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::sys::Socket;
use crate::timestamp::Timestamp;

pub type TcpConnectionRef = Arc<TcpConnection>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

/// One established TCP connection, pinned to one loop for life.
///
/// Shared by reference count: the owning server or client map holds one
/// strong reference, and tasks in flight to the loop hold their own clones,
/// so callbacks can never dangle. `send`, `shutdown`, `force_close`,
/// `start_read` and `stop_read` are safe from any thread; everything else
/// runs on the owning loop.
pub struct TcpConnection {
    loop_: LoopHandle,
    name: String,
    socket: Socket,
    channel: Arc<Channel>,
    weak_self: Weak<TcpConnection>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    reading: AtomicBool,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl TcpConnection {
    pub fn new(
        loop_: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionRef {
        if let Err(e) = socket.set_keep_alive(true) {
            warn!("connection [{}] SO_KEEPALIVE: {}", name, e);
        }

        let channel = Channel::new(loop_.clone(), socket.as_raw_fd());

        debug!("connection [{}] created, fd={}", name, socket.as_raw_fd());

        let conn = Arc::new_cyclic(|weak_self| TcpConnection {
            loop_,
            name,
            socket,
            channel,
            weak_self: weak_self.clone(),
            local_addr,
            peer_addr,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
            context: Mutex::new(None),
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_read_callback(move |when| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(when);
            }
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });

        let weak = Arc::downgrade(&conn);
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });

        conn
    }

    fn self_ref(&self) -> TcpConnectionRef {
        self.weak_self.upgrade().expect("connection already dropped")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub fn get_tcp_info(&self) -> io::Result<libc::tcp_info> {
        self.socket.tcp_info()
    }

    pub fn get_tcp_info_string(&self) -> io::Result<String> {
        self.socket.tcp_info_string()
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_no_delay(on)
    }

    pub fn set_high_water_mark(&self, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub fn set_context(&self, context: Box<dyn Any + Send + Sync>) {
        *self.context.lock().unwrap() = Some(context);
    }

    pub fn context(&self) -> MutexGuard<'_, Option<Box<dyn Any + Send + Sync>>> {
        self.context.lock().unwrap()
    }

    /// The pending input. Do not call from inside the message callback; the
    /// buffer is already passed to it there.
    pub fn input_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.input.lock().unwrap()
    }

    /// The unsent output. Do not hold across loop callbacks.
    pub fn output_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.output.lock().unwrap()
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static) {
        self.set_connection_callback_inner(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        self.set_message_callback_inner(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static,
    ) {
        self.set_write_complete_callback_inner(Arc::new(cb));
    }

    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef, usize) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().high_water_mark = Some(Arc::new(cb));
    }

    pub(crate) fn set_connection_callback_inner(&self, cb: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(cb);
    }

    pub(crate) fn set_message_callback_inner(&self, cb: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(cb);
    }

    pub(crate) fn set_write_complete_callback_inner(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(cb);
    }

    pub(crate) fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(cb);
    }

    /// Sends a copy of `data`, from any thread. On the loop thread a direct
    /// nonblocking write is attempted first; the unsent remainder lands in
    /// the output buffer and is flushed on write readiness.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }

        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.self_ref();
            let message = data.to_vec();
            self.loop_.queue_in_loop(move || {
                conn.send_in_loop(&message);
            });
        }
    }

    /// Sends and drains the caller's buffer. In-loop the bytes go straight
    /// out; cross-thread they are copied over to the loop.
    pub fn send_buffer(&self, buffer: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }

        if self.loop_.is_in_loop_thread() {
            let readable = buffer.retrieve_all_bytes();
            self.send_in_loop(&readable);
        } else {
            let conn = self.self_ref();
            let message = buffer.retrieve_all_bytes();
            self.loop_.queue_in_loop(move || {
                conn.send_in_loop(&message);
            });
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_.assert_in_loop_thread();

        if self.state() == State::Disconnected {
            warn!("connection [{}] is down, giving up the write", self.name);
            return;
        }

        let mut nwrote = 0;
        let mut fault = false;
        let mut output = self.output.lock().unwrap();

        // nothing queued: try the direct write
        if !self.channel.is_writing() && output.readable_len() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    if nwrote == data.len() {
                        self.queue_write_complete();
                    }
                }
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!("connection [{}] write: {}", self.name, e);
                        if matches!(
                            e.raw_os_error(),
                            Some(libc::EPIPE) | Some(libc::ECONNRESET)
                        ) {
                            fault = true;
                        }
                    }
                }
            }
        }

        let remaining = data.len() - nwrote;
        if !fault && remaining > 0 {
            let old_len = output.readable_len();
            let mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= mark && old_len < mark {
                self.queue_high_water_mark(old_len + remaining);
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    /// Half-closes the write side once pending output drains.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.self_ref();
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            if let Err(e) = self.socket.shutdown_write() {
                error!("connection [{}] shutdown: {}", self.name, e);
            }
        }
    }

    /// Drops the connection as if the peer had closed it.
    pub fn force_close(&self) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = self.self_ref();
            self.loop_.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    pub fn force_close_with_delay(&self, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let weak = self.weak_self.clone();
            // a weak callback: a connection gone by then is skipped
            self.loop_.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    fn force_close_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.handle_close();
        }
    }

    pub fn start_read(&self) {
        let conn = self.self_ref();
        self.loop_.run_in_loop(move || {
            if !conn.reading.load(Ordering::Acquire) || !conn.channel.is_reading() {
                conn.channel.enable_reading();
                conn.reading.store(true, Ordering::Release);
            }
        });
    }

    pub fn stop_read(&self) {
        let conn = self.self_ref();
        self.loop_.run_in_loop(move || {
            if conn.reading.load(Ordering::Acquire) || conn.channel.is_reading() {
                conn.channel.disable_reading();
                conn.reading.store(false, Ordering::Release);
            }
        });
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Acquire)
    }

    /// Called once by the owning server or client, on the connection's
    /// loop, after construction.
    pub(crate) fn connect_established(&self) {
        self.loop_.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        self.channel.tie(&self.self_ref());
        self.channel.enable_reading();

        if let Some(cb) = self.connection_callback() {
            cb(&self.self_ref());
        }
    }

    /// The owner's last act on a connection: detaches the channel from the
    /// loop. Fires the down transition if nothing else did.
    pub(crate) fn connect_destroyed(&self) {
        self.loop_.assert_in_loop_thread();

        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            self.channel.disable_all();
            if let Some(cb) = self.connection_callback() {
                cb(&self.self_ref());
            }
        }

        if self.channel.is_added() {
            self.channel.remove();
        }
    }

    fn handle_read(&self, when: Timestamp) {
        self.loop_.assert_in_loop_thread();

        let mut input = self.input.lock().unwrap();
        match input.read_fd(self.socket.as_raw_fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close();
            }
            Ok(_) => {
                let cb = self.callbacks.lock().unwrap().message.clone();
                match cb {
                    Some(cb) => cb(&self.self_ref(), &mut *input, when),
                    None => input.retrieve_all(),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                drop(input);
                error!("connection [{}] read: {}", self.name, e);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.loop_.assert_in_loop_thread();

        if !self.channel.is_writing() {
            trace!("connection [{}] is down, no more writing", self.name);
            return;
        }

        let mut output = self.output.lock().unwrap();
        match self.socket.write(output.readable()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_len() == 0 {
                    self.channel.disable_writing();
                    self.queue_write_complete();
                    if self.state() == State::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop();
                    }
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => error!("connection [{}] write: {}", self.name, e),
        }
    }

    fn handle_close(&self) {
        self.loop_.assert_in_loop_thread();
        trace!(
            "connection [{}] closing, state={:?}",
            self.name,
            self.state()
        );
        assert!(matches!(
            self.state(),
            State::Connected | State::Disconnecting
        ));

        // the fd stays open until the owner drops us; leaks show up by name
        self.set_state(State::Disconnected);
        self.channel.disable_all();

        let guard = self.self_ref();
        let (connection_cb, close_cb) = {
            let callbacks = self.callbacks.lock().unwrap();
            (callbacks.connection.clone(), callbacks.close.clone())
        };

        if let Some(cb) = connection_cb {
            cb(&guard);
        }
        // must be last: the owner drops its reference in here
        if let Some(cb) = close_cb {
            cb(&guard);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => error!("connection [{}] SO_ERROR: {}", self.name, e),
            Ok(None) => {}
            Err(e) => error!("connection [{}] SO_ERROR probe failed: {}", self.name, e),
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.callbacks.lock().unwrap().write_complete.clone();
        if let Some(cb) = cb {
            let conn = self.self_ref();
            self.loop_.queue_in_loop(move || cb(&conn));
        }
    }

    fn queue_high_water_mark(&self, pending: usize) {
        let cb = self.callbacks.lock().unwrap().high_water_mark.clone();
        if let Some(cb) = cb {
            let conn = self.self_ref();
            self.loop_.queue_in_loop(move || cb(&conn, pending));
        }
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().unwrap().connection.clone()
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "connection [{}] dropped, fd={}, state={:?}",
            self.name,
            self.socket.as_raw_fd(),
            self.state()
        );
    }
}
