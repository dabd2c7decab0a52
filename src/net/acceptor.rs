use std::io;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::error;

use crate::channel::Channel;
use crate::event_loop::LoopHandle;
use crate::sys::socket::family_of;
use crate::sys::{FileDesc, Socket};

pub type NewConnectionCallback = Box<dyn Fn(Socket, SocketAddr) + Send + Sync>;

/// Owns a listening socket and hands accepted sockets to a callback.
///
/// One connection is accepted per readiness wake, so a busy listener cannot
/// starve the other channels on its loop.
pub struct Acceptor {
    loop_: LoopHandle,
    socket: Socket,
    channel: Arc<Channel>,
    listening: AtomicBool,
    /// A reserved descriptor, burned and re-opened to drain the backlog
    /// when accept fails with EMFILE.
    idle_fd: Mutex<Option<FileDesc>>,
    new_connection: Mutex<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        loop_: &LoopHandle,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Arc<Acceptor>> {
        let socket = Socket::new_nonblocking(family_of(listen_addr))?;
        socket.set_reuse_addr(true)?;
        if reuse_port {
            socket.set_reuse_port(true)?;
        }
        socket.bind(listen_addr)?;

        let idle_fd = FileDesc::open_dev_null()?;
        let channel = Channel::new(loop_.clone(), socket.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            loop_: loop_.clone(),
            socket,
            channel,
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
            new_connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: NewConnectionCallback) {
        *self.new_connection.lock().unwrap() = Some(cb);
    }

    /// Starts listening and watches the socket for readability. Must run on
    /// the owning loop's thread.
    pub fn listen(&self) {
        self.loop_.assert_in_loop_thread();
        self.listening.store(true, Ordering::Release);
        if let Err(e) = self.socket.listen() {
            error!("acceptor listen: {}", e);
            return;
        }
        self.channel.enable_reading();
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn handle_read(&self) {
        self.loop_.assert_in_loop_thread();

        match self.socket.accept() {
            Ok((sock, peer_addr)) => {
                let callback = self.new_connection.lock().unwrap();
                match &*callback {
                    Some(cb) => cb(sock, peer_addr),
                    None => drop(sock),
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                error!("acceptor accept: {}", e);
                // See "The special problem of accept()ing when you can't"
                // in libev's documentation.
                if e.raw_os_error() == Some(libc::EMFILE) {
                    let mut idle_fd = self.idle_fd.lock().unwrap();
                    idle_fd.take();
                    if let Ok((sock, _)) = self.socket.accept() {
                        drop(sock);
                    }
                    *idle_fd = FileDesc::open_dev_null().ok();
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.channel.is_added() {
            self.channel.disable_all();
            self.channel.remove();
        }
    }
}
