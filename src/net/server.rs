use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use indexmap::IndexMap;
use log::{debug, error, info, warn};

use crate::buffer::Buffer;
use crate::event_loop::LoopHandle;
use crate::net::acceptor::Acceptor;
use crate::net::connection::{TcpConnection, TcpConnectionRef};
use crate::net::{
    default_connection_callback, default_message_callback, ConnectionCallback, MessageCallback,
    WriteCompleteCallback,
};
use crate::sys::Socket;
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::timestamp::Timestamp;

struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    thread_init: Option<ThreadInitCallback>,
}

/// A TCP server: one acceptor on the base loop, connections sharded
/// round-robin over an io-loop pool and published through callbacks.
///
/// Callback setters and `set_thread_count` must run before [`start`];
/// `start` itself is idempotent. Drain the io loops before dropping the
/// server.
///
/// [`start`]: TcpServer::start
pub struct TcpServer {
    loop_: LoopHandle,
    ip_port: String,
    name: String,
    weak_self: Weak<TcpServer>,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    callbacks: Mutex<Callbacks>,
    connections: Mutex<IndexMap<String, TcpConnectionRef>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    /// 0 means unlimited; above it, accepted sockets are closed on the
    /// spot so the listener never wedges on EMFILE pressure.
    max_connections: AtomicUsize,
}

impl TcpServer {
    pub fn new(
        loop_: &LoopHandle,
        listen_addr: &SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<Arc<TcpServer>> {
        let acceptor = Acceptor::new(loop_, listen_addr, reuse_port)?;

        let server = Arc::new_cyclic(|weak_self| TcpServer {
            loop_: loop_.clone(),
            ip_port: listen_addr.to_string(),
            name: name.to_string(),
            weak_self: weak_self.clone(),
            acceptor,
            pool: Mutex::new(EventLoopThreadPool::new(loop_.clone(), name)),
            callbacks: Mutex::new(Callbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
                thread_init: None,
            }),
            connections: Mutex::new(IndexMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            max_connections: AtomicUsize::new(0),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));

        Ok(server)
    }

    fn self_ref(&self) -> Arc<TcpServer> {
        self.weak_self.upgrade().expect("server already dropped")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    /// The actually bound address; useful after listening on port 0.
    pub fn listen_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    pub fn set_thread_count(&self, thread_count: usize) {
        self.pool.lock().unwrap().set_thread_count(thread_count);
    }

    /// Opt-in cap on live connections.
    pub fn set_max_connections(&self, max: usize) {
        self.max_connections.store(max, Ordering::Relaxed);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().connection = Arc::new(cb);
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().message = Arc::new(cb);
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionRef) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    pub fn set_thread_init_callback(&self, cb: ThreadInitCallback) {
        self.callbacks.lock().unwrap().thread_init = Some(cb);
    }

    /// Starts the io-loop pool and the listener. Calling it again is a
    /// no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        let thread_init = self.callbacks.lock().unwrap().thread_init.clone();
        let server = self.self_ref();
        self.loop_.run_in_loop(move || {
            server.pool.lock().unwrap().start(thread_init);
            server.acceptor.listen();
        });
    }

    fn new_connection(&self, socket: Socket, peer_addr: SocketAddr) {
        self.loop_.assert_in_loop_thread();

        let max = self.max_connections.load(Ordering::Relaxed);
        if max > 0 && self.connection_count() >= max {
            warn!(
                "server [{}] at its {}-connection cap, rejecting {}",
                self.name, max, peer_addr
            );
            return;
        }

        let io_loop = self.pool.lock().unwrap().next_loop();
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);

        info!(
            "server [{}] new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("server [{}] getsockname: {}", self.name, e);
                return;
            }
        };

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);

        {
            let callbacks = self.callbacks.lock().unwrap();
            conn.set_connection_callback_inner(callbacks.connection.clone());
            conn.set_message_callback_inner(callbacks.message.clone());
            if let Some(cb) = callbacks.write_complete.clone() {
                conn.set_write_complete_callback_inner(cb);
            }
        }

        let weak = self.weak_self.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());

        io_loop.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(&self, conn: &TcpConnectionRef) {
        let server = self.self_ref();
        let conn = conn.clone();
        self.loop_
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionRef) {
        self.loop_.assert_in_loop_thread();

        info!(
            "server [{}] removing connection [{}]",
            self.name,
            conn.name()
        );

        let removed = self.connections.lock().unwrap().swap_remove(conn.name());
        debug_assert!(removed.is_some());

        let conn = conn.clone();
        let io_loop = conn.loop_handle().clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        debug!("server [{}] destructing", self.name);

        let connections: Vec<TcpConnectionRef> = self
            .connections
            .lock()
            .unwrap()
            .drain(..)
            .map(|(_, conn)| conn)
            .collect();

        for conn in connections {
            let destroyed = conn.clone();
            conn.loop_handle()
                .clone()
                .run_in_loop(move || destroyed.connect_destroyed());
        }
    }
}
