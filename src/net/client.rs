use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{error, info};

use crate::buffer::Buffer;
use crate::event_loop::LoopHandle;
use crate::net::connection::{TcpConnection, TcpConnectionRef};
use crate::net::connector::Connector;
use crate::net::{
    default_connection_callback, default_message_callback, CloseCallback, ConnectionCallback,
    MessageCallback, WriteCompleteCallback,
};
use crate::sys::Socket;
use crate::timestamp::Timestamp;

struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
}

/// A TCP client: one connector plus the connection it produces, both bound
/// to one loop.
///
/// `connect`, `disconnect` and `stop` are safe from any thread. With
/// [`enable_retry`], a lost connection is re-established with the
/// connector's backoff reset.
///
/// [`enable_retry`]: TcpClient::enable_retry
pub struct TcpClient {
    loop_: LoopHandle,
    connector: Arc<Connector>,
    name: String,
    weak_self: Weak<TcpClient>,
    callbacks: Mutex<Callbacks>,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<TcpConnectionRef>>,
}

impl TcpClient {
    pub fn new(loop_: &LoopHandle, server_addr: SocketAddr, name: &str) -> Arc<TcpClient> {
        let connector = Connector::new(loop_, server_addr);

        let client = Arc::new_cyclic(|weak_self| TcpClient {
            loop_: loop_.clone(),
            connector,
            name: name.to_string(),
            weak_self: weak_self.clone(),
            callbacks: Mutex::new(Callbacks {
                connection: Arc::new(default_connection_callback),
                message: Arc::new(default_message_callback),
                write_complete: None,
            }),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
        });

        let weak = Arc::downgrade(&client);
        client
            .connector
            .set_new_connection_callback(Box::new(move |socket| {
                if let Some(client) = weak.upgrade() {
                    client.new_connection(socket);
                }
            }));

        info!("client [{}] targeting {}", client.name, server_addr);
        client
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn server_address(&self) -> SocketAddr {
        self.connector.server_address()
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<TcpConnectionRef> {
        self.connection.lock().unwrap().clone()
    }

    pub fn enable_retry(&self) {
        self.retry.store(true, Ordering::Release);
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry.load(Ordering::Acquire)
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

    pub fn connect(&self) {
        info!(
            "client [{}] connecting to {}",
            self.name,
            self.connector.server_address()
        );
        self.connect.store(true, Ordering::Release);
        self.connector.start();
    }

    /// Gracefully shuts down the current connection, keeping the client
    /// usable for a later `connect`.
    pub fn disconnect(&self) {
        self.connect.store(false, Ordering::Release);

        if let Some(conn) = self.connection.lock().unwrap().as_ref() {
            conn.shutdown();
        }
    }

    /// Stops the connector, cancelling any pending reconnect attempt.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        self.connector.stop();
    }

    fn new_connection(&self, socket: Socket) {
        self.loop_.assert_in_loop_thread();

        let peer_addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("client [{}] getpeername: {}", self.name, e);
                return;
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!("client [{}] getsockname: {}", self.name, e);
                return;
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", self.name, peer_addr, conn_id);

        let conn = TcpConnection::new(
            self.loop_.clone(),
            conn_name,
            socket,
            local_addr,
            peer_addr,
        );

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
            if let Some(client) = weak.upgrade() {
                client.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(conn.clone());
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionRef) {
        self.loop_.assert_in_loop_thread();

        {
            let mut connection = self.connection.lock().unwrap();
            debug_assert!(connection
                .as_ref()
                .map_or(false, |c| Arc::ptr_eq(c, conn)));
            connection.take();
        }

        let destroyed = conn.clone();
        self.loop_.queue_in_loop(move || destroyed.connect_destroyed());

        if self.retry.load(Ordering::Acquire) && self.connect.load(Ordering::Acquire) {
            info!(
                "client [{}] reconnecting to {}",
                self.name,
                self.connector.server_address()
            );
            self.connector.restart();
        }
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        info!("client [{}] destructing", self.name);

        let conn = self.connection.get_mut().unwrap().take();

        match conn {
            Some(conn) => {
                let unique = Arc::strong_count(&conn) == 1;

                // a close racing with this drop must not run user code on a
                // half-dead client; destroy-only from here on
                let io_loop = self.loop_.clone();
                let detached: CloseCallback = Arc::new(move |conn: &TcpConnectionRef| {
                    let destroyed = conn.clone();
                    io_loop.queue_in_loop(move || destroyed.connect_destroyed());
                });

                let target = conn.clone();
                self.loop_
                    .run_in_loop(move || target.set_close_callback(detached));

                if unique {
                    conn.force_close();
                }
            }
            None => {
                self.connector.stop();
                // the connector may still own a pending retry timer; keep
                // it alive until that window has passed
                let connector = self.connector.clone();
                self.loop_.run_after(Duration::from_secs(1), move || {
                    let _ = &connector;
                });
            }
        }
    }
}
