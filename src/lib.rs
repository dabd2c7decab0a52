//! A reactor-style non-blocking TCP networking core: one event loop per
//! thread, channels binding file descriptors to callbacks, a timerfd-backed
//! timer queue, and server/client types that shard connections over a
//! loop-per-thread pool.
//!
//! ## Usage
//!
//! First, add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! reactor-io = "0.1"
//! ```
//!
//! # Example
//!
//! An echo server on four io loops:
//!
//! ```no_run
//! use reactor_io::{EventLoop, TcpServer};
//!
//! let event_loop = EventLoop::new().unwrap();
//!
//! let addr = "127.0.0.1:7000".parse().unwrap();
//! let server = TcpServer::new(event_loop.handle(), &addr, "echo", false).unwrap();
//!
//! server.set_thread_count(4);
//! server.set_message_callback(|conn, buffer, _when| {
//!     let data = buffer.retrieve_all_bytes();
//!     conn.send(&data);
//! });
//!
//! server.start();
//! event_loop.run();
//! ```
//!
//! Everything a callback runs on is the connection's own loop thread, so
//! callbacks must never block; hand blocking work to another thread and
//! come back with [`LoopHandle::run_in_loop`].

pub mod buffer;
pub mod channel;
pub mod event_loop;
pub mod net;
pub mod poller;
pub mod ready;
pub mod sys;
pub mod thread_pool;
pub mod timer_queue;
pub mod timestamp;

pub use buffer::Buffer;
pub use channel::Channel;
pub use event_loop::{EventLoop, LoopHandle};
pub use net::{
    Acceptor, Connector, ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpClient,
    TcpConnection, TcpConnectionRef, TcpServer, WriteCompleteCallback,
};
pub use poller::Poller;
pub use ready::Ready;
pub use thread_pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use timer_queue::TimerId;
pub use timestamp::Timestamp;
