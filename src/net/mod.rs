use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use log::trace;

use crate::buffer::Buffer;
use crate::timestamp::Timestamp;

pub mod acceptor;
pub mod client;
pub mod connection;
pub mod connector;
pub mod server;

pub use acceptor::Acceptor;
pub use client::TcpClient;
pub use connection::{TcpConnection, TcpConnectionRef};
pub use connector::Connector;
pub use server::TcpServer;

/// Fires once per state change, with `connected()` telling which side of
/// the transition the connection is on.
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fires with the input buffer and the poll-return time of the tick that
/// carried the bytes.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionRef, &mut Buffer, Timestamp) + Send + Sync>;

pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Fires on the upward crossing of the output-buffer high-water mark, with
/// the pending byte count.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionRef, usize) + Send + Sync>;

pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionRef) + Send + Sync>;

/// Resolves a host name to one address, port 0.
pub fn resolve(host: &str) -> Option<SocketAddr> {
    (host, 0).to_socket_addrs().ok()?.next()
}

pub(crate) fn default_connection_callback(conn: &TcpConnectionRef) {
    trace!(
        "{} -> {} is {}",
        conn.local_address(),
        conn.peer_address(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
    // do not force-close here; some users only register a message callback
}

pub(crate) fn default_message_callback(
    _conn: &TcpConnectionRef,
    buffer: &mut Buffer,
    _when: Timestamp,
) {
    buffer.retrieve_all();
}

#[cfg(test)]
mod test {
    #[test]
    fn resolve_localhost() {
        let addr = super::resolve("localhost").unwrap();
        assert!(addr.ip().is_loopback());
    }
}
