use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use reactor_io::{EventLoop, TcpClient, TcpServer};

#[test]
fn echo_bounce() {
    let _ = env_logger::try_init();

    let (addr_tx, addr_rx) = mpsc::channel();
    let (stats_tx, stats_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            event_loop.handle(),
            &"127.0.0.1:0".parse().unwrap(),
            "echo",
            false,
        )
        .unwrap();

        let ups = Arc::new(AtomicUsize::new(0));
        let downs = Arc::new(AtomicUsize::new(0));
        {
            let ups = ups.clone();
            let downs = downs.clone();
            server.set_connection_callback(move |conn| {
                if conn.connected() {
                    ups.fetch_add(1, Ordering::SeqCst);
                } else {
                    downs.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        server.set_message_callback(|conn, buffer, _when| {
            let data = buffer.retrieve_all_bytes();
            conn.send(&data);
        });
        server.start();

        addr_tx
            .send((server.listen_addr().unwrap(), event_loop.handle().clone()))
            .unwrap();

        event_loop.run();

        stats_tx
            .send((ups.load(Ordering::SeqCst), downs.load(Ordering::SeqCst)))
            .unwrap();
    });

    let (addr, server_handle) = addr_rx.recv().unwrap();

    let event_loop = EventLoop::new().unwrap();
    let client = TcpClient::new(event_loop.handle(), addr, "echo-client");

    let expected: Vec<u8> = b"hello world".repeat(10);
    let received = Arc::new(Mutex::new(Vec::new()));

    {
        let client_handle = event_loop.handle().clone();
        let server_handle = server_handle.clone();
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                for _ in 0..10 {
                    conn.send(b"hello world");
                }
            } else {
                server_handle.quit();
                client_handle.quit();
            }
        });
    }
    {
        let received = received.clone();
        let want = expected.len();
        client.set_message_callback(move |conn, buffer, _when| {
            let mut received = received.lock().unwrap();
            received.extend_from_slice(buffer.readable());
            buffer.retrieve_all();
            if received.len() >= want {
                conn.shutdown();
            }
        });
    }

    client.connect();
    event_loop.run();

    // the server loop must wind down promptly once told to quit
    let (ups, downs) = stats_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("server loop did not quit in time");
    server_thread.join().unwrap();

    assert_eq!(ups, 1);
    assert_eq!(downs, 1);
    assert_eq!(*received.lock().unwrap(), expected);
}
