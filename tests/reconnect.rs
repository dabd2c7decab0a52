use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use reactor_io::{EventLoop, TcpClient, TcpServer};

#[test]
fn reconnect_until_server_appears() {
    let _ = env_logger::try_init();

    // reserve a port the kernel considers closed once the listener is gone
    let placeholder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = placeholder.local_addr().unwrap();
    drop(placeholder);

    let event_loop = EventLoop::new().unwrap();
    let client = TcpClient::new(event_loop.handle(), addr, "retrier");
    client.enable_retry();

    let connected_after = Arc::new(Mutex::new(None::<Duration>));
    let start = Instant::now();

    {
        let connected_after = connected_after.clone();
        let client_handle = event_loop.handle().clone();
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                *connected_after.lock().unwrap() = Some(start.elapsed());
                client_handle.quit();
            }
        });
    }

    client.connect();

    // bring a server up on that very port while the client is backing off:
    // attempts land at ~0 ms, ~500 ms, ~1.5 s, ~3.5 s
    let (server_tx, server_rx) = mpsc::channel();
    let server_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(1200));
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(event_loop.handle(), &addr, "late-riser", false).unwrap();
        server.start();
        server_tx.send(event_loop.handle().clone()).unwrap();
        event_loop.run();
    });

    event_loop.run();

    let server_handle = server_rx.recv().unwrap();
    server_handle.quit();
    server_thread.join().unwrap();

    let elapsed = connected_after
        .lock()
        .unwrap()
        .expect("client never connected");

    // the first attempt must have failed and backoff been in effect
    assert!(elapsed >= Duration::from_millis(900), "elapsed {:?}", elapsed);
    // ...but a later attempt succeeds once the server listens
    assert!(elapsed <= Duration::from_secs(8), "elapsed {:?}", elapsed);
}
