use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use reactor_io::{EventLoop, TcpClient, TcpServer};

// Big enough that one nonblocking write cannot drain it into the kernel.
const PAYLOAD_LEN: usize = 32 * 1024 * 1024;

#[test]
fn high_water_mark_fires_exactly_once() {
    let _ = env_logger::try_init();

    let (addr_tx, addr_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            event_loop.handle(),
            &"127.0.0.1:0".parse().unwrap(),
            "sink",
            false,
        )
        .unwrap();

        // a pure sink that never reads, so the client's output backs up
        server.set_connection_callback(|conn| {
            if conn.connected() {
                conn.stop_read();
            }
        });
        server.start();

        addr_tx
            .send((server.listen_addr().unwrap(), event_loop.handle().clone()))
            .unwrap();

        event_loop.run();
    });

    let (addr, server_handle) = addr_rx.recv().unwrap();

    let event_loop = EventLoop::new().unwrap();
    let client = TcpClient::new(event_loop.handle(), addr, "flooder");

    let fired = Arc::new(AtomicUsize::new(0));
    let observed = Arc::new(AtomicUsize::new(0));

    {
        let fired = fired.clone();
        let observed = observed.clone();
        let client_handle = event_loop.handle().clone();
        let server_handle = server_handle.clone();
        let payload = vec![0x55u8; PAYLOAD_LEN];

        client.set_connection_callback(move |conn| {
            if !conn.connected() {
                return;
            }

            conn.set_high_water_mark(1024);
            {
                let fired = fired.clone();
                let observed = observed.clone();
                conn.set_high_water_mark_callback(move |_conn, pending| {
                    fired.fetch_add(1, Ordering::SeqCst);
                    observed.store(pending, Ordering::SeqCst);
                });
            }

            conn.send(&payload);

            // leave a window for a spurious second firing before quitting
            let client_handle = client_handle.clone();
            let server_handle = server_handle.clone();
            conn.loop_handle()
                .run_after(Duration::from_millis(400), move || {
                    server_handle.quit();
                    client_handle.quit();
                });
        });
    }

    client.connect();
    event_loop.run();
    server_thread.join().unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(observed.load(Ordering::SeqCst) >= 1024);
}
