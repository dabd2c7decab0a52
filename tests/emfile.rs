use std::io::{Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use reactor_io::{EventLoop, TcpServer};

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn listener_survives_fd_exhaustion() {
    let _ = env_logger::try_init();

    let (addr_tx, addr_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            event_loop.handle(),
            &"127.0.0.1:0".parse().unwrap(),
            "emfile",
            false,
        )
        .unwrap();

        server.set_message_callback(|conn, buffer, _when| {
            let data = buffer.retrieve_all_bytes();
            conn.send(&data);
        });
        server.start();

        addr_tx
            .send((server.listen_addr().unwrap(), event_loop.handle().clone()))
            .unwrap();

        event_loop.run();
    });

    let (addr, server_handle) = addr_rx.recv().unwrap();

    // clamp the fd limit to just above what the process already uses
    let mut old_limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    assert_eq!(
        unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut old_limit) },
        0
    );
    let clamped = libc::rlimit {
        rlim_cur: (open_fd_count() + 8) as libc::rlim_t,
        rlim_max: old_limit.rlim_max,
    };
    assert_eq!(
        unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &clamped) },
        0
    );

    // flood: the accept side runs out of descriptors and must fall back to
    // the idle-fd dance instead of spinning on a ready listener
    let mut streams = Vec::new();
    for _ in 0..32 {
        match std::net::TcpStream::connect(addr) {
            Ok(stream) => streams.push(stream),
            Err(_) => break,
        }
    }
    thread::sleep(Duration::from_millis(300));

    // release the pressure
    streams.clear();
    assert_eq!(
        unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &old_limit) },
        0
    );
    thread::sleep(Duration::from_millis(200));

    // the server must still accept and echo
    let mut probe = std::net::TcpStream::connect(addr).expect("listener is gone");
    probe
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    probe.write_all(b"still alive").unwrap();

    let mut echoed = [0u8; 11];
    probe.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"still alive");

    drop(probe);
    server_handle.quit();
    server_thread.join().unwrap();
}
