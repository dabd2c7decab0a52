use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use reactor_io::{Buffer, EventLoop, TcpClient, TcpServer};

const FRAMES: usize = 1000;
const CLIENTS: u8 = 4;

fn frame_payload(client_id: u8, index: usize) -> Vec<u8> {
    let len = (index % 256) + 1;
    (0..len)
        .map(|j| client_id ^ (index as u8) ^ (j as u8))
        .collect()
}

fn expected_stream(client_id: u8) -> Vec<u8> {
    let mut stream = Vec::new();
    for index in 0..FRAMES {
        let payload = frame_payload(client_id, index);
        stream.extend_from_slice(&(payload.len() as i32).to_be_bytes());
        stream.extend_from_slice(&payload);
    }
    stream
}

#[test]
fn concurrent_clients_get_their_frames_back_in_order() {
    let _ = env_logger::try_init();

    let (addr_tx, addr_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::new(
            event_loop.handle(),
            &"127.0.0.1:0".parse().unwrap(),
            "frames",
            false,
        )
        .unwrap();

        server.set_thread_count(4);
        server.set_message_callback(|conn, buffer, _when| {
            // echo every complete length-prefixed frame
            while buffer.readable_len() >= 4 {
                let len = buffer.peek_i32() as usize;
                if buffer.readable_len() < 4 + len {
                    break;
                }
                buffer.retrieve(4);
                let payload = buffer.retrieve_as_bytes(len);

                let mut reply = Buffer::new();
                reply.append(&payload);
                reply.prepend_i32(len as i32);
                conn.send(reply.readable());
            }
        });
        server.start();

        addr_tx
            .send((server.listen_addr().unwrap(), event_loop.handle().clone()))
            .unwrap();

        event_loop.run();
    });

    let (addr, server_handle) = addr_rx.recv().unwrap();

    let mut client_threads = Vec::new();
    for client_id in 0..CLIENTS {
        client_threads.push(thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let client = TcpClient::new(event_loop.handle(), addr, &format!("c{}", client_id));

            let expected = expected_stream(client_id);
            let received = Arc::new(Mutex::new(Vec::with_capacity(expected.len())));
            let producers = Arc::new(Mutex::new(Vec::new()));

            {
                let received = received.clone();
                let want = expected.len();
                let quitter = event_loop.handle().clone();
                client.set_message_callback(move |_conn, buffer, _when| {
                    let mut received = received.lock().unwrap();
                    received.extend_from_slice(buffer.readable());
                    buffer.retrieve_all();
                    if received.len() >= want {
                        quitter.quit();
                    }
                });
            }
            {
                // a separate producer thread exercises the cross-thread
                // send path; per-connection FIFO must still hold
                let producers = producers.clone();
                client.set_connection_callback(move |conn| {
                    if !conn.connected() {
                        return;
                    }
                    let conn = conn.clone();
                    producers.lock().unwrap().push(thread::spawn(move || {
                        for index in 0..FRAMES {
                            let payload = frame_payload(client_id, index);
                            let mut message = Buffer::new();
                            message.append(&payload);
                            message.prepend_i32(payload.len() as i32);
                            conn.send(message.readable());
                        }
                    }));
                });
            }

            client.connect();
            event_loop.run();

            for producer in producers.lock().unwrap().drain(..) {
                producer.join().unwrap();
            }

            assert_eq!(*received.lock().unwrap(), expected, "client {}", client_id);
        }));
    }

    for client_thread in client_threads {
        client_thread.join().unwrap();
    }

    server_handle.quit();
    server_thread.join().unwrap();
}
