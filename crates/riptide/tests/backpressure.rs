use std::{
    io::Read,
    net::{Ipv4Addr, SocketAddr, TcpStream},
    sync::{
        Arc, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use riptide::{EventLoop, ServerOption, TcpServer};

const CHUNK: usize = 8 * 1024 * 1024;
const CHUNKS: usize = 4;
const MARK: usize = 16 * 1024 * 1024;

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn high_water_fires_on_the_rising_edge_and_write_complete_after_drain() {
    let high_water_hits = Arc::new(AtomicUsize::new(0));
    let high_water_len = Arc::new(AtomicUsize::new(0));
    let write_completes = Arc::new(AtomicUsize::new(0));
    let (ready_tx, ready_rx) = mpsc::channel();

    let hits = high_water_hits.clone();
    let len = high_water_len.clone();
    let completes = write_completes.clone();

    let server_thread = thread::spawn(move || {
        let base_loop = EventLoop::new();
        let server = TcpServer::new(
            &base_loop,
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            "firehose",
            ServerOption::NoReusePort,
        );
        server.set_thread_num(1);
        server.set_write_complete_callback(move |_conn| {
            completes.fetch_add(1, Ordering::SeqCst);
        });
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let hits = hits.clone();
                let len = len.clone();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn, queued| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        len.store(queued, Ordering::SeqCst);
                    }),
                    MARK,
                );
                // the client is not reading yet, so most of this queues in
                // the output buffer and crosses the mark exactly once
                for _ in 0..CHUNKS {
                    conn.send(vec![7u8; CHUNK]);
                }
            }
        });
        server.start();
        ready_tx.send((server.local_addr(), base_loop.clone())).unwrap();
        base_loop.run();
    });

    let (addr, base_loop) = ready_rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).expect("connect");
    let mut received = vec![0u8; CHUNK * CHUNKS];
    client.read_exact(&mut received).expect("read the firehose");
    assert!(received.iter().all(|byte| *byte == 7));

    wait_until(Duration::from_secs(10), || {
        write_completes.load(Ordering::SeqCst) == 1
    });
    assert_eq!(high_water_hits.load(Ordering::SeqCst), 1);
    assert!(high_water_len.load(Ordering::SeqCst) >= MARK);

    drop(client);
    base_loop.quit();
    server_thread.join().unwrap();
}
