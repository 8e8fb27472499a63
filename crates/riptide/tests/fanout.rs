use std::{
    collections::{HashMap, HashSet},
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpStream},
    sync::{Arc, Mutex, mpsc},
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use riptide::{EventLoop, ServerOption, TcpServer};

const SUBLOOPS: usize = 3;
const CLIENTS: usize = 9;
const ROUNDS: usize = 3;

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn connections_fan_out_round_robin_and_stay_pinned() {
    let records: Arc<Mutex<Vec<(String, ThreadId)>>> = Arc::new(Mutex::new(Vec::new()));
    let init_threads: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let (ready_tx, ready_rx) = mpsc::channel();

    let recorded = records.clone();
    let inits = init_threads.clone();

    let server_thread = thread::spawn(move || {
        let base_loop = EventLoop::new();
        let server = TcpServer::new(
            &base_loop,
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            "fanout",
            ServerOption::NoReusePort,
        );
        server.set_thread_num(SUBLOOPS);
        server.set_thread_init_callback(move |_event_loop| {
            inits.lock().unwrap().push(thread::current().id());
        });
        server.set_message_callback(move |conn, buffer, _when| {
            buffer.retrieve_all();
            recorded
                .lock()
                .unwrap()
                .push((conn.name().to_string(), thread::current().id()));
            conn.send("ack");
        });
        server.start();
        ready_tx.send((server.local_addr(), base_loop.clone())).unwrap();
        base_loop.run();
    });

    let (addr, base_loop) = ready_rx.recv().unwrap();

    // every worker ran its init callback before start() returned
    assert_eq!(init_threads.lock().unwrap().len(), SUBLOOPS);

    let mut clients: Vec<TcpStream> = (0..CLIENTS)
        .map(|_| TcpStream::connect(addr).expect("connect"))
        .collect();

    // waiting for the ack between writes keeps the messages from coalescing
    for _ in 0..ROUNDS {
        for client in &mut clients {
            client.write_all(b"ping").expect("send");
            let mut ack = [0u8; 3];
            client.read_exact(&mut ack).expect("ack");
            assert_eq!(&ack, b"ack");
        }
    }

    wait_until(Duration::from_secs(5), || {
        records.lock().unwrap().len() == CLIENTS * ROUNDS
    });

    let records = records.lock().unwrap();
    let mut per_conn: HashMap<String, HashSet<ThreadId>> = HashMap::new();
    let mut per_thread: HashMap<ThreadId, HashSet<String>> = HashMap::new();
    for (conn_name, thread_id) in records.iter() {
        per_conn.entry(conn_name.clone()).or_default().insert(*thread_id);
        per_thread.entry(*thread_id).or_default().insert(conn_name.clone());
    }

    // each connection is pinned to exactly one subloop thread
    assert_eq!(per_conn.len(), CLIENTS);
    for (conn_name, threads) in &per_conn {
        assert_eq!(threads.len(), 1, "{conn_name} ran on multiple threads");
    }

    // round-robin spreads nine connections as three per subloop, and the
    // callbacks run on the threads the init callback saw
    let init_set: HashSet<ThreadId> = init_threads.lock().unwrap().iter().copied().collect();
    assert_eq!(per_thread.len(), SUBLOOPS);
    for (thread_id, conns) in &per_thread {
        assert!(init_set.contains(thread_id));
        assert_eq!(conns.len(), CLIENTS / SUBLOOPS);
    }

    drop(clients);
    base_loop.quit();
    server_thread.join().unwrap();
}
