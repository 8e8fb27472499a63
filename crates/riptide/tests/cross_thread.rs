use std::{
    io::Read,
    net::{Ipv4Addr, SocketAddr, TcpStream},
    sync::{
        Arc, Mutex, mpsc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use riptide::{EventLoop, ServerOption, TcpConnectionRef, TcpServer};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn send_from_a_foreign_thread_is_written_by_the_owning_loop() {
    let conn_slot: Arc<Mutex<Option<TcpConnectionRef>>> = Arc::new(Mutex::new(None));
    let captured = conn_slot.clone();
    let (ready_tx, ready_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let base_loop = EventLoop::new();
        let server = TcpServer::new(
            &base_loop,
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            "crossthread",
            ServerOption::NoReusePort,
        );
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                *captured.lock().unwrap() = Some(conn.clone());
            }
        });
        server.start();
        ready_tx.send((server.local_addr(), base_loop.clone())).unwrap();
        base_loop.run();
    });

    let (addr, base_loop) = ready_rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).expect("connect");
    wait_until(Duration::from_secs(5), || conn_slot.lock().unwrap().is_some());
    let conn = conn_slot.lock().unwrap().clone().unwrap();

    // this test thread is not the loop thread, so the bytes must hop
    assert!(!conn.owner_loop().is_in_loop_thread());
    conn.send("from-elsewhere");

    let mut received = [0u8; 14];
    client.read_exact(&mut received).expect("read");
    assert_eq!(&received, b"from-elsewhere");

    drop(conn);
    drop(client);
    base_loop.quit();
    server_thread.join().unwrap();
}

#[test]
fn queued_tasks_run_in_fifo_order_on_the_loop_thread() {
    let (ready_tx, ready_rx) = mpsc::channel();
    let loop_thread = thread::spawn(move || {
        let event_loop = EventLoop::new();
        ready_tx
            .send((event_loop.clone(), thread::current().id()))
            .unwrap();
        event_loop.run();
    });
    let (event_loop, loop_thread_id) = ready_rx.recv().unwrap();

    let order: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
    assert!(!event_loop.is_in_loop_thread());

    for i in 0..32 {
        let order = order.clone();
        event_loop.queue_in_loop(move || {
            assert_eq!(thread::current().id(), loop_thread_id);
            order.lock().unwrap().push(i);
        });
    }
    // a task scheduling through run_in_loop on its own loop runs inline,
    // before anything queued after it
    let order_inline = order.clone();
    let inner_loop = event_loop.clone();
    event_loop.queue_in_loop(move || {
        let order = order_inline.clone();
        inner_loop.run_in_loop(move || order.lock().unwrap().push(100));
        order_inline.lock().unwrap().push(101);
    });

    wait_until(Duration::from_secs(5), || order.lock().unwrap().len() == 34);
    let order = order.lock().unwrap();
    assert_eq!(*order, (0..32).chain([100, 101]).collect::<Vec<_>>());

    event_loop.quit();
    loop_thread.join().unwrap();
}

#[test]
fn dropping_the_server_destroys_connections_on_their_subloops() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let downs = disconnects.clone();
    let (ready_tx, ready_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let base_loop = EventLoop::new();
        let server = TcpServer::new(
            &base_loop,
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            "teardown",
            ServerOption::NoReusePort,
        );
        server.set_thread_num(2);
        server.set_connection_callback(move |conn| {
            if conn.disconnected() {
                downs.fetch_add(1, Ordering::SeqCst);
            }
        });
        server.start();
        ready_tx
            .send((server.local_addr(), base_loop.clone(), server))
            .unwrap();
        base_loop.run();
    });

    let (addr, base_loop, server) = ready_rx.recv().unwrap();

    let clients: Vec<TcpStream> = (0..2)
        .map(|_| TcpStream::connect(addr).expect("connect"))
        .collect();
    wait_until(Duration::from_secs(5), || server.connection_count() == 2);

    // drop on the base loop: every connection gets its teardown posted to
    // its subloop before the pool joins the workers
    base_loop.run_in_loop(move || drop(server));
    wait_until(Duration::from_secs(5), || {
        disconnects.load(Ordering::SeqCst) == 2
    });

    // the peers observe the closes
    for mut client in clients {
        let mut sink = Vec::new();
        let _ = client.read_to_end(&mut sink);
    }

    base_loop.quit();
    server_thread.join().unwrap();
}
