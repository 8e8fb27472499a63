//! Runs the full accept/echo/teardown path with the array-scan poller
//! selected through the environment switch. Lives in its own test binary so
//! the process-wide variable cannot leak into the epoll-backed tests.

use std::{
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddr, TcpStream},
    sync::{Arc, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use riptide::{ConnState, EventLoop, ServerOption, TcpServer, USE_POLL_ENV};

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn echo_under_the_array_scan_poller() {
    unsafe { std::env::set_var(USE_POLL_ENV, "1") };

    let states: Arc<Mutex<Vec<ConnState>>> = Arc::new(Mutex::new(Vec::new()));
    let recorded = states.clone();
    let (ready_tx, ready_rx) = mpsc::channel();

    let server_thread = thread::spawn(move || {
        let base_loop = EventLoop::new();
        let server = TcpServer::new(
            &base_loop,
            SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            "pollecho",
            ServerOption::NoReusePort,
        );
        server.set_thread_num(1);
        server.set_connection_callback(move |conn| {
            recorded.lock().unwrap().push(conn.state());
        });
        server.set_message_callback(|conn, buffer, _when| {
            let message = buffer.retrieve_all_as_string();
            conn.send(message);
            conn.shutdown();
        });
        server.start();
        ready_tx.send((server.local_addr(), base_loop.clone())).unwrap();
        base_loop.run();
    });

    let (addr, base_loop) = ready_rx.recv().unwrap();

    for round in 0..3 {
        let mut client = TcpStream::connect(addr).expect("connect");
        let payload = format!("ping #{round}");
        client.write_all(payload.as_bytes()).expect("send");
        let mut echoed = Vec::new();
        client.read_to_end(&mut echoed).expect("read echo");
        assert_eq!(echoed, payload.as_bytes());
        drop(client);
        // serialize the rounds so slot reuse in the pollfd array is actually
        // exercised one connection at a time
        wait_until(Duration::from_secs(5), || {
            states.lock().unwrap().len() == 2 * (round + 1)
        });
    }

    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnState::Connected,
            ConnState::Disconnected,
            ConnState::Connected,
            ConnState::Disconnected,
            ConnState::Connected,
            ConnState::Disconnected,
        ]
    );

    base_loop.quit();
    server_thread.join().unwrap();
}
