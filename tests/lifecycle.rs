//! Endpoint and connection lifecycle: idempotent closes, exactly-once
//! cleanup, teardown while traffic is in flight.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tcp_reactor::{Connection, ConnectionHandler, Endpoint, Reactor, SetupError};

/// Records lifecycle callbacks and keeps handles to accepted connections.
#[derive(Default)]
struct Recorder {
    opened: AtomicUsize,
    closed: AtomicUsize,
    conns: Mutex<Vec<Arc<Connection>>>,
}

impl Recorder {
    fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn conn(&self, index: usize) -> Option<Arc<Connection>> {
        self.conns.lock().unwrap().get(index).cloned()
    }
}

/// Echo handler that reports into a shared [`Recorder`].
struct Tracking(Arc<Recorder>);

impl ConnectionHandler for Tracking {
    fn on_open(&self, conn: &Arc<Connection>) {
        self.0.opened.fetch_add(1, Ordering::SeqCst);
        self.0.conns.lock().unwrap().push(Arc::clone(conn));
    }

    fn on_message(&self, conn: &Arc<Connection>) {
        while let Some(message) = conn.read_delimited(b"\r\n") {
            conn.enqueue(message);
        }
    }

    fn on_close(&self, _conn: &Arc<Connection>) {
        self.0.closed.fetch_add(1, Ordering::SeqCst);
    }
}

fn connect(port: u16) -> Option<TcpStream> {
    TcpStream::connect(("127.0.0.1", port)).ok()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

#[test]
fn test_invalid_port_rejected() {
    let reactor = Reactor::new().unwrap();
    let result = Endpoint::create(&reactor, 0, Tracking(Arc::default()));
    assert!(matches!(result, Err(SetupError::InvalidPort(0))));
}

#[test]
fn test_bind_conflict_surfaces() {
    let reactor = Reactor::new().unwrap();
    let _first = match Endpoint::create(&reactor, 21881, Tracking(Arc::default())) {
        Ok(endpoint) => endpoint,
        Err(_) => return, // port in use, skip
    };

    let second = Endpoint::create(&reactor, 21881, Tracking(Arc::default()));
    assert!(matches!(second, Err(SetupError::Bind { port: 21881, .. })));
}

#[test]
fn test_cleanup_fires_exactly_once_on_peer_close() {
    let recorder = Arc::new(Recorder::default());
    let reactor = Reactor::new().unwrap();
    let _endpoint = match Endpoint::create(&reactor, 21882, Tracking(Arc::clone(&recorder))) {
        Ok(endpoint) => endpoint,
        Err(_) => return,
    };

    let client = match connect(21882) {
        Some(client) => client,
        None => return,
    };
    assert!(wait_until(Duration::from_secs(3), || recorder.opened() == 1));

    drop(client);
    assert!(wait_until(Duration::from_secs(3), || recorder.closed() == 1));

    // No late duplicate.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(recorder.closed(), 1);
}

#[test]
fn test_connection_close_is_idempotent() {
    let recorder = Arc::new(Recorder::default());
    let reactor = Reactor::new().unwrap();
    let _endpoint = match Endpoint::create(&reactor, 21883, Tracking(Arc::clone(&recorder))) {
        Ok(endpoint) => endpoint,
        Err(_) => return,
    };

    let _client = match connect(21883) {
        Some(client) => client,
        None => return,
    };
    assert!(wait_until(Duration::from_secs(3), || recorder.opened() == 1));

    let conn = recorder.conn(0).unwrap();
    conn.close();
    conn.close();
    assert!(!conn.is_connected());

    assert!(wait_until(Duration::from_secs(3), || recorder.closed() == 1));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(recorder.closed(), 1);
}

#[test]
fn test_reads_return_none_after_close() {
    let recorder = Arc::new(Recorder::default());
    let reactor = Reactor::new().unwrap();
    let _endpoint = match Endpoint::create(&reactor, 21884, Tracking(Arc::clone(&recorder))) {
        Ok(endpoint) => endpoint,
        Err(_) => return,
    };

    let mut client = match connect(21884) {
        Some(client) => client,
        None => return,
    };
    client.write_all(b"pending\r\n").unwrap();
    assert!(wait_until(Duration::from_secs(3), || recorder.opened() == 1));

    let conn = recorder.conn(0).unwrap();
    conn.close();

    assert!(conn.read_delimited(b"\r\n").is_none());
    assert!(conn.read_bytes(1).is_none());
    // Enqueue after close is a silent drop, not a panic.
    conn.enqueue(b"ignored");
}

#[test]
fn test_endpoint_close_idempotent_and_refuses_new_connects() {
    let recorder = Arc::new(Recorder::default());
    let reactor = Reactor::new().unwrap();
    let endpoint = match Endpoint::create(&reactor, 21885, Tracking(Arc::clone(&recorder))) {
        Ok(endpoint) => endpoint,
        Err(_) => return,
    };

    let _client = match connect(21885) {
        Some(client) => client,
        None => return,
    };
    assert!(wait_until(Duration::from_secs(3), || recorder.opened() == 1));

    endpoint.close();
    endpoint.close();
    assert!(!endpoint.is_open());

    assert!(wait_until(Duration::from_secs(3), || recorder.closed() == 1));
    assert!(connect(21885).is_none());
}

#[test]
fn test_teardown_during_traffic() {
    const CLIENTS: usize = 20;

    let recorder = Arc::new(Recorder::default());
    let reactor = Reactor::new().unwrap();
    let endpoint = match Endpoint::create(&reactor, 21886, Tracking(Arc::clone(&recorder))) {
        Ok(endpoint) => endpoint,
        Err(_) => return,
    };

    let mut clients = Vec::new();
    for _ in 0..CLIENTS {
        match connect(21886) {
            Some(mut client) => {
                let _ = client.write_all(b"traffic\r\n");
                clients.push(client);
            }
            None => return,
        }
    }
    assert!(wait_until(Duration::from_secs(5), || {
        recorder.opened() == CLIENTS
    }));

    endpoint.close();

    // Every connection's cleanup runs exactly once, promptly.
    assert!(wait_until(Duration::from_secs(2), || {
        recorder.closed() == CLIENTS
    }));
    thread::sleep(Duration::from_millis(300));
    assert_eq!(recorder.closed(), CLIENTS);

    // The reactor itself keeps serving other endpoints.
    let other = Arc::new(Recorder::default());
    let _second = match Endpoint::create(&reactor, 21887, Tracking(Arc::clone(&other))) {
        Ok(endpoint) => endpoint,
        Err(_) => return,
    };
    let mut client = match connect(21887) {
        Some(client) => client,
        None => return,
    };
    client.write_all(b"still here\r\n").unwrap();
    client
        .set_read_timeout(Some(Duration::from_millis(50)))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut received = Vec::new();
    let mut chunk = [0u8; 64];
    while received.len() < 10 && Instant::now() < deadline {
        match client.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&chunk[..n]),
            Err(_) => {}
        }
    }
    assert_eq!(received, b"still here");
}

#[test]
fn test_reactor_drop_runs_cleanup() {
    let recorder = Arc::new(Recorder::default());
    let reactor = Reactor::new().unwrap();
    let _endpoint = match Endpoint::create(&reactor, 21888, Tracking(Arc::clone(&recorder))) {
        Ok(endpoint) => endpoint,
        Err(_) => return,
    };

    let _client = match connect(21888) {
        Some(client) => client,
        None => return,
    };
    assert!(wait_until(Duration::from_secs(3), || recorder.opened() == 1));

    // Dropping the reactor joins both threads; the shutdown drain runs
    // every remaining cleanup before the join completes.
    drop(reactor);
    assert_eq!(recorder.closed(), 1);
}
