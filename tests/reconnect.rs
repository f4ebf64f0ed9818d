mod common;

use std::{
    io::Write,
    net::{SocketAddr, TcpListener, TcpStream},
    sync::{Arc, Barrier, Mutex},
    thread,
    time::{Duration, Instant},
};

use common::MockServer;
use iproto::{Client, ClientConfig, ClientError, Credentials, connection::Supervisor};

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Accepts connections and never answers a request. Sockets stay open until the test ends.
fn silent_server(send_greeting: bool) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    let held: Arc<Mutex<Vec<TcpStream>>> = Arc::default();
    thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            if send_greeting {
                let _ = stream.write_all(&common::greeting());
            }
            held.lock().unwrap().push(stream);
        }
    });
    address
}

fn timed<T>(f: impl FnOnce() -> T) -> (T, Duration) {
    let started = Instant::now();
    let out = f();
    (out, started.elapsed())
}

#[test]
fn concurrent_connects_share_one_handshake() {
    let server = MockServer::start();
    let supervisor = Supervisor::new(server.config()).unwrap();
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let supervisor = Arc::clone(&supervisor);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                supervisor.ensure_connected().map(|_| ())
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(supervisor.sessions_opened(), 1);
    assert_eq!(server.connections(), 1);
}

#[test]
fn missed_ping_drops_session_and_next_request_reconnects() {
    let server = MockServer::start();
    let config = ClientConfig {
        ping_interval: Some(Duration::from_millis(100)),
        ping_timeout: Duration::from_millis(100),
        ..server.config()
    };
    let client = Client::new(config).unwrap();
    client.ping().unwrap();
    assert_eq!(client.failed_pings(), 0);

    server.set_ignore_pings(true);
    assert!(wait_until(Duration::from_secs(3), || client.failed_pings() >= 1));
    assert!(wait_until(Duration::from_secs(1), || !client.is_connected()));
    server.set_ignore_pings(false);

    // The timer never reconnects on its own.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(server.connections(), 1);

    let echoed: Vec<u64> = client.call("echo", &(5u64,)).unwrap();
    assert_eq!(echoed, vec![5]);
    assert_eq!(client.failed_pings(), 1);
    assert_eq!(client.supervisor().sessions_opened(), 2);
    assert_eq!(server.connections(), 2);
}

#[test]
fn server_restart_fails_pending_and_recovers() {
    let server = MockServer::start();
    let client = Arc::new(Client::new(server.config()).unwrap());
    client.ping().unwrap();

    let waiting = {
        let client = Arc::clone(&client);
        thread::spawn(move || client.call::<_, Vec<u64>>("sleep", &(5_000u64, 1u64)))
    };
    thread::sleep(Duration::from_millis(100));
    server.drop_connections();

    let err = waiting.join().unwrap().unwrap_err();
    assert!(matches!(err, ClientError::NotConnected), "{err}");
    assert!(wait_until(Duration::from_secs(1), || !client.is_connected()));

    client.ping().unwrap();
    assert_eq!(client.supervisor().sessions_opened(), 2);
}

#[test]
fn authenticates_with_scramble() {
    let server = MockServer::with_user("writer", "s3cret");
    let config: ClientConfig = format!("writer:s3cret@{}", server.uri()).parse().unwrap();
    let client = Client::new(config).unwrap();

    let echoed: Vec<String> = client.call("echo", &("hi",)).unwrap();
    assert_eq!(echoed, vec!["hi".to_string()]);
}

#[test]
fn wrong_password_is_a_server_error() {
    let server = MockServer::with_user("writer", "s3cret");
    let config = ClientConfig {
        credentials: Some(Credentials {
            user: "writer".into(),
            password: "guess".into(),
        }),
        ..server.config()
    };
    let client = Client::new(config).unwrap();

    match client.ping().unwrap_err() {
        ClientError::Server { message, .. } => assert!(message.contains("Incorrect password")),
        other => panic!("unexpected error {other}"),
    }
    assert!(!client.is_connected());
}

#[test]
fn unreachable_endpoint_reports_io_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(address.to_string().parse().unwrap()).unwrap();
    assert!(matches!(client.ping().unwrap_err(), ClientError::Io(_)));
}

#[test]
fn unanswered_auth_fails_the_caller_and_releases_the_gate() {
    let address = silent_server(true);
    let config = ClientConfig {
        request_timeout: Some(Duration::from_millis(200)),
        connect_timeout: Duration::from_millis(300),
        ..format!("user:pw@{address}").parse().unwrap()
    };
    let client = Client::new(config).unwrap();

    for attempt in 0..3 {
        let (result, elapsed) = timed(|| client.ping());
        assert!(
            matches!(result, Err(ClientError::Timeout { .. })),
            "attempt {attempt}: {result:?}"
        );
        assert!(elapsed < Duration::from_secs(2), "attempt {attempt} took {elapsed:?}");
        assert!(!client.is_connected());
    }
    assert_eq!(client.supervisor().sessions_opened(), 0);
}

#[test]
fn missing_greeting_fails_the_caller_in_time() {
    let address = silent_server(false);
    let config = ClientConfig {
        connect_timeout: Duration::from_millis(200),
        ..address.to_string().parse().unwrap()
    };
    let client = Client::new(config).unwrap();

    for attempt in 0..2 {
        let (result, elapsed) = timed(|| client.ping());
        assert!(
            matches!(&result, Err(ClientError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut),
            "attempt {attempt}: {result:?}"
        );
        assert!(elapsed < Duration::from_secs(2), "attempt {attempt} took {elapsed:?}");
    }
}
