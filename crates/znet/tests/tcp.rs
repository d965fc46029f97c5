//! End-to-end socket scenarios over loopback.

use std::io::Read;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::RngCore;

use znet::addr::{self, Family, Hints};
use znet::reactor::AsyncLoop;
use znet::storage::DataFrame;
use znet::tcp::{
    ChildConfig, Options, ReadState, Server, ServerEvent, ServerHandler, ServerOptions,
    Settings, Socket, SocketEvent, SocketHandler,
};

fn wait_for(pred: impl Fn() -> bool, ms: u64) -> bool {
    let deadline = std::time::Instant::now() + Duration::from_millis(ms);
    while std::time::Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    pred()
}

fn resolved(port: u16) -> Vec<addr::AddrInfo> {
    addr::lookup(
        Some("127.0.0.1"),
        Some(&port.to_string()),
        &Hints {
            family: Family::V4,
            numeric_host: true,
            ..Default::default()
        },
    )
    .unwrap()
}

fn loopback_server(
    lp: &Arc<AsyncLoop>,
    handler: Arc<dyn ServerHandler>,
) -> (Arc<Server>, u16) {
    let server = Server::listen(
        ServerOptions {
            event_loop: lp.clone(),
            addrs: None,
            hostname: Some("127.0.0.1".into()),
            port: Some(0),
            family: Family::V4,
            backlog: 256,
        },
        handler,
    )
    .unwrap();
    let port = server.local_port().unwrap();
    (server, port)
}

/// Server whose children echo everything back.
struct EchoServer;

impl ServerHandler for EchoServer {
    fn on_open(&self, _server: &Arc<Server>, child: &mut ChildConfig) -> bool {
        child.handler = Some(Arc::new(EchoChild));
        true
    }

    fn on_event(&self, _server: &Arc<Server>, _event: ServerEvent) {}
}

struct EchoChild;

impl SocketHandler for EchoChild {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Data => {
                let mut buf = [0u8; 16384];
                loop {
                    let (n, state) = socket.read(&mut buf);
                    if n > 0 {
                        let _ = socket.send(DataFrame::bytes(buf[..n].to_vec()).free_on_err());
                    }
                    match state {
                        ReadState::Filled => continue,
                        _ => break,
                    }
                }
            }
            SocketEvent::ReadClose => socket.close(),
            SocketEvent::Close { .. } => socket.free(),
            _ => {}
        }
    }
}

/// Client that sends a payload on open and accumulates the echo.
struct EchoClient {
    payload: Vec<u8>,
    expect: usize,
    received: Mutex<Vec<u8>>,
    freed: AtomicUsize,
}

impl SocketHandler for EchoClient {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Open => {
                socket
                    .send(DataFrame::bytes(self.payload.clone()))
                    .expect("send on open");
            }
            SocketEvent::Data => {
                let mut buf = [0u8; 16384];
                loop {
                    let (n, state) = socket.read(&mut buf);
                    let total = {
                        let mut received = self.received.lock();
                        received.extend_from_slice(&buf[..n]);
                        received.len()
                    };
                    if total >= self.expect {
                        socket.close();
                        break;
                    }
                    match state {
                        ReadState::Filled => continue,
                        _ => break,
                    }
                }
            }
            SocketEvent::ReadClose => socket.close(),
            SocketEvent::Close { .. } => socket.free(),
            SocketEvent::Free => {
                self.freed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

#[test]
fn echo_round_trip_4k() {
    let lp = AsyncLoop::new().unwrap();
    lp.start().unwrap();
    let (_server, port) = loopback_server(&lp, Arc::new(EchoServer));

    let mut payload = vec![0u8; 4096];
    rand::thread_rng().fill_bytes(&mut payload);

    let client = Arc::new(EchoClient {
        payload: payload.clone(),
        expect: payload.len(),
        received: Mutex::new(Vec::new()),
        freed: AtomicUsize::new(0),
    });
    let _sock = Socket::connect(
        Options {
            event_loop: lp.clone(),
            addrs: Some(resolved(port)),
            hostname: None,
            port: None,
            family: Family::V4,
            settings: Settings::default(),
        },
        client.clone(),
    )
    .unwrap();

    assert!(wait_for(|| client.freed.load(Ordering::SeqCst) == 1, 5000));
    assert_eq!(client.received.lock().as_slice(), payload.as_slice());
}

#[test]
fn single_byte_round_trip() {
    let lp = AsyncLoop::new().unwrap();
    lp.start().unwrap();
    let (_server, port) = loopback_server(&lp, Arc::new(EchoServer));

    let client = Arc::new(EchoClient {
        payload: vec![0x5a],
        expect: 1,
        received: Mutex::new(Vec::new()),
        freed: AtomicUsize::new(0),
    });
    let _sock = Socket::connect(
        Options {
            event_loop: lp.clone(),
            addrs: Some(resolved(port)),
            hostname: None,
            port: None,
            family: Family::V4,
            settings: Settings::default(),
        },
        client.clone(),
    )
    .unwrap();

    assert!(wait_for(|| client.freed.load(Ordering::SeqCst) == 1, 5000));
    assert_eq!(client.received.lock().as_slice(), &[0x5a]);
}

/// Tracks lifecycle only; data transfer driven from the main thread.
struct Tracker {
    closed: AtomicUsize,
    freed: AtomicUsize,
}

impl Tracker {
    fn new() -> Arc<Tracker> {
        Arc::new(Tracker {
            closed: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
        })
    }
}

impl SocketHandler for Tracker {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Close { .. } => {
                self.closed.fetch_add(1, Ordering::SeqCst);
                socket.free();
            }
            SocketEvent::Free => {
                self.freed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

#[test]
fn graceful_close_flushes_queue() {
    let lp = AsyncLoop::new().unwrap();
    lp.start().unwrap();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).unwrap();
        received.len()
    });

    let tracker = Tracker::new();
    let sock = Socket::connect(
        Options {
            event_loop: lp.clone(),
            addrs: Some(resolved(port)),
            hostname: None,
            port: None,
            family: Family::V4,
            settings: Settings::default(),
        },
        tracker.clone(),
    )
    .unwrap();

    const TOTAL: usize = 128 * 1024;
    sock.send(DataFrame::bytes(vec![0xabu8; TOTAL])).unwrap();
    sock.close();

    assert_eq!(peer.join().unwrap(), TOTAL);
    assert!(wait_for(|| tracker.freed.load(Ordering::SeqCst) == 1, 5000));
    assert_eq!(tracker.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn abortive_close_drops_queue() {
    let lp = AsyncLoop::new().unwrap();
    lp.start().unwrap();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        let mut received = Vec::new();
        let _ = conn.read_to_end(&mut received);
        received.len()
    });

    let tracker = Tracker::new();
    let sock = Socket::connect(
        Options {
            event_loop: lp.clone(),
            addrs: Some(resolved(port)),
            hostname: None,
            port: None,
            family: Family::V4,
            settings: Settings::default(),
        },
        tracker.clone(),
    )
    .unwrap();

    const TOTAL: usize = 8 * 1024 * 1024;
    let _ = sock.send(DataFrame::bytes(vec![0xcdu8; TOTAL]));
    sock.terminate();
    assert_eq!(sock.queued_bytes(), 0);

    let peer_got = peer.join().unwrap();
    assert!(
        peer_got < TOTAL,
        "abortive close delivered the whole payload ({} bytes)",
        peer_got
    );
    assert!(wait_for(|| tracker.freed.load(Ordering::SeqCst) == 1, 5000));
}

#[test]
fn file_frame_delivers_slice() {
    let lp = AsyncLoop::new().unwrap();
    lp.start().unwrap();

    // Anonymous in-memory file with a recognizable pattern.
    let raw = unsafe { libc::memfd_create(b"znet-e2e\0".as_ptr() as *const libc::c_char, 0) };
    assert!(raw >= 0);
    let content: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    {
        use std::io::Write;
        use std::os::fd::FromRawFd;
        let mut file = unsafe { std::fs::File::from_raw_fd(raw) };
        file.write_all(&content).unwrap();
        std::mem::forget(file); // fd ownership passes to the frame
    }

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        conn.read_to_end(&mut received).unwrap();
        received
    });

    let tracker = Tracker::new();
    let sock = Socket::connect(
        Options {
            event_loop: lp.clone(),
            addrs: Some(resolved(port)),
            hostname: None,
            port: None,
            family: Family::V4,
            settings: Settings::default(),
        },
        tracker.clone(),
    )
    .unwrap();

    let (offset, end) = (1000u64, 50000u64);
    sock.send(DataFrame::file(raw, offset, end)).unwrap();
    sock.close();

    let received = peer.join().unwrap();
    assert_eq!(received.len() as u64, end - offset);
    assert_eq!(received.as_slice(), &content[offset as usize..end as usize]);
    assert!(wait_for(|| tracker.freed.load(Ordering::SeqCst) == 1, 5000));
}

/// Server child that counts bytes for the mass-connection scenario.
struct CountingServer {
    total: Arc<AtomicUsize>,
}

impl ServerHandler for CountingServer {
    fn on_open(&self, _server: &Arc<Server>, child: &mut ChildConfig) -> bool {
        child.handler = Some(Arc::new(CountingChild {
            total: self.total.clone(),
        }));
        child.settings = Settings {
            auto_close_on_read_close: true,
            ..Default::default()
        };
        true
    }

    fn on_event(&self, _server: &Arc<Server>, _event: ServerEvent) {}
}

struct CountingChild {
    total: Arc<AtomicUsize>,
}

impl SocketHandler for CountingChild {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Data => {
                let mut buf = [0u8; 4096];
                loop {
                    let (n, state) = socket.read(&mut buf);
                    self.total.fetch_add(n, Ordering::SeqCst);
                    match state {
                        ReadState::Filled => continue,
                        _ => break,
                    }
                }
            }
            SocketEvent::Close { .. } => socket.free(),
            _ => {}
        }
    }
}

/// Client that writes 16 bytes on open and closes.
struct BurstClient {
    freed: Arc<AtomicUsize>,
}

impl SocketHandler for BurstClient {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Open => {
                let _ = socket.send(DataFrame::bytes(vec![0x42u8; 16]).free_on_err());
                socket.close();
            }
            SocketEvent::ReadClose => socket.close(),
            SocketEvent::Close { .. } => socket.free(),
            SocketEvent::Free => {
                self.freed.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
    }
}

#[test]
fn mass_connections() {
    const CLIENTS: usize = 200;

    let lp = AsyncLoop::new().unwrap();
    lp.start().unwrap();

    let total = Arc::new(AtomicUsize::new(0));
    let (_server, port) = loopback_server(
        &lp,
        Arc::new(CountingServer {
            total: total.clone(),
        }),
    );

    let freed = Arc::new(AtomicUsize::new(0));
    let addrs = resolved(port);
    let mut sockets = Vec::with_capacity(CLIENTS);
    for _ in 0..CLIENTS {
        let sock = Socket::connect(
            Options {
                event_loop: lp.clone(),
                addrs: Some(addrs.clone()),
                hostname: None,
                port: None,
                family: Family::V4,
                settings: Settings::default(),
            },
            Arc::new(BurstClient {
                freed: freed.clone(),
            }),
        )
        .unwrap();
        sockets.push(sock);
    }

    assert!(
        wait_for(|| total.load(Ordering::SeqCst) == CLIENTS * 16, 20_000),
        "server observed {} of {} bytes",
        total.load(Ordering::SeqCst),
        CLIENTS * 16
    );
    assert!(
        wait_for(|| freed.load(Ordering::SeqCst) == CLIENTS, 20_000),
        "only {} of {} clients freed",
        freed.load(Ordering::SeqCst),
        CLIENTS
    );
}
