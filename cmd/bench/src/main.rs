//! TCP benchmark
//!
//! Two modes over loopback:
//!
//! - `bandwidth` — ping-pong echo throughput: N clients bounce a fixed
//!   message off M echo servers for a fixed duration
//! - `stress` — connection churn: batches of short-lived connections,
//!   each sending 16 bytes and closing
//!
//! Options are space-separated, no `=` notation:
//!
//! ```text
//! znet-bench bandwidth [clients N] [servers N] [size BYTES] [time MS]
//!                      [port P] [shared-loop] [cpus N]
//! znet-bench stress    [clients N] [time MS] [port P] [cpus N]
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use znet::addr::{self, Family, Hints};
use znet::reactor::AsyncLoop;
use znet::storage::DataFrame;
use znet::tcp::{
    ChildConfig, Options, ReadState, Server, ServerEvent, ServerHandler, ServerOptions,
    Settings, Socket, SocketEvent, SocketHandler,
};

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Bandwidth,
    Stress,
}

struct BenchOptions {
    mode: Mode,
    clients: usize,
    servers: usize,
    size: usize,
    time_ms: u64,
    port: u16,
    shared_loop: bool,
    cpus: Option<usize>,
}

impl Default for BenchOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Bandwidth,
            clients: 8,
            servers: 1,
            size: 4096,
            time_ms: 3000,
            port: 0,
            shared_loop: false,
            cpus: None,
        }
    }
}

fn parse_args() -> Option<BenchOptions> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut options = BenchOptions::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "bandwidth" => options.mode = Mode::Bandwidth,
            "stress" => options.mode = Mode::Stress,
            "shared-loop" => options.shared_loop = true,
            "clients" | "servers" | "size" | "time" | "port" | "cpus" => {
                let name = args[i].clone();
                i += 1;
                let value: u64 = match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(value) => value,
                    None => {
                        println!("Missing or invalid argument for option \"{}\".", name);
                        return None;
                    }
                };
                match name.as_str() {
                    "clients" => options.clients = value as usize,
                    "servers" => options.servers = value as usize,
                    "size" => options.size = value as usize,
                    "time" => options.time_ms = value,
                    "port" => options.port = value as u16,
                    "cpus" => options.cpus = Some(value as usize),
                    _ => unreachable!(),
                }
            }
            other => {
                println!("Unknown option \"{}\".", other);
                return None;
            }
        }
        i += 1;
    }
    if options.clients == 0 || options.servers == 0 || options.size == 0 {
        println!("clients, servers and size must be non-zero");
        return None;
    }
    Some(options)
}

/// Restrict the whole process to the first `n` cores. Threads spawned
/// afterwards inherit the mask.
fn restrict_cpus(n: usize) {
    let cores = core_affinity::get_core_ids().unwrap_or_default();
    if cores.is_empty() || n == 0 {
        return;
    }
    let n = n.min(cores.len());
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        for core in &cores[..n] {
            libc::CPU_SET(core.id, &mut set);
        }
        libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
    }
    println!("restricted to {} core(s)", n);
}

struct EchoServer;

impl ServerHandler for EchoServer {
    fn on_open(&self, _server: &Arc<Server>, child: &mut ChildConfig) -> bool {
        child.handler = Some(Arc::new(EchoChild));
        child.settings = Settings {
            auto_close_on_read_close: true,
            ..Default::default()
        };
        true
    }

    fn on_event(&self, _server: &Arc<Server>, _event: ServerEvent) {}
}

struct EchoChild;

impl SocketHandler for EchoChild {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Data => {
                let mut buf = [0u8; 65536];
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
            SocketEvent::Close { .. } => socket.free(),
            _ => {}
        }
    }
}

/// Ping-pong client: resend the message every time a full echo lands.
struct PingPong {
    size: usize,
    pending: Mutex<usize>,
    bytes: Arc<AtomicUsize>,
    round_trips: Arc<AtomicUsize>,
}

impl SocketHandler for PingPong {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Open => {
                *self.pending.lock() = self.size;
                let _ = socket.send(DataFrame::bytes(vec![0u8; self.size]).free_on_err());
            }
            SocketEvent::Data => {
                let mut buf = [0u8; 65536];
                loop {
                    let (n, state) = socket.read(&mut buf);
                    if n > 0 {
                        self.bytes.fetch_add(n, Ordering::Relaxed);
                        let mut pending = self.pending.lock();
                        if n >= *pending {
                            *pending = self.size;
                            self.round_trips.fetch_add(1, Ordering::Relaxed);
                            drop(pending);
                            let _ = socket
                                .send(DataFrame::bytes(vec![0u8; self.size]).free_on_err());
                        } else {
                            *pending -= n;
                        }
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
    .expect("loopback lookup")
}

fn new_loop() -> Arc<AsyncLoop> {
    let lp = AsyncLoop::new().expect("event loop");
    lp.start().expect("loop thread");
    lp
}

fn run_bandwidth(options: &BenchOptions) {
    println!(
        "bandwidth: {} client(s), {} server(s), {} byte messages, {} ms{}",
        options.clients,
        options.servers,
        options.size,
        options.time_ms,
        if options.shared_loop { ", shared loop" } else { "" },
    );

    let shared = options.shared_loop.then(new_loop);
    let mut server_loops = Vec::new();
    let mut ports = Vec::new();
    let mut servers = Vec::new();
    for i in 0..options.servers {
        let lp = shared.clone().unwrap_or_else(new_loop);
        let server = Server::listen(
            ServerOptions {
                event_loop: lp.clone(),
                addrs: None,
                hostname: Some("127.0.0.1".into()),
                port: Some(if options.port == 0 {
                    0
                } else {
                    options.port + i as u16
                }),
                family: Family::V4,
                backlog: 1024,
            },
            Arc::new(EchoServer),
        )
        .expect("server");
        ports.push(server.local_port().expect("local port"));
        servers.push(server);
        server_loops.push(lp);
    }

    let bytes = Arc::new(AtomicUsize::new(0));
    let round_trips = Arc::new(AtomicUsize::new(0));
    let client_loop = shared.clone().unwrap_or_else(new_loop);

    let mut sockets = Vec::new();
    for i in 0..options.clients {
        let port = ports[i % ports.len()];
        let sock = Socket::connect(
            Options {
                event_loop: client_loop.clone(),
                addrs: Some(resolved(port)),
                hostname: None,
                port: None,
                family: Family::V4,
                settings: Settings::default(),
            },
            Arc::new(PingPong {
                size: options.size,
                pending: Mutex::new(options.size),
                bytes: bytes.clone(),
                round_trips: round_trips.clone(),
            }),
        )
        .expect("client");
        sockets.push(sock);
    }

    let start = Instant::now();
    std::thread::sleep(Duration::from_millis(options.time_ms));
    let elapsed = start.elapsed();

    for sock in &sockets {
        sock.terminate();
    }

    let total = bytes.load(Ordering::Relaxed);
    let trips = round_trips.load(Ordering::Relaxed);
    let secs = elapsed.as_secs_f64();
    println!(
        "echoed {:.1} MiB in {:.2}s: {:.1} MiB/s, {:.0} round-trips/s",
        total as f64 / (1024.0 * 1024.0),
        secs,
        total as f64 / (1024.0 * 1024.0) / secs,
        trips as f64 / secs,
    );
}

/// One short-lived connection: 16 bytes, close, count the free.
struct Churn {
    done: Arc<AtomicUsize>,
}

impl SocketHandler for Churn {
    fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
        match event {
            SocketEvent::Open => {
                let _ = socket.send(DataFrame::bytes(vec![0x42u8; 16]).free_on_err());
                socket.close();
            }
            SocketEvent::ReadClose => socket.close(),
            SocketEvent::Close { .. } => socket.free(),
            SocketEvent::Free => {
                self.done.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }
}

fn run_stress(options: &BenchOptions) {
    println!(
        "stress: {} connection(s) per batch, {} ms",
        options.clients, options.time_ms,
    );

    let lp = new_loop();
    let server = Server::listen(
        ServerOptions {
            event_loop: lp.clone(),
            addrs: None,
            hostname: Some("127.0.0.1".into()),
            port: Some(options.port),
            family: Family::V4,
            backlog: 4096,
        },
        Arc::new(EchoServer),
    )
    .expect("server");
    let addrs = resolved(server.local_port().expect("local port"));

    let start = Instant::now();
    let deadline = start + Duration::from_millis(options.time_ms);
    let mut completed = 0usize;
    while Instant::now() < deadline {
        let done = Arc::new(AtomicUsize::new(0));
        let mut batch = Vec::with_capacity(options.clients);
        for _ in 0..options.clients {
            let sock = Socket::connect(
                Options {
                    event_loop: lp.clone(),
                    addrs: Some(addrs.clone()),
                    hostname: None,
                    port: None,
                    family: Family::V4,
                    settings: Settings::default(),
                },
                Arc::new(Churn { done: done.clone() }),
            )
            .expect("client");
            batch.push(sock);
        }
        let batch_deadline = Instant::now() + Duration::from_secs(10);
        while done.load(Ordering::Relaxed) < options.clients {
            if Instant::now() > batch_deadline {
                println!(
                    "batch stalled: {} of {} completed",
                    done.load(Ordering::Relaxed),
                    options.clients
                );
                break;
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        completed += done.load(Ordering::Relaxed);
    }
    let secs = start.elapsed().as_secs_f64();

    println!(
        "completed {} connections in {:.2}s: {:.0} conns/s",
        completed,
        secs,
        completed as f64 / secs,
    );
}

fn main() {
    znet::logger::init();

    let options = match parse_args() {
        Some(options) => options,
        None => return,
    };
    if let Some(cpus) = options.cpus {
        restrict_cpus(cpus);
    }

    match options.mode {
        Mode::Bandwidth => run_bandwidth(&options),
        Mode::Stress => run_stress(&options),
    }
}
