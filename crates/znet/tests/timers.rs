//! Timer service scenarios, including cross-component reentry.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use znet::clock;
use znet::timers::Timers;

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

#[test]
fn reschedule_from_other_timer_callback() {
    // T1 at +10ms drags T2 (originally +500ms) to +1ms; T2 must fire
    // long before its original deadline.
    let timers = Arc::new(Timers::new());
    timers.start().unwrap();

    let fired_at = Arc::new(AtomicU64::new(0));
    let f = fired_at.clone();
    let t2 = timers
        .add_timeout(clock::after_ns(clock::ms_to_ns(500)), move || {
            f.store(clock::now_ns(), Ordering::SeqCst);
        })
        .unwrap();

    let start = clock::now_ns();
    let timers2 = timers.clone();
    timers
        .add_timeout(clock::after_ns(clock::ms_to_ns(10)), move || {
            let mut open = timers2.open(t2).expect("t2 pending");
            open.set_deadline(clock::after_ns(clock::ms_to_ns(1)));
        })
        .unwrap();

    assert!(wait_for(|| fired_at.load(Ordering::SeqCst) != 0, 2000));
    let elapsed_ms = (fired_at.load(Ordering::SeqCst) - start) / 1_000_000;
    assert!(
        elapsed_ms < 100,
        "rescheduled timer fired after {}ms",
        elapsed_ms
    );
}

#[test]
fn cancel_fire_race_never_does_both() {
    for _ in 0..50 {
        let timers = Timers::new();
        timers.start().unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let t = timers
            .add_timeout(clock::after_ns(clock::ms_to_ns(1)), move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(1));
        let cancelled = timers.cancel(t).is_ok();
        std::thread::sleep(Duration::from_millis(15));

        let count = fired.load(Ordering::SeqCst);
        assert!(
            (cancelled && count == 0) || (!cancelled && count == 1),
            "cancelled={} fired={}",
            cancelled,
            count
        );
        timers.stop_sync();
    }
}

#[test]
fn timer_callback_closes_a_socket() {
    use parking_lot::Mutex;
    use znet::addr::{self, Family, Hints};
    use znet::reactor::AsyncLoop;
    use znet::tcp::{Options, Settings, Socket, SocketEvent, SocketHandler};

    struct Quiet {
        freed: AtomicUsize,
        reason: Mutex<Option<Option<nix::errno::Errno>>>,
    }

    impl SocketHandler for Quiet {
        fn on_event(&self, socket: &Arc<Socket>, event: SocketEvent) {
            match event {
                SocketEvent::Close { err } => {
                    *self.reason.lock() = Some(err);
                    socket.free();
                }
                SocketEvent::Free => {
                    self.freed.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    }

    let lp = AsyncLoop::new().unwrap();
    lp.start().unwrap();
    let timers = Timers::new();
    timers.start().unwrap();

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let _peer = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = Vec::new();
        use std::io::Read;
        let _ = conn.read_to_end(&mut buf);
    });

    let addrs = addr::lookup(
        Some("127.0.0.1"),
        Some(&port.to_string()),
        &Hints {
            family: Family::V4,
            numeric_host: true,
            ..Default::default()
        },
    )
    .unwrap();

    let handler = Arc::new(Quiet {
        freed: AtomicUsize::new(0),
        reason: Mutex::new(None),
    });
    let sock = Socket::connect(
        Options {
            event_loop: lp.clone(),
            addrs: Some(addrs),
            hostname: None,
            port: None,
            family: Family::V4,
            settings: Settings::default(),
        },
        handler.clone(),
    )
    .unwrap();

    // A connection idle timeout, fired from the timer worker.
    let victim = sock.clone();
    timers
        .add_timeout(clock::after_ns(clock::ms_to_ns(20)), move || {
            victim.close();
        })
        .unwrap();

    assert!(wait_for(|| handler.freed.load(Ordering::SeqCst) == 1, 5000));
    assert_eq!(handler.reason.lock().take(), Some(None));
}
