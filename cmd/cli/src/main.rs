//! znet CLI
//!
//! Methods: `help`, `version`, `time-bench`. Options take their value
//! as the next argument, no `=` notation: `znet time-bench num 1000 fast`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use znet::clock;
use znet::timers::Timers;

const HELP: &str = "\
Usage: znet METHOD [OPTIONS]

core
   Methods
\th ? help        Display this message
\tv version       Get the CLI's version
   Options
\tf force         Run even when the input looks ridiculous

time
   Methods
\ttime-bench      Benchmark the timer service
   Options
\tn num           Number of timers to use
\tfast            Skip the OS-thread comparison pass

You cannot use the \"=\" notation to provide arguments. Instead, provide
any arguments right after the option that requires them, with a space in
between. Example usage: znet time-bench num 1000 fast
";

#[derive(Default)]
struct CliOptions {
    num: Option<usize>,
    fast: bool,
    force: bool,
}

enum Method {
    Version,
    TimeBench,
}

fn print_time(ns: u64) -> String {
    if ns < 1_000 {
        format!("{}ns", ns)
    } else if ns < 1_000_000 {
        format!("{:.1}us", ns as f64 / 1_000.0)
    } else if ns < 1_000_000_000 {
        format!("{:.1}ms", ns as f64 / 1_000_000.0)
    } else {
        format!("{:.1}sec", ns as f64 / 1_000_000_000.0)
    }
}

fn main() {
    znet::logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        print!("{}", HELP);
        return;
    }

    let mut method = None;
    let mut options = CliOptions::default();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "h" | "?" | "help" => {
                print!("{}", HELP);
                return;
            }
            "v" | "version" => {
                method = Some(Method::Version);
            }
            "time-bench" => {
                method = Some(Method::TimeBench);
            }
            "n" | "num" => {
                i += 1;
                let value = match args.get(i).and_then(|v| v.parse().ok()) {
                    Some(value) => value,
                    None => {
                        println!("Missing or invalid argument for option \"num\".");
                        return;
                    }
                };
                options.num = Some(value);
            }
            "fast" => options.fast = true,
            "f" | "force" => options.force = true,
            other => {
                println!("Unknown option \"{}\". Try \"help\".", other);
                return;
            }
        }
        i += 1;
    }

    match method {
        None => print!("{}", HELP),
        Some(Method::Version) => println!("znet {}", env!("CARGO_PKG_VERSION")),
        Some(Method::TimeBench) => time_bench(&options),
    }
}

fn time_bench(options: &CliOptions) {
    const DEFAULT_NUM: usize = 2000;
    let num = options.num.unwrap_or(DEFAULT_NUM);

    println!(
        "time-bench\nnum : {}{}\nfast: {}\n",
        num,
        if options.num.is_none() { " (the default)" } else { "" },
        options.fast as u32,
    );

    if num == 0 || (num > 65536 && !options.force) {
        println!(
            "A timer count of {} looks ridiculous. Rerun with \"force\" if you mean it.",
            num
        );
        return;
    }

    if !options.fast {
        // Comparison pass: one OS thread per timer, capped to keep the
        // scheduler honest.
        let threads = num.min(256);
        let fired = Arc::new(AtomicUsize::new(0));
        let start = Instant::now();
        let deadline = start + Duration::from_millis(50);
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let fired = fired.clone();
                std::thread::spawn(move || {
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
        let late = start.elapsed().saturating_sub(Duration::from_millis(50));
        println!(
            "os threads   : {} sleepers, worst-case tail {}",
            threads,
            print_time(late.as_nanos() as u64),
        );
    }

    // The real subject: one worker, `num` heap entries.
    let timers = Timers::new();
    timers.start().expect("timer worker");

    let fired = Arc::new(AtomicUsize::new(0));
    let deadline = clock::after_ns(clock::ms_to_ns(50));

    let insert_start = Instant::now();
    for _ in 0..num {
        let fired = fired.clone();
        timers
            .add_timeout(deadline, move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .expect("add_timeout");
    }
    let insert_elapsed = insert_start.elapsed();

    while fired.load(Ordering::SeqCst) < num {
        std::thread::sleep(Duration::from_micros(200));
    }
    let drained_at = clock::now_ns();

    println!(
        "znet timers  : inserted {} in {} ({}/timer)",
        num,
        print_time(insert_elapsed.as_nanos() as u64),
        print_time(insert_elapsed.as_nanos() as u64 / num as u64),
    );
    println!(
        "znet timers  : all fired {} after the shared deadline",
        print_time(drained_at.saturating_sub(deadline)),
    );

    timers.stop_sync();
}
