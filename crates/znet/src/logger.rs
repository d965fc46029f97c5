//! Env-driven logger backend
//!
//! A small `log::Log` implementation for the binaries and tests.
//!
//! - `ZNET_LOG=<level>` — 0=off, 1=error, 2=warn, 3=info, 4=debug,
//!   5=trace (default: warn)
//! - `ZNET_LOG_FLUSH=1` — flush stderr after each record

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{Level, LevelFilter, Log, Metadata, Record};

struct EnvLogger {
    flush: AtomicBool,
}

static LOGGER: EnvLogger = EnvLogger {
    flush: AtomicBool::new(false),
};

impl Log for EnvLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let prefix = match record.level() {
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN] ",
            Level::Info => "[INFO] ",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "{} [{}] {}", prefix, record.target(), record.args());
        if self.flush.load(Ordering::Relaxed) {
            let _ = err.flush();
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().lock().flush();
    }
}

fn level_from_env() -> LevelFilter {
    match std::env::var("ZNET_LOG").ok().and_then(|v| v.parse::<u8>().ok()) {
        Some(0) => LevelFilter::Off,
        Some(1) => LevelFilter::Error,
        Some(2) => LevelFilter::Warn,
        Some(3) => LevelFilter::Info,
        Some(4) => LevelFilter::Debug,
        Some(_) => LevelFilter::Trace,
        None => LevelFilter::Warn,
    }
}

/// Install the logger. Safe to call more than once; later calls keep
/// the first installation.
pub fn init() {
    LOGGER.flush.store(
        std::env::var("ZNET_LOG_FLUSH").map(|v| v == "1").unwrap_or(false),
        Ordering::Relaxed,
    );
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level_from_env());
    }
}
