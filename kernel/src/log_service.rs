//! Kernel logging backend
//!
//! Installs a [`log::Log`] implementation that writes `[LEVEL tag] message`
//! lines to the serial console. Verbosity is a runtime atomic so the boot
//! command line (`boot.debug=on` / `bootdebug=on`) can raise it before any
//! subsystem starts logging.

use core::sync::atomic::{AtomicU8, Ordering};

use log::{Level, LevelFilter, Metadata, Record};

/// Current maximum level, stored as the `LevelFilter` discriminant.
static MAX_LEVEL: AtomicU8 = AtomicU8::new(LevelFilter::Info as u8);

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        (metadata.level() as u8) <= MAX_LEVEL.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let tag = record.target().rsplit("::").next().unwrap_or("kernel");
        crate::println!("[{} {}] {}", level_str(record.level()), tag, record.args());
    }

    fn flush(&self) {}
}

fn level_str(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN ",
        Level::Info => "INFO ",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Install the serial logger. Safe to call more than once; only the first
/// call wins (the host test harness may have its own logger).
pub fn init() {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Trace);
}

/// Raise or lower the runtime verbosity.
pub fn set_verbose(debug: bool) {
    let level = if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Whether debug-level logging is currently enabled.
pub fn verbose() -> bool {
    MAX_LEVEL.load(Ordering::Relaxed) >= LevelFilter::Debug as u8
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_toggle() {
        set_verbose(false);
        assert!(!verbose());
        set_verbose(true);
        assert!(verbose());
        set_verbose(false);
    }
}
