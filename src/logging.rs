//! Logging facility
//!
//! Routes `log` records to a caller-supplied sink. The engine itself only
//! uses the `log` macros, so embedders that already install a logger can
//! skip [`init`] entirely.

use core::fmt;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

/// Destination for formatted log lines
pub type LogSink = fn(fmt::Arguments);

/// Global logger instance
pub static LOGGER: Logger = Logger::new();

/// Thread-safe logger implementation
pub struct Logger {
    sink: Mutex<Option<LogSink>>,
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl Logger {
    /// Creates a logger with no sink; records are dropped until one is set
    pub const fn new() -> Logger {
        Logger {
            sink: Mutex::new(None),
        }
    }

    pub fn set_sink(&self, sink: LogSink) {
        *self.sink.lock() = Some(sink);
    }
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    /// Formats messages as "[LEVEL] message"
    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let sink = self.sink.lock();
            if let Some(sink) = *sink {
                sink(format_args!("[{}] {}", record.level(), record.args()));
            }
        }
    }

    fn flush(&self) {}
}

/// Installs [`LOGGER`] as the global logger, writing to `sink`
///
/// Debug builds log at `Debug`, release builds at `Info`.
pub fn init(sink: LogSink) -> Result<(), SetLoggerError> {
    LOGGER.set_sink(sink);
    log::set_logger(&LOGGER).map(|()| {
        log::set_max_level(
            #[cfg(debug_assertions)]
            LevelFilter::Debug,
            #[cfg(not(debug_assertions))]
            LevelFilter::Info,
        )
    })
}

struct RateState {
    seen: u32,
    printed: u32,
    missed: u32,
}

/// Lets through `burst` reports out of every `interval`
///
/// Windows are counted in reports rather than time, which needs no clock.
pub struct RateLimit {
    burst: u32,
    interval: u32,
    state: Mutex<RateState>,
}

impl RateLimit {
    pub const fn new(burst: u32, interval: u32) -> Self {
        Self {
            burst,
            interval,
            state: Mutex::new(RateState {
                seen: 0,
                printed: 0,
                missed: 0,
            }),
        }
    }

    /// Returns true if this report may be emitted
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        if state.seen >= self.interval {
            if state.missed > 0 {
                log::warn!("FATX-fs: {} error reports suppressed", state.missed);
            }
            state.seen = 0;
            state.printed = 0;
            state.missed = 0;
        }

        state.seen += 1;
        if state.printed < self.burst {
            state.printed += 1;
            true
        } else {
            state.missed += 1;
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;
    use alloc::vec::Vec;

    static CAPTURED: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn capture(args: fmt::Arguments) {
        CAPTURED.lock().push(alloc::format!("{}", args));
    }

    #[test]
    fn test_logger_formats_level() {
        // Other tests may have installed the logger already
        let _ = init(capture);
        LOGGER.set_sink(capture);
        log::error!("disk on fire {}", 42);

        let lines = CAPTURED.lock();
        assert!(lines.iter().any(|line| line == "[ERROR] disk on fire 42"));
    }

    #[test]
    fn test_ratelimit_burst_then_suppress() {
        let limit = RateLimit::new(3, 10);
        let allowed: Vec<bool> = (0..10).map(|_| limit.allow()).collect();
        assert_eq!(allowed.iter().filter(|&&a| a).count(), 3);
        assert!(allowed[..3].iter().all(|&a| a));

        // a new window opens after `interval` reports
        assert!(limit.allow());
    }
}
