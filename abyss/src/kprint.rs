//! Log sink that may be used while a trap is being serviced.
//!
//! The sink implements [`log::Log`], so the rest of the workspace logs with
//! the ordinary `log` macros. A record is formatted into a fixed-capacity
//! buffer on the stack and written to the standard error with a single raw
//! `write(2)`. Nothing is allocated and no lock is taken, which keeps logging
//! legal inside the fault handler. Lines longer than the buffer are
//! truncated.

use crate::syscall;
use arrayvec::ArrayString;
use core::fmt::{self, Write};
use log::{Level, LevelFilter, Log, Metadata, Record};

const LINE_CAPACITY: usize = 512;

/// The console log sink.
pub struct Console;

static CONSOLE: Console = Console;

/// A line buffer that keeps the last byte free for the newline.
struct Line(ArrayString<LINE_CAPACITY>);

impl Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - 1 - self.0.len();
        if s.len() <= room {
            self.0.push_str(s);
        } else {
            let mut cut = room;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            self.0.push_str(&s[..cut]);
        }
        Ok(())
    }
}

fn tag(level: Level) -> &'static str {
    match level {
        Level::Error => "[ERROR]",
        Level::Warn => "[WARN]",
        Level::Info => "[INFO]",
        Level::Debug => "[DEBUG]",
        Level::Trace => "[TRACE]",
    }
}

impl Log for Console {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = Line(ArrayString::new());
        let _ = write!(&mut line, "{} {}", tag(record.level()), record.args());
        line.0.push('\n');
        let _ = syscall::write_all(libc::STDERR_FILENO, line.0.as_bytes());
    }

    fn flush(&self) {}
}

/// Installs the console as the global logger and sets the maximum level.
///
/// Only the first call installs the sink; later calls just change the level.
pub fn init(level: LevelFilter) {
    let _ = log::set_logger(&CONSOLE);
    log::set_max_level(level);
}
