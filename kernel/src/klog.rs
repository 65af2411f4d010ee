//! `log::Log` implementor wired to [`crate::console`].
//!
//! Every `log::info!`/`warn!`/`error!` call in this crate (mirroring the
//! teacher's pervasive use of the `log` facade across `arch/x86_64`) ends up
//! here, formatted and handed to whatever console sink is currently
//! registered. Before one registers, [`console::write_bytes`] already falls
//! back to the serial port, so records are never silently dropped in
//! practice even though that is the documented worst case.

use core::fmt::Write;

use log::{Level, LevelFilter, Log, Metadata, Record};

use crate::console;
use crate::sync::SpinLock;

struct KernelLogger;

static LOGGER: KernelLogger = KernelLogger;

/// Scratch buffer a single log call formats into before handing the bytes
/// to the console; avoids an allocation per record.
struct LineBuffer {
    buf: [u8; 256],
    len: usize,
}

impl LineBuffer {
    const fn new() -> Self {
        Self { buf: [0; 256], len: 0 }
    }
}

impl Write for LineBuffer {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let bytes = s.as_bytes();
        let remaining = self.buf.len() - self.len;
        let n = bytes.len().min(remaining);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        Ok(())
    }
}

static LINE: SpinLock<LineBuffer> = SpinLock::new(LineBuffer::new());

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = LINE.lock();
        line.len = 0;
        let _ = write!(line, "[{} {}] {}\n", level_tag(record.level()), record.target(), record.args());
        console::write_bytes(&line.buf[..line.len]);
    }

    fn flush(&self) {}
}

/// Installs the kernel logger as the global `log` backend and sets the
/// reporting threshold. Must run at most once; later calls are no-ops
/// (matching `log::set_logger`'s own one-shot contract).
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_truncates_rather_than_overflows() {
        let mut line = LineBuffer::new();
        let long = "x".repeat(300);
        let _ = line.write_str(&long);
        assert_eq!(line.len, line.buf.len());
    }
}
