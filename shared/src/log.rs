//! Log sinks for the `log` facade.
//!
//! The kernel installs one of these as the global logger during early boot.
//! Sinks lock internally, which matters for the one consumer with unusual
//! needs: the panic handler, which must detect a logger that panicked while
//! holding its own lock and fall back to a raw writer.

use core::fmt::Write;

use log::{Level, Log, Metadata, Record};
use spin::Mutex;

/// Extra introspection on top of [`Log`].
pub trait LogExt {
    /// Whether the sink's lock is currently held. A panic handler checks
    /// this before logging through a sink that may be mid-write.
    fn is_locked(&self) -> bool;
}

/// Formats records onto any `core::fmt::Write` target, one line each.
pub struct LogSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> LogSink<W> {
    pub fn new(writer: W) -> LogSink<W> {
        LogSink {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> Log for LogSink<W> {
    fn enabled(&self, _: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut writer = self.writer.lock();
        let _ = writeln!(
            &mut writer,
            "[{}] {}: {}",
            level_tag(record.level()),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

impl<W: Write + Send> LogExt for LogSink<W> {
    fn is_locked(&self) -> bool {
        self.writer.is_locked()
    }
}

/// Duplicates every record to two sinks, in order.
pub struct LogTee<A, B>(pub A, pub B);

impl<A: Log, B: Log> Log for LogTee<A, B> {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.0.enabled(metadata) || self.1.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.0.log(record);
        self.1.log(record);
    }

    fn flush(&self) {
        self.0.flush();
        self.1.flush();
    }
}

impl<A: LogExt, B: LogExt> LogExt for LogTee<A, B> {
    fn is_locked(&self) -> bool {
        self.0.is_locked() || self.1.is_locked()
    }
}

fn level_tag(level: Level) -> &'static str {
    match level {
        Level::Error => "ERROR",
        Level::Warn => " WARN",
        Level::Info => " INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Writes to the emulator debug port (0xe9).
#[cfg(target_arch = "x86_64")]
pub struct DebugPortWriter {
    _not_send_sync_guard: core::marker::PhantomData<*mut u8>,
}

#[cfg(target_arch = "x86_64")]
unsafe impl Send for DebugPortWriter {}

#[cfg(target_arch = "x86_64")]
impl DebugPortWriter {
    /// # Safety
    ///
    /// Port 0xe9 must be safe to write, which it is under an emulator with
    /// the debug console enabled.
    pub unsafe fn new() -> DebugPortWriter {
        DebugPortWriter {
            _not_send_sync_guard: core::marker::PhantomData,
        }
    }
}

#[cfg(target_arch = "x86_64")]
impl Write for DebugPortWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let mut port = x86_64::instructions::port::PortWriteOnly::new(0xe9);
        for byte in s.bytes() {
            unsafe {
                port.write(byte);
            }
        }
        Ok(())
    }
}
