//! # Debug Console
//!
//! Kernel debug console, and the `log` backend that formats records onto it.
//! Until a console is installed, output is discarded.

use core::fmt::{self, Write};

use spin::Mutex;

/// Console writer trait
pub trait ConsoleWriter: Send {
    /// Write a byte to the console
    fn write_byte(&mut self, byte: u8);

    /// Write a string to the console
    fn write_str(&mut self, s: &str) {
        for byte in s.bytes() {
            self.write_byte(byte);
        }
    }

    /// Flush the console
    fn flush(&mut self) {}
}

/// Global console writer
static CONSOLE: Mutex<Option<&'static mut dyn ConsoleWriter>> = Mutex::new(None);

/// Set the console writer, returning the previous one
pub fn set_console(
    writer: &'static mut dyn ConsoleWriter,
) -> Option<&'static mut dyn ConsoleWriter> {
    CONSOLE.lock().replace(writer)
}

/// Print to the console
pub fn print(args: fmt::Arguments<'_>) {
    if let Some(console) = CONSOLE.lock().as_mut() {
        let _ = write_to_console(*console, args);
    }
}

/// Helper to write formatted output to a console
fn write_to_console(console: &mut dyn ConsoleWriter, args: fmt::Arguments<'_>) -> fmt::Result {
    struct ConsoleWriteAdapter<'a>(&'a mut dyn ConsoleWriter);

    impl Write for ConsoleWriteAdapter<'_> {
        fn write_str(&mut self, s: &str) -> fmt::Result {
            ConsoleWriter::write_str(self.0, s);
            Ok(())
        }
    }

    ConsoleWriteAdapter(console).write_fmt(args)
}

/// Print macro
#[macro_export]
macro_rules! kprint {
    ($($arg:tt)*) => {
        $crate::debug::console::print(format_args!($($arg)*))
    };
}

/// Print line macro
#[macro_export]
macro_rules! kprintln {
    () => {
        $crate::kprint!("\n")
    };
    ($($arg:tt)*) => {
        $crate::kprint!("{}\n", format_args!($($arg)*))
    };
}

// ============================================================================
// Logger
// ============================================================================

/// `log` backend writing `[LEVEL] target: message` lines to the console
#[derive(Debug)]
pub struct ConsoleLogger;

static LOGGER: ConsoleLogger = ConsoleLogger;

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record<'_>) {
        if self.enabled(record.metadata()) {
            crate::kprintln!("[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {
        if let Some(console) = CONSOLE.lock().as_mut() {
            console.flush();
        }
    }
}

/// Install the console logger and set the maximum level
///
/// Safe to call more than once: later calls only adjust the level. Returns
/// `true` if this call installed the logger.
pub fn init_logger(level: log::LevelFilter) -> bool {
    let installed = log::set_logger(&LOGGER).is_ok();
    log::set_max_level(level);
    installed
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::string::String;

    static CAPTURED: Mutex<String> = Mutex::new(String::new());

    struct Capture;

    impl ConsoleWriter for Capture {
        fn write_byte(&mut self, byte: u8) {
            CAPTURED.lock().push(byte as char);
        }
    }

    #[test]
    fn test_logger_writes_to_console() {
        set_console(Box::leak(Box::new(Capture)));
        init_logger(log::LevelFilter::Debug);
        assert!(!init_logger(log::LevelFilter::Debug));

        crate::kprintln!("console {}", 42);
        log::info!(target: "kestrel::test", "hello {}", "log");
        log::trace!(target: "kestrel::test", "filtered");

        let captured = CAPTURED.lock();
        assert!(captured.contains("console 42\n"));
        assert!(captured.contains("[INFO] kestrel::test: hello log\n"));
        assert!(!captured.contains("filtered"));
    }
}
