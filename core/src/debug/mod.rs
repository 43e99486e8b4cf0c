//! # Kernel Debugging
//!
//! Early console output and the `log` backend that writes to it.

pub mod console;

pub use console::{init_logger, set_console, ConsoleLogger, ConsoleWriter};
