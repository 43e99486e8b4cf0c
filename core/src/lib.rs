//! # Kestrel Kernel Core
//!
//! Architecture-independent interrupt resource management.
//!
//! ## Components
//!
//! - **Radix store**: lock-free-read sparse index for huge interrupt spaces
//! - **Descriptor table**: per-interrupt metadata, dense or sparse backed
//! - **Controller devices**: trait-based interrupt controller drivers and
//!   their registry with CPU bindings
//! - **Dispatch glue**: trap entry to descriptor to handler to EOI
//! - **Range reservation**: contiguous MSI block reservation
//! - **Debug console**: early console and `log` backend
//!
//! Built on [`kestrel_hal`], which supplies the per-architecture masking and
//! line primitives.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod debug;
pub mod interrupts;

pub use interrupts::{Irq, IrqConfig, IrqError, IrqResult, IrqSubsystem, NULL_IRQ};

/// Kernel version information
pub const KERNEL_VERSION: KernelVersion = KernelVersion {
    major: 0,
    minor: 1,
    patch: 0,
    suffix: "alpha",
};

/// Kernel version structure
#[derive(Debug, Clone, Copy)]
pub struct KernelVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Patch version
    pub patch: u16,
    /// Version suffix (e.g., "alpha", "beta", "rc1")
    pub suffix: &'static str,
}

impl core::fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.suffix.is_empty() {
            write!(f, "-{}", self.suffix)?;
        }
        Ok(())
    }
}
