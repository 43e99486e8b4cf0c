//! # Kestrel Hardware Abstraction Layer
//!
//! The narrow architecture contract the interrupt subsystem is built on.
//!
//! ## Components
//!
//! - **Local interrupt control**: mask, unmask and query interrupts on the
//!   calling CPU, identify the calling CPU
//! - **Interrupt lines**: enable/disable individual lines and install the
//!   low-level trap stubs for a vector
//! - **Namespace layouts**: how each architecture carves up its interrupt
//!   number space (exceptions, IPIs, per-CPU, shared, MSI)
//!
//! Bare-metal builds (`target_os = "none"`) get a native backend for
//! x86_64, aarch64 and riscv64. Every other build gets the
//! [`arch::hosted::Hosted`] backend, which models the same state in software.
//! The `std` feature lets that backend keep interrupt masking per host
//! thread.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

pub mod arch;
pub mod interrupts;

pub use arch::layout::{IrqLayout, IrqRange};
pub use interrupts::{
    ArchInterrupts, InterruptLines, LineError, LocalInterrupts, LocalIrqGuard, LowLevelHandler,
};

/// Logical CPU identifier
pub type CpuId = u32;

/// Maximum number of CPUs the kernel supports
pub const MAX_CPUS: usize = 256;
