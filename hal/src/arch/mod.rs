//! # Architecture Backends
//!
//! One [`ArchInterrupts`] implementation per supported target, plus the
//! software-modelled [`hosted::Hosted`] backend used off bare metal.

use crate::interrupts::ArchInterrupts;
use crate::IrqLayout;

pub mod hosted;
pub mod layout;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "none", not(feature = "hosted"), target_arch = "x86_64"))] {
        mod x86_64;
        use self::x86_64 as native;
    } else if #[cfg(all(target_os = "none", not(feature = "hosted"), target_arch = "aarch64"))] {
        mod aarch64;
        use self::aarch64 as native;
    } else if #[cfg(all(target_os = "none", not(feature = "hosted"), target_arch = "riscv64"))] {
        mod riscv64;
        use self::riscv64 as native;
    } else {
        use self::hosted as native;
    }
}

/// The backend selected for this build
pub fn backend() -> &'static dyn ArchInterrupts {
    native::backend()
}

/// Interrupt namespace layout of the build target
pub fn layout() -> &'static IrqLayout {
    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            &layout::AARCH64_GICV2
        } else if #[cfg(target_arch = "riscv64")] {
            &layout::RISCV64_PLIC
        } else {
            &layout::X86_64
        }
    }
}
