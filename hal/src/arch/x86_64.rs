//! x86_64 backend: `RFLAGS.IF` masking and local APIC identification.
//!
//! Lines are routed by the I/O APIC and MSI controllers, so the line
//! operations report [`LineError::Unsupported`].

use crate::interrupts::{
    ArchInterrupts, InterruptLines, LineError, LocalInterrupts, LowLevelHandler,
};
use crate::CpuId;

/// RFLAGS interrupt enable bit
const RFLAGS_IF: u64 = 1 << 9;

/// Native x86_64 backend
#[derive(Debug)]
pub struct X86_64;

static BACKEND: X86_64 = X86_64;

pub(super) fn backend() -> &'static dyn ArchInterrupts {
    &BACKEND
}

fn read_rflags() -> u64 {
    let flags: u64;
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {0}",
            out(reg) flags,
            options(nomem, preserves_flags),
        );
    }
    flags
}

impl LocalInterrupts for X86_64 {
    unsafe fn enable(&self) {
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
        }
    }

    fn disable(&self) {
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
        }
    }

    fn are_enabled(&self) -> bool {
        read_rflags() & RFLAGS_IF != 0
    }

    fn current_cpu(&self) -> CpuId {
        // Initial APIC ID lives in CPUID.01H:EBX[31:24]
        #[allow(unused_unsafe)]
        let leaf = unsafe { core::arch::x86_64::__cpuid(1) };
        leaf.ebx >> 24
    }

    fn save_and_disable(&self) -> bool {
        let flags: u64;
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {0}",
                "cli",
                out(reg) flags,
                options(nomem, preserves_flags),
            );
        }
        flags & RFLAGS_IF != 0
    }
}

impl InterruptLines for X86_64 {
    fn enable_line(&self, _line: u32) -> Result<(), LineError> {
        Err(LineError::Unsupported)
    }

    fn disable_line(&self, _line: u32) -> Result<(), LineError> {
        Err(LineError::Unsupported)
    }

    fn install_low_level_handler(
        &self,
        _line: u32,
        _handler: LowLevelHandler,
        _state: usize,
    ) -> Result<(), LineError> {
        Err(LineError::Unsupported)
    }

    fn uninstall_low_level_handler(&self, _line: u32) -> Result<(), LineError> {
        Err(LineError::Unsupported)
    }
}

impl ArchInterrupts for X86_64 {
    fn name(&self) -> &'static str {
        "x86_64"
    }
}
