//! aarch64 backend: `DAIF.I` masking and MPIDR affinity identification.
//!
//! Lines are owned by the GIC, so the line operations report
//! [`LineError::Unsupported`].

use core::arch::asm;

use crate::interrupts::{
    ArchInterrupts, InterruptLines, LineError, LocalInterrupts, LowLevelHandler,
};
use crate::CpuId;

/// DAIF IRQ mask bit
const DAIF_I: u64 = 1 << 7;

/// Native aarch64 backend
#[derive(Debug)]
pub struct Aarch64;

static BACKEND: Aarch64 = Aarch64;

pub(super) fn backend() -> &'static dyn ArchInterrupts {
    &BACKEND
}

fn read_daif() -> u64 {
    let value: u64;
    unsafe {
        asm!("mrs {}, DAIF", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

impl LocalInterrupts for Aarch64 {
    unsafe fn enable(&self) {
        unsafe {
            asm!("msr DAIFClr, #2", options(nomem, nostack, preserves_flags));
        }
    }

    fn disable(&self) {
        unsafe {
            asm!("msr DAIFSet, #2", options(nomem, nostack, preserves_flags));
        }
    }

    fn are_enabled(&self) -> bool {
        read_daif() & DAIF_I == 0
    }

    fn current_cpu(&self) -> CpuId {
        let mpidr: u64;
        unsafe {
            asm!("mrs {}, MPIDR_EL1", out(reg) mpidr, options(nomem, nostack, preserves_flags));
        }
        (mpidr & 0xFF) as CpuId
    }
}

impl InterruptLines for Aarch64 {
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

impl ArchInterrupts for Aarch64 {
    fn name(&self) -> &'static str {
        "aarch64"
    }
}
