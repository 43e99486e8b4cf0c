//! riscv64 backend: `sstatus.SIE` masking, hart id kept in `tp`.
//!
//! External lines belong to the PLIC, so the line operations report
//! [`LineError::Unsupported`].

use core::arch::asm;

use crate::interrupts::{
    ArchInterrupts, InterruptLines, LineError, LocalInterrupts, LowLevelHandler,
};
use crate::CpuId;

/// sstatus supervisor interrupt enable bit
const SSTATUS_SIE: usize = 1 << 1;

/// Native riscv64 backend
#[derive(Debug)]
pub struct Riscv64;

static BACKEND: Riscv64 = Riscv64;

pub(super) fn backend() -> &'static dyn ArchInterrupts {
    &BACKEND
}

impl LocalInterrupts for Riscv64 {
    unsafe fn enable(&self) {
        unsafe {
            asm!("csrsi sstatus, 2", options(nomem, nostack));
        }
    }

    fn disable(&self) {
        unsafe {
            asm!("csrci sstatus, 2", options(nomem, nostack));
        }
    }

    fn are_enabled(&self) -> bool {
        let value: usize;
        unsafe {
            asm!("csrr {}, sstatus", out(reg) value, options(nomem, nostack, preserves_flags));
        }
        value & SSTATUS_SIE != 0
    }

    fn current_cpu(&self) -> CpuId {
        // Boot code parks the hart id in tp before entering the kernel
        let tp: usize;
        unsafe {
            asm!("mv {}, tp", out(reg) tp, options(nomem, nostack, preserves_flags));
        }
        tp as CpuId
    }

    fn save_and_disable(&self) -> bool {
        let previous: usize;
        unsafe {
            asm!(
                "csrrc {}, sstatus, {}",
                out(reg) previous,
                in(reg) SSTATUS_SIE,
                options(nomem, nostack),
            );
        }
        previous & SSTATUS_SIE != 0
    }
}

impl InterruptLines for Riscv64 {
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

impl ArchInterrupts for Riscv64 {
    fn name(&self) -> &'static str {
        "riscv64"
    }
}
