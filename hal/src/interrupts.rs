//! # Interrupt Primitive Contract
//!
//! Architecture-specific instruction sequences live behind these traits.
//! The kernel core never issues `cli`/`msr DAIFSet`/`csrc sstatus` itself;
//! it calls through an [`ArchInterrupts`] implementation chosen at boot.

use core::fmt;

use crate::CpuId;

// ============================================================================
// Local Interrupt Control
// ============================================================================

/// Interrupt masking on the calling CPU
pub trait LocalInterrupts: Sync {
    /// Enable interrupts on the calling CPU
    ///
    /// # Safety
    ///
    /// Interrupt handlers may run as soon as this returns. The caller must not
    /// hold references to data an interrupt handler may also touch.
    unsafe fn enable(&self);

    /// Disable interrupts on the calling CPU
    fn disable(&self);

    /// Check whether interrupts are enabled on the calling CPU
    fn are_enabled(&self) -> bool;

    /// Identifier of the calling CPU
    fn current_cpu(&self) -> CpuId;

    /// Disable interrupts and return whether they were previously enabled
    #[inline]
    fn save_and_disable(&self) -> bool {
        let was_enabled = self.are_enabled();
        self.disable();
        was_enabled
    }

    /// Re-enable interrupts if they were enabled before [`save_and_disable`]
    ///
    /// # Safety
    ///
    /// Same as [`LocalInterrupts::enable`].
    ///
    /// [`save_and_disable`]: LocalInterrupts::save_and_disable
    #[inline]
    unsafe fn restore(&self, was_enabled: bool) {
        if was_enabled {
            // SAFETY: forwarded from the caller
            unsafe { self.enable() };
        }
    }
}

/// Interrupt guard - disables local interrupts for the duration of its lifetime
pub struct LocalIrqGuard<'a, L: LocalInterrupts + ?Sized = dyn LocalInterrupts> {
    local: &'a L,
    was_enabled: bool,
}

impl<'a, L: LocalInterrupts + ?Sized> LocalIrqGuard<'a, L> {
    /// Create a new guard (disables interrupts on the calling CPU)
    pub fn new(local: &'a L) -> Self {
        Self {
            was_enabled: local.save_and_disable(),
            local,
        }
    }

    /// Whether interrupts were enabled when the guard was taken
    pub fn was_enabled(&self) -> bool {
        self.was_enabled
    }
}

impl<L: LocalInterrupts + ?Sized> Drop for LocalIrqGuard<'_, L> {
    fn drop(&mut self) {
        // SAFETY: we only restore the state that was live when the guard was created
        unsafe { self.local.restore(self.was_enabled) };
    }
}

impl<L: LocalInterrupts + ?Sized> fmt::Debug for LocalIrqGuard<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIrqGuard")
            .field("was_enabled", &self.was_enabled)
            .finish()
    }
}

// ============================================================================
// Interrupt Lines
// ============================================================================

/// Low-level trap stub installed for a vector
///
/// Receives the raw vector and the opaque state registered with it. Returns
/// `true` when the interrupt was handled.
pub type LowLevelHandler = fn(vector: u32, state: usize) -> bool;

/// Errors reported by line operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    /// The line number is outside what the architecture supports
    InvalidLine,
    /// A low-level handler is already installed for this line
    Occupied,
    /// No low-level handler is installed for this line
    Vacant,
    /// The backend does not route lines itself (a controller does)
    Unsupported,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLine => f.write_str("invalid interrupt line"),
            Self::Occupied => f.write_str("low-level handler already installed"),
            Self::Vacant => f.write_str("no low-level handler installed"),
            Self::Unsupported => f.write_str("line operation not supported by this backend"),
        }
    }
}

/// Per-line operations provided by the architecture layer
pub trait InterruptLines: Sync {
    /// Unmask a line at the architecture level
    fn enable_line(&self, line: u32) -> Result<(), LineError>;

    /// Mask a line at the architecture level
    fn disable_line(&self, line: u32) -> Result<(), LineError>;

    /// Install the low-level trap stub for a line
    fn install_low_level_handler(
        &self,
        line: u32,
        handler: LowLevelHandler,
        state: usize,
    ) -> Result<(), LineError>;

    /// Remove the low-level trap stub for a line
    fn uninstall_low_level_handler(&self, line: u32) -> Result<(), LineError>;
}

/// Complete architecture contract consumed by the interrupt subsystem
pub trait ArchInterrupts: LocalInterrupts + InterruptLines {
    /// Short architecture name for diagnostics
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::Hosted;

    #[test]
    fn test_guard_restores_enabled_state() {
        let hosted = Hosted::new();
        unsafe { hosted.enable() };

        {
            let guard = LocalIrqGuard::new(&hosted);
            assert!(guard.was_enabled());
            assert!(!hosted.are_enabled());
        }

        assert!(hosted.are_enabled());
    }

    #[test]
    fn test_guard_through_arch_object() {
        let hosted = Hosted::new();
        unsafe { hosted.enable() };
        let arch: &dyn ArchInterrupts = &hosted;

        {
            let _guard = LocalIrqGuard::new(arch);
            assert!(!arch.are_enabled());
        }

        assert!(arch.are_enabled());
    }

    #[test]
    fn test_guard_keeps_disabled_state() {
        let hosted = Hosted::new();
        hosted.disable();

        {
            let _outer = LocalIrqGuard::new(&hosted);
            let inner = LocalIrqGuard::new(&hosted);
            assert!(!inner.was_enabled());
        }

        assert!(!hosted.are_enabled());
    }
}
