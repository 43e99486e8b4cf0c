//! # Hosted Backend
//!
//! Software model of the architecture primitives, used whenever the hal is
//! not built for bare metal. The "current CPU" is whatever the owner last
//! set, and low-level handlers sit in a table that [`Hosted::raise`] drives
//! like a trap entry would.
//!
//! Each host thread stands in for one CPU. With the `std` feature the local
//! interrupt flag is kept per thread, so a guard dropped on one thread never
//! unmasks another. Without `std` there is no thread-local storage and the
//! flag is a single atomic shared by every thread.

#[cfg(not(any(test, feature = "std")))]
use core::sync::atomic::AtomicBool;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::interrupts::{
    ArchInterrupts, InterruptLines, LineError, LocalInterrupts, LowLevelHandler,
};
use crate::CpuId;

/// Number of lines the hosted backend models
pub const HOSTED_LINES: usize = 1024;

const LINE_WORDS: usize = HOSTED_LINES / 64;

static BACKEND: Hosted = Hosted::new();

/// The process-wide hosted backend
pub fn instance() -> &'static Hosted {
    &BACKEND
}

/// The process-wide hosted backend as an architecture object
pub fn backend() -> &'static dyn ArchInterrupts {
    &BACKEND
}

/// Software-modelled architecture backend
pub struct Hosted {
    #[cfg(not(any(test, feature = "std")))]
    enabled: AtomicBool,
    cpu: AtomicU32,
    lines: [AtomicU64; LINE_WORDS],
    stubs: Mutex<[Option<(LowLevelHandler, usize)>; HOSTED_LINES]>,
}

impl Hosted {
    /// Create a backend with interrupts disabled on CPU 0
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            #[cfg(not(any(test, feature = "std")))]
            enabled: AtomicBool::new(false),
            cpu: AtomicU32::new(0),
            lines: [ZERO; LINE_WORDS],
            stubs: Mutex::new([None; HOSTED_LINES]),
        }
    }

    /// Set the CPU that [`LocalInterrupts::current_cpu`] reports
    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    /// Check if a line is unmasked
    pub fn line_enabled(&self, line: u32) -> bool {
        match Self::locate(line) {
            Some((word, bit)) => self.lines[word].load(Ordering::Acquire) & bit != 0,
            None => false,
        }
    }

    /// Deliver a line through its low-level stub, as a trap entry would
    ///
    /// Returns `None` when no stub is installed for the line.
    pub fn raise(&self, line: u32) -> Option<bool> {
        let stub = self.stubs.lock().get(line as usize).copied().flatten();
        stub.map(|(handler, state)| handler(line, state))
    }

    #[cfg(any(test, feature = "std"))]
    fn owner(&self) -> usize {
        self as *const Self as usize
    }

    /// Set the calling CPU's interrupt flag, returning the previous one
    fn swap_enabled(&self, enabled: bool) -> bool {
        #[cfg(any(test, feature = "std"))]
        {
            local::swap(self.owner(), enabled)
        }
        #[cfg(not(any(test, feature = "std")))]
        {
            self.enabled.swap(enabled, Ordering::SeqCst)
        }
    }

    fn locate(line: u32) -> Option<(usize, u64)> {
        let line = line as usize;
        if line >= HOSTED_LINES {
            return None;
        }
        Some((line / 64, 1u64 << (line % 64)))
    }
}

impl Default for Hosted {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for Hosted {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Hosted")
            .field("enabled", &self.are_enabled())
            .field("cpu", &self.cpu.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl LocalInterrupts for Hosted {
    unsafe fn enable(&self) {
        self.swap_enabled(true);
    }

    fn disable(&self) {
        self.swap_enabled(false);
    }

    fn are_enabled(&self) -> bool {
        #[cfg(any(test, feature = "std"))]
        {
            local::get(self.owner())
        }
        #[cfg(not(any(test, feature = "std")))]
        {
            self.enabled.load(Ordering::SeqCst)
        }
    }

    fn current_cpu(&self) -> CpuId {
        self.cpu.load(Ordering::Relaxed)
    }

    fn save_and_disable(&self) -> bool {
        self.swap_enabled(false)
    }
}

impl InterruptLines for Hosted {
    fn enable_line(&self, line: u32) -> Result<(), LineError> {
        let (word, bit) = Self::locate(line).ok_or(LineError::InvalidLine)?;
        self.lines[word].fetch_or(bit, Ordering::AcqRel);
        Ok(())
    }

    fn disable_line(&self, line: u32) -> Result<(), LineError> {
        let (word, bit) = Self::locate(line).ok_or(LineError::InvalidLine)?;
        self.lines[word].fetch_and(!bit, Ordering::AcqRel);
        Ok(())
    }

    fn install_low_level_handler(
        &self,
        line: u32,
        handler: LowLevelHandler,
        state: usize,
    ) -> Result<(), LineError> {
        let mut stubs = self.stubs.lock();
        let slot = stubs.get_mut(line as usize).ok_or(LineError::InvalidLine)?;
        if slot.is_some() {
            return Err(LineError::Occupied);
        }
        *slot = Some((handler, state));
        log::trace!("hosted: stub installed on line {}", line);
        Ok(())
    }

    fn uninstall_low_level_handler(&self, line: u32) -> Result<(), LineError> {
        let mut stubs = self.stubs.lock();
        let slot = stubs.get_mut(line as usize).ok_or(LineError::InvalidLine)?;
        slot.take().ok_or(LineError::Vacant)?;
        log::trace!("hosted: stub removed from line {}", line);
        Ok(())
    }
}

impl ArchInterrupts for Hosted {
    fn name(&self) -> &'static str {
        "hosted"
    }
}

#[cfg(any(test, feature = "std"))]
impl Drop for Hosted {
    fn drop(&mut self) {
        // A later backend at the same address starts masked
        local::forget(self.owner());
    }
}

/// Per-thread interrupt flags, keyed by backend address
#[cfg(any(test, feature = "std"))]
mod local {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    std::thread_local! {
        static ENABLED: RefCell<BTreeMap<usize, bool>> = const { RefCell::new(BTreeMap::new()) };
    }

    pub(super) fn get(owner: usize) -> bool {
        ENABLED.with(|flags| flags.borrow().get(&owner).copied().unwrap_or(false))
    }

    pub(super) fn swap(owner: usize, enabled: bool) -> bool {
        ENABLED.with(|flags| flags.borrow_mut().insert(owner, enabled).unwrap_or(false))
    }

    pub(super) fn forget(owner: usize) {
        ENABLED.with(|flags| flags.borrow_mut().remove(&owner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::LocalIrqGuard;
    use std::sync::Barrier;
    use std::thread;

    fn echo(line: u32, state: usize) -> bool {
        line as usize == state
    }

    #[test]
    fn test_line_mask_bits() {
        let hosted = Hosted::new();
        hosted.enable_line(70).unwrap();
        assert!(hosted.line_enabled(70));
        assert!(!hosted.line_enabled(71));
        hosted.disable_line(70).unwrap();
        assert!(!hosted.line_enabled(70));
        assert_eq!(hosted.enable_line(HOSTED_LINES as u32), Err(LineError::InvalidLine));
    }

    #[test]
    fn test_low_level_stub_lifecycle() {
        let hosted = Hosted::new();
        assert_eq!(hosted.raise(33), None);

        hosted.install_low_level_handler(33, echo, 33).unwrap();
        assert_eq!(
            hosted.install_low_level_handler(33, echo, 0),
            Err(LineError::Occupied)
        );
        assert_eq!(hosted.raise(33), Some(true));

        hosted.uninstall_low_level_handler(33).unwrap();
        assert_eq!(hosted.uninstall_low_level_handler(33), Err(LineError::Vacant));
        assert_eq!(hosted.raise(33), None);
    }

    #[test]
    fn test_masking_is_per_thread() {
        let hosted = Hosted::new();
        unsafe { hosted.enable() };
        let barrier = Barrier::new(2);

        thread::scope(|scope| {
            scope.spawn(|| {
                // A fresh thread starts masked
                assert!(!hosted.are_enabled());
                let guard = LocalIrqGuard::new(&hosted);
                barrier.wait();
                barrier.wait();
                // The other thread's enable did not reach us
                assert!(!hosted.are_enabled());
                drop(guard);
            });

            let guard = LocalIrqGuard::new(&hosted);
            drop(guard);
            barrier.wait();
            assert!(hosted.are_enabled());
            barrier.wait();
        });

        assert!(hosted.are_enabled());
    }

    #[test]
    fn test_save_and_disable() {
        let hosted = Hosted::new();
        hosted.set_current_cpu(3);
        unsafe { hosted.enable() };
        assert!(hosted.save_and_disable());
        assert!(!hosted.save_and_disable());
        assert_eq!(hosted.current_cpu(), 3);
    }
}
