//! # Interrupt Descriptors
//!
//! One [`Descriptor`] per interrupt number. The table owns every
//! descriptor; drivers refer to them only by [`Irq`].

use alloc::string::String;
use alloc::sync::Arc;
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use bitflags::bitflags;
use kestrel_hal::CpuId;
use spin::{Mutex, MutexGuard};

use super::device::IrqDevice;
use super::Irq;

bitflags! {
    /// Descriptor state and trigger flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DescFlags: u16 {
        /// Slot belongs to an allocated range
        const ALLOCATED = 1 << 0;
        /// Message-signaled interrupt
        const MSI = 1 << 1;
        /// MSI-X interrupt
        const MSI_X = 1 << 2;
        /// Per-CPU interrupt (banked per core)
        const PERCPU = 1 << 3;
        /// Inter-processor interrupt
        const IPI = 1 << 4;
        /// Non-maskable interrupt
        const NMI = 1 << 5;
        /// Held by a range reservation, handler not yet installed
        const RESERVED = 1 << 6;
        /// Edge triggered
        const EDGE = 1 << 7;
        /// Level triggered
        const LEVEL = 1 << 8;
    }
}

impl DescFlags {
    /// Flags owned by the table itself; callers cannot set or clear them
    pub const INTERNAL: Self = Self::ALLOCATED.union(Self::RESERVED);
}

// ============================================================================
// Handlers
// ============================================================================

/// What the handler is told about the interrupt being delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFrame {
    /// Interrupt number
    pub irq: Irq,
    /// Raw vector or hardware id the trap entry saw
    pub vector: u32,
    /// CPU fielding the interrupt
    pub cpu: CpuId,
}

/// Handler outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The interrupt was for this handler and has been serviced
    Handled,
    /// The interrupt was not for this handler
    NotHandled,
    /// The handler failed with a driver-specific code
    Failed(i32),
}

impl IrqReturn {
    /// Check if the handler reported a failure
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Handler-private state registered alongside the handler
pub type HandlerState = Arc<dyn Any + Send + Sync>;

/// Interrupt handler function
pub type IrqHandlerFn = fn(&IrqFrame, Option<&HandlerState>) -> IrqReturn;

/// Handler slot of a descriptor
#[derive(Clone)]
pub enum Handler {
    /// Allocated but nothing installed yet
    Unhandled,
    /// Held by a range reservation
    Reserved,
    /// A driver handler
    Installed {
        /// Handler function
        func: IrqHandlerFn,
        /// Handler-private state
        state: Option<HandlerState>,
    },
}

impl Handler {
    /// Kind of handler, without the state
    pub fn kind(&self) -> HandlerKind {
        match self {
            Self::Unhandled => HandlerKind::Unhandled,
            Self::Reserved => HandlerKind::Reserved,
            Self::Installed { .. } => HandlerKind::Installed,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unhandled => f.write_str("Unhandled"),
            Self::Reserved => f.write_str("Reserved"),
            Self::Installed { func, state } => f
                .debug_struct("Installed")
                .field("func", &(*func as usize as *const ()))
                .field("state", &state.is_some())
                .finish(),
        }
    }
}

/// Handler slot kinds, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Nothing installed
    Unhandled,
    /// Held by a range reservation
    Reserved,
    /// Driver handler installed
    Installed,
}

/// Lock-protected part of a descriptor
#[derive(Debug)]
pub struct Action {
    /// Handler slot
    pub handler: Handler,
    /// Owning controller, if any
    pub controller: Option<Arc<IrqDevice>>,
    /// Line number at the owning controller
    pub hwirq: u32,
}

impl Action {
    const fn vacant() -> Self {
        Self {
            handler: Handler::Unhandled,
            controller: None,
            hwirq: 0,
        }
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Per-interrupt metadata
pub struct Descriptor {
    irq: Irq,
    flags: AtomicU16,
    action: Mutex<Action>,
    triggered: AtomicU64,
    /// `(base, count)` of the range this slot was allocated with
    group: Mutex<Option<(Irq, u32)>>,
}

impl Descriptor {
    /// Create an unallocated descriptor for `irq`
    pub const fn new(irq: Irq) -> Self {
        Self {
            irq,
            flags: AtomicU16::new(0),
            action: Mutex::new(Action::vacant()),
            triggered: AtomicU64::new(0),
            group: Mutex::new(None),
        }
    }

    /// Interrupt number this descriptor describes
    #[inline]
    pub fn irq(&self) -> Irq {
        self.irq
    }

    /// Current flags
    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Check if the slot is part of an allocated range
    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.flags().contains(DescFlags::ALLOCATED)
    }

    /// Times this interrupt has been dispatched since allocation
    #[inline]
    pub fn triggered(&self) -> u64 {
        self.triggered.load(Ordering::Relaxed)
    }

    /// Range this slot was allocated with
    pub fn group(&self) -> Option<(Irq, u32)> {
        *self.group.lock()
    }

    pub(crate) fn action(&self) -> MutexGuard<'_, Action> {
        self.action.lock()
    }

    pub(crate) fn insert_flags(&self, flags: DescFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn remove_flags(&self, flags: DescFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Replace every flag at once; `Release` publishes prior writes
    pub(crate) fn store_flags(&self, flags: DescFlags) {
        self.flags.store(flags.bits(), Ordering::Release);
    }

    pub(crate) fn set_group(&self, group: Option<(Irq, u32)>) {
        *self.group.lock() = group;
    }

    pub(crate) fn count_trigger(&self) -> u64 {
        self.triggered.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_triggered(&self) {
        self.triggered.store(0, Ordering::Relaxed);
    }

    /// Diagnostic snapshot
    pub fn info(&self) -> DescriptorInfo {
        let action = self.action();
        DescriptorInfo {
            irq: self.irq,
            flags: self.flags(),
            triggered: self.triggered(),
            handler: action.handler.kind(),
            controller: action.controller.as_ref().map(|dev| String::from(dev.name())),
            hwirq: action.hwirq,
            group: self.group(),
        }
    }
}

impl fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Descriptor")
            .field("irq", &self.irq)
            .field("flags", &self.flags())
            .field("triggered", &self.triggered())
            .finish_non_exhaustive()
    }
}

/// Read-only view of one descriptor, for "list interrupts" style tooling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    /// Interrupt number
    pub irq: Irq,
    /// Flags at snapshot time
    pub flags: DescFlags,
    /// Dispatch count
    pub triggered: u64,
    /// Handler slot kind
    pub handler: HandlerKind,
    /// Name of the owning controller
    pub controller: Option<String>,
    /// Line number at the owning controller
    pub hwirq: u32,
    /// Allocation group `(base, count)`
    pub group: Option<(Irq, u32)>,
}

impl fmt::Display for DescriptorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "irq {:>5} {:<9} {:<10} hw {:>5} count {}",
            self.irq,
            self.controller.as_deref().unwrap_or("-"),
            match self.handler {
                HandlerKind::Unhandled => "unhandled",
                HandlerKind::Reserved => "reserved",
                HandlerKind::Installed => "installed",
            },
            self.hwirq,
            self.triggered,
        )?;
        for (name, _) in self.flags.iter_names() {
            write!(f, " {}", name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    fn nop(_frame: &IrqFrame, _state: Option<&HandlerState>) -> IrqReturn {
        IrqReturn::Handled
    }

    #[test]
    fn test_new_descriptor_is_vacant() {
        let desc = Descriptor::new(17);
        assert_eq!(desc.irq(), 17);
        assert!(!desc.is_allocated());
        assert_eq!(desc.triggered(), 0);
        assert!(desc.group().is_none());
        assert_eq!(desc.info().handler, HandlerKind::Unhandled);
    }

    #[test]
    fn test_flag_updates() {
        let desc = Descriptor::new(3);
        desc.insert_flags(DescFlags::ALLOCATED | DescFlags::EDGE);
        assert!(desc.is_allocated());
        desc.remove_flags(DescFlags::EDGE);
        assert_eq!(desc.flags(), DescFlags::ALLOCATED);
        desc.store_flags(DescFlags::empty());
        assert!(!desc.is_allocated());
    }

    #[test]
    fn test_trigger_counter() {
        let desc = Descriptor::new(0);
        assert_eq!(desc.count_trigger(), 1);
        assert_eq!(desc.count_trigger(), 2);
        desc.reset_triggered();
        assert_eq!(desc.triggered(), 0);
    }

    #[test]
    fn test_info_display() {
        let desc = Descriptor::new(42);
        desc.store_flags(DescFlags::ALLOCATED | DescFlags::MSI);
        desc.action().handler = Handler::Installed { func: nop, state: None };
        let line = desc.info().to_string();
        assert!(line.contains("irq    42"));
        assert!(line.contains("installed"));
        assert!(line.contains("ALLOCATED"));
        assert!(line.contains("MSI"));
    }
}
