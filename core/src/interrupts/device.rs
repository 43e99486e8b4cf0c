//! # Interrupt Controller Devices
//!
//! Every hardware interrupt controller driver (GICv2/v3, PLIC, 8259-style
//! PICs, local APICs) implements [`IrqController`]. Optional capabilities
//! default to [`DevOutcome::Unimplemented`], which callers treat as a no-op
//! success rather than an error.

use alloc::boxed::Box;
use alloc::string::String;
use core::fmt;

use bitflags::bitflags;
use kestrel_hal::{CpuId, MAX_CPUS};
use spin::RwLock;
use static_assertions::const_assert;

use super::Irq;

// ============================================================================
// Outcomes
// ============================================================================

/// Controller-reported failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevError {
    /// The controller has no such line
    InvalidLine,
    /// The controller is busy or the line is in a state that forbids this
    Busy,
    /// The controller does not support the operation at all
    Unsupported,
    /// Hardware error with a driver-specific code
    Hardware(i32),
}

impl fmt::Display for DevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLine => f.write_str("invalid controller line"),
            Self::Busy => f.write_str("controller busy"),
            Self::Unsupported => f.write_str("operation unsupported by controller"),
            Self::Hardware(code) => write!(f, "controller hardware error {}", code),
        }
    }
}

/// Result of an optional controller capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevOutcome<T> {
    /// Capability ran and succeeded
    Done(T),
    /// Capability ran and failed
    Failed(DevError),
    /// Controller does not provide the capability
    Unimplemented,
}

impl<T> DevOutcome<T> {
    /// Collapse into a `Result`, with `Unimplemented` as `Ok(None)`
    pub fn into_result(self) -> Result<Option<T>, DevError> {
        match self {
            Self::Done(value) => Ok(Some(value)),
            Self::Failed(err) => Err(err),
            Self::Unimplemented => Ok(None),
        }
    }

    /// Check if the capability is missing
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented)
    }
}

impl<T> From<Result<T, DevError>> for DevOutcome<T> {
    fn from(result: Result<T, DevError>) -> Self {
        match result {
            Ok(value) => Self::Done(value),
            Err(err) => Self::Failed(err),
        }
    }
}

/// Result of claiming the pending interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// A line was claimed; handle it, then EOI it
    Claimed(u32),
    /// Claim failed but the controller still expects an EOI for this id
    /// before the trap returns
    EoiBeforeReturn(u32),
    /// Nothing to handle (spurious); return without EOI
    ReturnWithoutEoi,
    /// Controller has no acknowledge step
    Unimplemented,
}

bitflags! {
    /// Line status, each bit independently testable
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IrqStatus: u8 {
        /// Status could not be read
        const ERROR = 1 << 1;
        /// Line unmasked at the controller
        const ENABLED = 1 << 2;
        /// Interrupt latched, not yet claimed
        const PENDING = 1 << 3;
        /// Interrupt claimed, not yet completed
        const ACTIVE = 1 << 4;
    }
}

bitflags! {
    /// Optional capabilities a controller advertises
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ControllerCaps: u32 {
        /// Claims interrupts through `ack`
        const ACK = 1 << 0;
        /// Needs `eoi` after handling
        const EOI = 1 << 1;
        /// Has a per-CPU initialisation step
        const PER_CPU_INIT = 1 << 2;
        /// Can raise inter-processor interrupts
        const IPI = 1 << 3;
        /// Can deliver message-signaled interrupts
        const MSI = 1 << 4;
        /// Translates its line numbers into kernel interrupt numbers
        const REVMAP = 1 << 5;
    }
}

/// Controller family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerFamily {
    /// ARM Generic Interrupt Controller v2
    GicV2,
    /// ARM Generic Interrupt Controller v3
    GicV3,
    /// RISC-V Platform-Level Interrupt Controller
    Plic,
    /// 8259-style programmable interrupt controller
    LegacyPic,
    /// x86 local APIC (with I/O APIC routing)
    LocalApic,
    /// Anything else
    Other(&'static str),
}

impl ControllerFamily {
    /// Short family name
    pub fn name(&self) -> &'static str {
        match self {
            Self::GicV2 => "gicv2",
            Self::GicV3 => "gicv3",
            Self::Plic => "plic",
            Self::LegacyPic => "pic",
            Self::LocalApic => "apic",
            Self::Other(name) => *name,
        }
    }
}

impl fmt::Display for ControllerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Static properties reported at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Characteristics {
    /// Controller family
    pub family: ControllerFamily,
    /// Number of lines the controller drives
    pub num_lines: u32,
    /// Advertised capabilities
    pub caps: ControllerCaps,
}

// ============================================================================
// Controller Trait
// ============================================================================

/// Interrupt controller driver
///
/// `hwirq` arguments are line numbers in the controller's own numbering.
pub trait IrqController: Send + Sync {
    /// Controller family
    fn family(&self) -> ControllerFamily;

    /// Static properties, checked at registration
    fn characteristics(&self) -> DevOutcome<Characteristics> {
        DevOutcome::Unimplemented
    }

    /// Set up the calling CPU's view of the controller
    fn initialize_cpu(&self, _cpu: CpuId) -> DevOutcome<()> {
        DevOutcome::Unimplemented
    }

    /// Claim the interrupt pending for `cpu`
    fn ack(&self, _cpu: CpuId) -> AckOutcome {
        AckOutcome::Unimplemented
    }

    /// Signal completion of `hwirq`
    fn eoi(&self, _cpu: CpuId, _hwirq: u32) -> DevOutcome<()> {
        DevOutcome::Unimplemented
    }

    /// Unmask a line for every CPU the controller services
    fn enable(&self, hwirq: u32) -> Result<(), DevError>;

    /// Mask a line for every CPU the controller services
    fn disable(&self, hwirq: u32) -> Result<(), DevError>;

    /// Line status
    fn status(&self, hwirq: u32) -> IrqStatus;

    /// Translate a controller line into a kernel interrupt number
    fn revmap(&self, _hwirq: u32) -> DevOutcome<Irq> {
        DevOutcome::Unimplemented
    }

    /// Raise `hwirq` as an inter-processor interrupt on `cpu`
    fn send_ipi(&self, _cpu: CpuId, _hwirq: u32) -> DevOutcome<()> {
        DevOutcome::Unimplemented
    }
}

// ============================================================================
// CPU Binding
// ============================================================================

const MASK_WORDS: usize = 4;

const_assert!(MASK_WORDS * 64 >= MAX_CPUS);

/// Set of CPU ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuMask {
    bits: [u64; MASK_WORDS],
}

impl CpuMask {
    /// Empty mask
    pub const fn new() -> Self {
        Self {
            bits: [0; MASK_WORDS],
        }
    }

    /// Mask holding exactly the given CPUs (ids past `MAX_CPUS` are ignored)
    pub fn from_cpus(cpus: &[CpuId]) -> Self {
        let mut mask = Self::new();
        for &cpu in cpus {
            mask.insert(cpu);
        }
        mask
    }

    /// Add a CPU; returns `false` if the id is out of range
    pub fn insert(&mut self, cpu: CpuId) -> bool {
        if cpu as usize >= MAX_CPUS {
            return false;
        }
        self.bits[cpu as usize / 64] |= 1 << (cpu % 64);
        true
    }

    /// Remove a CPU
    pub fn remove(&mut self, cpu: CpuId) {
        if (cpu as usize) < MAX_CPUS {
            self.bits[cpu as usize / 64] &= !(1 << (cpu % 64));
        }
    }

    /// Check membership
    pub fn contains(&self, cpu: CpuId) -> bool {
        (cpu as usize) < MAX_CPUS && self.bits[cpu as usize / 64] & (1 << (cpu % 64)) != 0
    }

    /// Number of CPUs in the mask
    pub fn count(&self) -> u32 {
        self.bits.iter().map(|word| word.count_ones()).sum()
    }

    /// Check if the mask is empty
    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&word| word == 0)
    }

    /// CPUs in ascending order
    pub fn iter(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..MAX_CPUS as CpuId).filter(move |&cpu| self.contains(cpu))
    }
}

/// CPUs a controller services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuBinding {
    /// Not bound yet
    #[default]
    Unbound,
    /// One CPU
    Cpu(CpuId),
    /// Every CPU
    All,
    /// An explicit subset
    Set(CpuMask),
}

impl CpuBinding {
    /// Check if `cpu` is serviced
    pub fn covers(&self, cpu: CpuId) -> bool {
        match self {
            Self::Unbound => false,
            Self::Cpu(bound) => *bound == cpu,
            Self::All => (cpu as usize) < MAX_CPUS,
            Self::Set(mask) => mask.contains(cpu),
        }
    }

    /// Check if `cpu` is named explicitly rather than through `All`
    pub fn names(&self, cpu: CpuId) -> bool {
        matches!(self, Self::Cpu(_) | Self::Set(_)) && self.covers(cpu)
    }
}

// ============================================================================
// Device
// ============================================================================

/// A registered interrupt controller
pub struct IrqDevice {
    name: String,
    controller: Box<dyn IrqController>,
    binding: RwLock<CpuBinding>,
}

impl IrqDevice {
    /// Wrap a controller driver
    pub fn new(name: &str, controller: Box<dyn IrqController>) -> Self {
        Self {
            name: String::from(name),
            controller,
            binding: RwLock::new(CpuBinding::Unbound),
        }
    }

    /// Registry name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The driver
    pub fn controller(&self) -> &dyn IrqController {
        &*self.controller
    }

    /// Controller family
    pub fn family(&self) -> ControllerFamily {
        self.controller.family()
    }

    /// Current CPU binding
    pub fn binding(&self) -> CpuBinding {
        *self.binding.read()
    }

    /// Replace the CPU binding
    pub fn set_binding(&self, binding: CpuBinding) {
        *self.binding.write() = binding;
    }

    /// Check if the controller services `cpu`
    pub fn services(&self, cpu: CpuId) -> bool {
        self.binding().covers(cpu)
    }
}

impl fmt::Debug for IrqDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqDevice")
            .field("name", &self.name)
            .field("family", &self.family())
            .field("binding", &self.binding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct Minimal;

    impl IrqController for Minimal {
        fn family(&self) -> ControllerFamily {
            ControllerFamily::LegacyPic
        }

        fn enable(&self, _hwirq: u32) -> Result<(), DevError> {
            Ok(())
        }

        fn disable(&self, hwirq: u32) -> Result<(), DevError> {
            if hwirq < 16 {
                Ok(())
            } else {
                Err(DevError::InvalidLine)
            }
        }

        fn status(&self, _hwirq: u32) -> IrqStatus {
            IrqStatus::ENABLED | IrqStatus::PENDING
        }
    }

    #[test]
    fn test_optional_capabilities_default_to_unimplemented() {
        let pic = Minimal;
        assert!(pic.characteristics().is_unimplemented());
        assert!(pic.initialize_cpu(0).is_unimplemented());
        assert_eq!(pic.ack(0), AckOutcome::Unimplemented);
        assert_eq!(pic.eoi(0, 1).into_result(), Ok(None));
        assert!(pic.revmap(1).is_unimplemented());
        assert!(pic.send_ipi(1, 0).is_unimplemented());
    }

    #[test]
    fn test_status_bits_combine() {
        let status = Minimal.status(3);
        assert!(status.contains(IrqStatus::ENABLED));
        assert!(status.contains(IrqStatus::PENDING));
        assert!(!status.intersects(IrqStatus::ERROR | IrqStatus::ACTIVE));
    }

    #[test]
    fn test_outcome_conversions() {
        assert_eq!(DevOutcome::Done(7).into_result(), Ok(Some(7)));
        assert_eq!(
            DevOutcome::<()>::Failed(DevError::Busy).into_result(),
            Err(DevError::Busy)
        );
        let outcome: DevOutcome<()> = Minimal.disable(20).into();
        assert_eq!(outcome, DevOutcome::Failed(DevError::InvalidLine));
    }

    #[test]
    fn test_cpu_mask() {
        let mut mask = CpuMask::from_cpus(&[0, 65, 255, 300]);
        assert_eq!(mask.count(), 3);
        assert!(mask.contains(65));
        assert!(!mask.contains(300));
        assert!(!mask.insert(256));
        mask.remove(65);
        assert_eq!(mask.iter().collect::<Vec<_>>(), [0, 255]);
    }

    #[test]
    fn test_binding_coverage() {
        let mask = CpuMask::from_cpus(&[2, 3]);
        assert!(!CpuBinding::Unbound.covers(0));
        assert!(CpuBinding::Cpu(1).covers(1));
        assert!(!CpuBinding::Cpu(1).covers(2));
        assert!(CpuBinding::All.covers(200));
        assert!(!CpuBinding::All.names(200));
        assert!(CpuBinding::Set(mask).names(3));
        assert!(!CpuBinding::Set(mask).covers(4));
    }

    #[test]
    fn test_device_binding_update() {
        let dev = IrqDevice::new("pic0", Box::new(Minimal));
        assert_eq!(dev.name(), "pic0");
        assert_eq!(dev.family(), ControllerFamily::LegacyPic);
        assert!(!dev.services(0));
        dev.set_binding(CpuBinding::All);
        assert!(dev.services(0));
    }
}
