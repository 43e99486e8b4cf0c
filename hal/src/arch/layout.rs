//! # Interrupt Namespace Layouts
//!
//! Every architecture numbers its interrupts in one global namespace that is
//! carved into sub-ranges:
//!
//! ```text
//! x86_64 (IDT vectors, dense)
//! +-----------+-----------+-----------+-------------------------+-----------+
//! | 0x00-0x1F | 0x20-0x2F | 0x30-0x3F | 0x40-0xEF               | 0xF0-0xFF |
//! | exception | legacy PIC| IPI       | device / MSI            | local APIC|
//! +-----------+-----------+-----------+-------------------------+-----------+
//!
//! aarch64 (GIC INTIDs)
//! +--------+--------+--------------------------+--------------------------+
//! | 0-15   | 16-31  | 32-1019                  | 8192+ (GICv3 only)       |
//! | SGI    | PPI    | SPI (v2m MSI frame)      | LPI (ITS MSI)            |
//! +--------+--------+--------------------------+--------------------------+
//!
//! riscv64 (PLIC sources + hart-local causes)
//! +--------+--------------------------+--------+-----------+
//! | 0      | 1-1023                   | 1024   | 1025-1039 |
//! | none   | PLIC sources             | IPI    | hart-local|
//! +--------+--------------------------+--------+-----------+
//! ```

use static_assertions::const_assert;

// ============================================================================
// Ranges
// ============================================================================

/// Half-open range of interrupt numbers `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IrqRange {
    /// First interrupt number in the range
    pub start: u32,
    /// One past the last interrupt number in the range
    pub end: u32,
}

impl IrqRange {
    /// The empty range
    pub const EMPTY: Self = Self { start: 0, end: 0 };

    /// Create a range
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    /// Number of interrupt numbers in the range
    #[inline]
    pub const fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    /// Check if the range is empty
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Check if an interrupt number falls within the range
    #[inline]
    pub const fn contains(&self, irq: u32) -> bool {
        irq >= self.start && irq < self.end
    }

    /// Check if `[base, base + count)` lies entirely within the range
    #[inline]
    pub const fn contains_span(&self, base: u32, count: u32) -> bool {
        match base.checked_add(count) {
            Some(end) => base >= self.start && end <= self.end,
            None => false,
        }
    }
}

// ============================================================================
// Classes
// ============================================================================

/// Sub-range an interrupt number belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqClass {
    /// CPU exception vector
    Exception,
    /// Legacy (8259-style) controller line
    Legacy,
    /// Inter-processor interrupt
    Ipi,
    /// Per-CPU private peripheral interrupt
    PerCpu,
    /// Shared peripheral interrupt
    Shared,
    /// Message-signaled interrupt
    Msi,
    /// Outside every defined sub-range
    Reserved,
}

// ============================================================================
// Layout
// ============================================================================

/// Interrupt namespace layout of one platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqLayout {
    /// Layout name
    pub name: &'static str,
    /// Namespace bound: every valid interrupt number is below this
    pub limit: u32,
    /// CPU exceptions
    pub exceptions: IrqRange,
    /// Legacy controller lines
    pub legacy: IrqRange,
    /// Inter-processor interrupts
    pub ipi: IrqRange,
    /// Per-CPU private interrupts
    pub per_cpu: IrqRange,
    /// Shared peripheral interrupts
    pub shared: IrqRange,
    /// Window MSI blocks are carved from
    pub msi: IrqRange,
    /// Whether the namespace is too large or fragmented for a flat array
    pub sparse: bool,
}

impl IrqLayout {
    /// Classify an interrupt number
    ///
    /// MSI takes precedence over shared since MSI windows are usually carved
    /// out of the shared range.
    pub const fn classify(&self, irq: u32) -> IrqClass {
        if irq >= self.limit {
            IrqClass::Reserved
        } else if self.exceptions.contains(irq) {
            IrqClass::Exception
        } else if self.legacy.contains(irq) {
            IrqClass::Legacy
        } else if self.ipi.contains(irq) {
            IrqClass::Ipi
        } else if self.per_cpu.contains(irq) {
            IrqClass::PerCpu
        } else if self.msi.contains(irq) {
            IrqClass::Msi
        } else if self.shared.contains(irq) {
            IrqClass::Shared
        } else {
            IrqClass::Reserved
        }
    }

    /// Check if an interrupt number is inside the namespace
    #[inline]
    pub const fn is_valid(&self, irq: u32) -> bool {
        irq < self.limit
    }
}

/// x86_64 IDT vector layout (local APIC + I/O APIC + MSI)
pub const X86_64: IrqLayout = IrqLayout {
    name: "x86_64",
    limit: 0x100,
    exceptions: IrqRange::new(0x00, 0x20),
    legacy: IrqRange::new(0x20, 0x30),
    ipi: IrqRange::new(0x30, 0x40),
    per_cpu: IrqRange::new(0xF0, 0x100),
    shared: IrqRange::new(0x40, 0xF0),
    msi: IrqRange::new(0x40, 0xF0),
    sparse: false,
};

/// aarch64 GICv2 layout with a v2m MSI frame (QEMU virt placement)
pub const AARCH64_GICV2: IrqLayout = IrqLayout {
    name: "aarch64-gicv2",
    limit: 1020,
    exceptions: IrqRange::EMPTY,
    legacy: IrqRange::EMPTY,
    ipi: IrqRange::new(0, 16),
    per_cpu: IrqRange::new(16, 32),
    shared: IrqRange::new(32, 1020),
    msi: IrqRange::new(80, 144),
    sparse: false,
};

/// aarch64 GICv3 layout with ITS-backed LPIs
pub const AARCH64_GICV3: IrqLayout = IrqLayout {
    name: "aarch64-gicv3",
    limit: 8192 + 65536,
    exceptions: IrqRange::EMPTY,
    legacy: IrqRange::EMPTY,
    ipi: IrqRange::new(0, 16),
    per_cpu: IrqRange::new(16, 32),
    shared: IrqRange::new(32, 1020),
    msi: IrqRange::new(8192, 8192 + 65536),
    sparse: true,
};

/// riscv64 PLIC layout with the hart-local interrupt block appended
pub const RISCV64_PLIC: IrqLayout = IrqLayout {
    name: "riscv64-plic",
    limit: 1040,
    exceptions: IrqRange::EMPTY,
    legacy: IrqRange::EMPTY,
    ipi: IrqRange::new(1024, 1025),
    per_cpu: IrqRange::new(1025, 1040),
    shared: IrqRange::new(1, 1024),
    msi: IrqRange::EMPTY,
    sparse: false,
};

const_assert!(X86_64.exceptions.end <= X86_64.legacy.start);
const_assert!(X86_64.shared.end <= X86_64.per_cpu.start);
const_assert!(AARCH64_GICV2.msi.start >= AARCH64_GICV2.shared.start);
const_assert!(AARCH64_GICV2.msi.end <= AARCH64_GICV2.shared.end);
const_assert!(AARCH64_GICV3.msi.end <= AARCH64_GICV3.limit);
const_assert!(RISCV64_PLIC.shared.end <= RISCV64_PLIC.ipi.start);

/// Every layout known to the hal, by name
pub const ALL: [&IrqLayout; 4] = [&X86_64, &AARCH64_GICV2, &AARCH64_GICV3, &RISCV64_PLIC];

/// Look up a layout by name
pub fn by_name(name: &str) -> Option<&'static IrqLayout> {
    ALL.iter().copied().find(|layout| layout.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x86_64_classes() {
        assert_eq!(X86_64.classify(0x0E), IrqClass::Exception);
        assert_eq!(X86_64.classify(0x21), IrqClass::Legacy);
        assert_eq!(X86_64.classify(0x31), IrqClass::Ipi);
        assert_eq!(X86_64.classify(0x40), IrqClass::Msi);
        assert_eq!(X86_64.classify(0xEF), IrqClass::Msi);
        assert_eq!(X86_64.classify(0xFF), IrqClass::PerCpu);
        assert_eq!(X86_64.classify(0x100), IrqClass::Reserved);
    }

    #[test]
    fn test_gic_classes() {
        assert_eq!(AARCH64_GICV2.classify(3), IrqClass::Ipi);
        assert_eq!(AARCH64_GICV2.classify(27), IrqClass::PerCpu);
        assert_eq!(AARCH64_GICV2.classify(33), IrqClass::Shared);
        assert_eq!(AARCH64_GICV2.classify(100), IrqClass::Msi);
        assert_eq!(AARCH64_GICV3.classify(9000), IrqClass::Msi);
        assert_eq!(AARCH64_GICV3.classify(2000), IrqClass::Reserved);
    }

    #[test]
    fn test_range_span() {
        let range = IrqRange::new(10, 20);
        assert!(range.contains_span(10, 10));
        assert!(!range.contains_span(15, 6));
        assert!(!range.contains_span(u32::MAX, 2));
        assert_eq!(IrqRange::EMPTY.len(), 0);
    }

    #[test]
    fn test_lookup_by_name() {
        assert_eq!(by_name("riscv64-plic"), Some(&RISCV64_PLIC));
        assert!(by_name("sparc").is_none());
    }
}
