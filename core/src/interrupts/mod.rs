//! # Interrupt Resource Management
//!
//! Architecture-independent interrupt bookkeeping for the kernel.
//!
//! ```text
//!   trap entry ──> dispatch ──> IrqTable::lookup ──> handler(frame, state)
//!       │                                               │
//!       └── ack/revmap ── IrqDevice ── eoi <────────────┘
//!
//!   driver ──> allocate / reserve ──> IrqTable ──> install_handler
//! ```
//!
//! The [`IrqSubsystem`] owns the descriptor table, the controller registry
//! and a handle on the architecture primitives. The kernel builds exactly one
//! through [`init`] before enabling interrupts; tests build private ones
//! with [`IrqSubsystem::new`].

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use kestrel_hal::{ArchInterrupts, IrqLayout, IrqRange, LineError};
use spin::Once;

pub mod descriptor;
pub mod device;
pub mod dispatch;
pub mod radix;
pub mod registry;
pub mod reserve;
pub mod store;
pub mod table;

#[cfg(test)]
pub(crate) mod testing;

pub use descriptor::{
    DescFlags, Descriptor, DescriptorInfo, Handler, HandlerKind, HandlerState, IrqFrame,
    IrqHandlerFn, IrqReturn,
};
pub use device::{
    AckOutcome, Characteristics, ControllerCaps, ControllerFamily, CpuBinding, CpuMask, DevError,
    DevOutcome, IrqController, IrqDevice, IrqStatus,
};
pub use radix::{RadixTree, StoreError};
pub use registry::IrqDevices;
pub use reserve::MAX_RESERVATION;
pub use store::{DenseStore, DescriptorStore, KernelStore, SparseStore};
pub use table::{IrqTable, RangeRequest};

/// Interrupt number in the kernel's global namespace
pub type Irq = u32;

/// "No interrupt"
pub const NULL_IRQ: Irq = Irq::MAX;

// ============================================================================
// Errors
// ============================================================================

/// Interrupt subsystem errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// Interrupt number outside the namespace
    InvalidIrq,
    /// Malformed request (zero count, internal flags, empty name)
    InvalidArgument,
    /// Descriptor is not allocated
    NotAllocated,
    /// Descriptor is already allocated
    AlreadyAllocated,
    /// Range does not match an allocation group or reservation
    RangeMismatch,
    /// A handler is already installed
    AlreadyInstalled,
    /// No handler is installed
    NotInstalled,
    /// No matching range, run or device
    NotFound,
    /// A device with this name is already registered
    AlreadyExists,
    /// Allocation failure
    OutOfMemory,
    /// No controller serves this interrupt or CPU
    NoController,
    /// The controller reported a failure
    Controller(DevError),
    /// The kernel instance has not been initialised
    NotInitialized,
}

impl fmt::Display for IrqError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidIrq => f.write_str("invalid interrupt number"),
            Self::InvalidArgument => f.write_str("invalid argument"),
            Self::NotAllocated => f.write_str("interrupt not allocated"),
            Self::AlreadyAllocated => f.write_str("interrupt already allocated"),
            Self::RangeMismatch => f.write_str("range does not match an allocation"),
            Self::AlreadyInstalled => f.write_str("handler already installed"),
            Self::NotInstalled => f.write_str("no handler installed"),
            Self::NotFound => f.write_str("not found"),
            Self::AlreadyExists => f.write_str("already exists"),
            Self::OutOfMemory => f.write_str("out of memory"),
            Self::NoController => f.write_str("no interrupt controller"),
            Self::Controller(err) => write!(f, "controller error: {}", err),
            Self::NotInitialized => f.write_str("interrupt subsystem not initialized"),
        }
    }
}

impl From<StoreError> for IrqError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::OutOfMemory => Self::OutOfMemory,
            StoreError::IndexOutOfRange => Self::InvalidIrq,
        }
    }
}

impl From<DevError> for IrqError {
    fn from(err: DevError) -> Self {
        Self::Controller(err)
    }
}

impl From<LineError> for IrqError {
    fn from(err: LineError) -> Self {
        match err {
            LineError::InvalidLine => Self::InvalidIrq,
            LineError::Occupied => Self::AlreadyInstalled,
            LineError::Vacant => Self::NotInstalled,
            LineError::Unsupported => Self::NoController,
        }
    }
}

/// Result type for interrupt operations
pub type IrqResult<T> = Result<T, IrqError>;

// ============================================================================
// Configuration
// ============================================================================

/// Subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrqConfig {
    /// Namespace bound: interrupt numbers are `0..capacity`
    pub capacity: Irq,
    /// Windows MSI blocks are reserved from, tried in order
    pub msi_windows: Vec<IrqRange>,
    /// Largest block a single reservation may ask for
    pub max_reservation: u32,
}

impl IrqConfig {
    /// Defaults for a platform layout
    pub fn for_layout(layout: &IrqLayout) -> Self {
        if layout.sparse && !KernelStore::SPARSE {
            log::warn!(
                "irq: {} has a sparse namespace but the kernel table is dense ({} slots)",
                layout.name,
                layout.limit
            );
        }
        Self {
            capacity: layout.limit,
            msi_windows: if layout.msi.is_empty() {
                Vec::new()
            } else {
                vec![layout.msi]
            },
            max_reservation: MAX_RESERVATION,
        }
    }
}

// ============================================================================
// Subsystem
// ============================================================================

/// The interrupt subsystem: descriptor table, controller registry and
/// architecture handle
pub struct IrqSubsystem<S: DescriptorStore> {
    table: IrqTable<S>,
    devices: IrqDevices,
    arch: &'static dyn ArchInterrupts,
    config: IrqConfig,
}

impl<S: DescriptorStore> IrqSubsystem<S> {
    /// Build a subsystem
    pub fn new(config: IrqConfig, arch: &'static dyn ArchInterrupts) -> IrqResult<Self> {
        if config.capacity == 0 || config.max_reservation == 0 {
            return Err(IrqError::InvalidArgument);
        }
        let store = S::with_limit(config.capacity)?;
        Ok(Self {
            table: IrqTable::new(store, arch),
            devices: IrqDevices::new(),
            arch,
            config,
        })
    }

    /// Descriptor table
    pub fn table(&self) -> &IrqTable<S> {
        &self.table
    }

    /// Controller registry
    pub fn devices(&self) -> &IrqDevices {
        &self.devices
    }

    /// Architecture primitives
    pub fn arch(&self) -> &'static dyn ArchInterrupts {
        self.arch
    }

    /// Configuration
    pub fn config(&self) -> &IrqConfig {
        &self.config
    }

    /// Register a controller driver under a unique name
    pub fn register_controller(
        &self,
        name: &str,
        controller: alloc::boxed::Box<dyn IrqController>,
    ) -> IrqResult<alloc::sync::Arc<IrqDevice>> {
        self.devices.register(name, controller)
    }

    /// Allocate `count` consecutive interrupt numbers at or after `start`
    pub fn allocate_range(&self, count: u32, start: Irq) -> IrqResult<Irq> {
        self.table.allocate_range(count, start)
    }

    /// Release a range returned by [`allocate_range`](Self::allocate_range)
    pub fn free_range(&self, base: Irq, count: u32) -> IrqResult<()> {
        self.table.free_range(base, count)
    }

    /// Install a handler on an allocated interrupt
    pub fn install_handler(
        &self,
        irq: Irq,
        func: IrqHandlerFn,
        state: Option<HandlerState>,
    ) -> IrqResult<()> {
        self.table.install_handler(irq, func, state)
    }

    /// Remove a handler, returning its state
    pub fn remove_handler(&self, irq: Irq) -> IrqResult<Option<HandlerState>> {
        self.table.remove_handler(irq)
    }

    /// Bring the calling CPU's controllers online
    pub fn initialize_cpu(&self, cpu: kestrel_hal::CpuId) -> IrqResult<usize> {
        self.devices.initialize_cpu(cpu)
    }

    /// Diagnostic listing of every allocated interrupt
    pub fn descriptors(&self) -> Vec<DescriptorInfo> {
        self.table.descriptors()
    }
}

impl<S: DescriptorStore> fmt::Debug for IrqSubsystem<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqSubsystem")
            .field("arch", &self.arch.name())
            .field("config", &self.config)
            .field("allocated", &self.table.allocated_count())
            .field("devices", &self.devices.len())
            .finish()
    }
}

// ============================================================================
// Kernel Instance
// ============================================================================

static IRQS: Once<IrqSubsystem<KernelStore>> = Once::new();

/// Build the kernel's interrupt subsystem
///
/// Must run once, before any CPU enables interrupts. A second call fails
/// with [`IrqError::AlreadyExists`] and leaves the first instance in place.
pub fn init(
    config: IrqConfig,
    arch: &'static dyn ArchInterrupts,
) -> IrqResult<&'static IrqSubsystem<KernelStore>> {
    let mut built = false;
    let irqs = IRQS.try_call_once(|| {
        built = true;
        IrqSubsystem::new(config, arch)
    })?;
    if !built {
        return Err(IrqError::AlreadyExists);
    }

    log::info!(
        "irq: subsystem up on {} (kestrel {}), {} interrupt numbers, {} MSI window(s)",
        arch.name(),
        crate::KERNEL_VERSION,
        irqs.config.capacity,
        irqs.config.msi_windows.len()
    );
    Ok(irqs)
}

/// The kernel's interrupt subsystem
pub fn get() -> IrqResult<&'static IrqSubsystem<KernelStore>> {
    IRQS.get().ok_or(IrqError::NotInitialized)
}
