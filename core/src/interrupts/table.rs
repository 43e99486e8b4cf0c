//! # Descriptor Table
//!
//! Allocation, lookup and handler management over a [`DescriptorStore`].
//!
//! ## Locking
//!
//! - The range lock serialises every operation that looks at several
//!   descriptors as a set: allocation, free and reservation. Cold path only.
//! - Each descriptor's own lock guards its handler, controller binding and
//!   the `ALLOCATED` transition. Dispatch takes it just long enough to copy
//!   the handler out.
//!
//! Lock order is range lock, then descriptor lock. Descriptor locks are only
//! taken with local interrupts disabled, so a handler on the same CPU can
//! never spin on a lock its own CPU holds.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use kestrel_hal::{ArchInterrupts, LocalIrqGuard};
use spin::{Mutex, MutexGuard};

use super::descriptor::{
    Action, DescFlags, Descriptor, DescriptorInfo, Handler, HandlerState, IrqHandlerFn,
};
use super::device::IrqDevice;
use super::store::DescriptorStore;
use super::{Irq, IrqError, IrqResult};

/// Parameters of a range allocation
#[derive(Debug, Clone)]
pub struct RangeRequest {
    /// Number of consecutive interrupt numbers
    pub count: u32,
    /// First interrupt number to consider
    pub start: Irq,
    /// Controller that owns the lines
    pub controller: Option<Arc<IrqDevice>>,
    /// Controller line of the first interrupt; the rest follow consecutively
    pub hwirq: u32,
    /// Initial flags (trigger mode, MSI, IPI, ...)
    pub flags: DescFlags,
}

impl RangeRequest {
    /// Request `count` interrupt numbers anywhere in the namespace
    pub fn new(count: u32) -> Self {
        Self {
            count,
            start: 0,
            controller: None,
            hwirq: 0,
            flags: DescFlags::empty(),
        }
    }

    /// Search from `start` upward
    pub fn starting_at(mut self, start: Irq) -> Self {
        self.start = start;
        self
    }

    /// Bind the range to a controller, lines `hwirq..hwirq + count`
    pub fn with_controller(mut self, controller: Arc<IrqDevice>, hwirq: u32) -> Self {
        self.controller = Some(controller);
        self.hwirq = hwirq;
        self
    }

    /// Initial descriptor flags
    pub fn with_flags(mut self, flags: DescFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// The descriptor table
pub struct IrqTable<S: DescriptorStore> {
    store: S,
    range_lock: Mutex<()>,
    arch: &'static dyn ArchInterrupts,
}

impl<S: DescriptorStore> IrqTable<S> {
    /// Create a table over `store`
    pub fn new(store: S, arch: &'static dyn ArchInterrupts) -> Self {
        Self {
            store,
            range_lock: Mutex::new(()),
            arch,
        }
    }

    /// Backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Namespace bound
    pub fn limit(&self) -> Irq {
        self.store.limit()
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Find the descriptor of an allocated interrupt
    ///
    /// # Panics
    ///
    /// Panics if the slot for `irq` holds a descriptor for another number:
    /// the table is corrupt and nothing routed through it can be trusted.
    #[inline]
    pub fn lookup(&self, irq: Irq) -> Option<&Descriptor> {
        let desc = self.store.slot(irq)?;
        if desc.irq() != irq {
            panic!(
                "irq: descriptor table corrupt, slot {} holds descriptor for irq {}",
                irq,
                desc.irq()
            );
        }
        desc.is_allocated().then_some(desc)
    }

    /// Check if `irq` is allocated
    pub fn is_allocated(&self, irq: Irq) -> bool {
        self.lookup(irq).is_some()
    }

    /// Like [`lookup`](Self::lookup), but as an error for the caller
    fn allocated(&self, irq: Irq) -> IrqResult<&Descriptor> {
        if irq >= self.store.limit() {
            return Err(IrqError::InvalidIrq);
        }
        self.lookup(irq).ok_or(IrqError::NotAllocated)
    }

    /// Lock a descriptor's action with local interrupts disabled
    pub(super) fn lock_action<'a>(
        &'a self,
        desc: &'a Descriptor,
    ) -> (LocalIrqGuard<'a, dyn ArchInterrupts>, MutexGuard<'a, Action>) {
        let irq_guard = LocalIrqGuard::new(self.arch);
        (irq_guard, desc.action())
    }

    pub(super) fn range_lock(&self) -> MutexGuard<'_, ()> {
        self.range_lock.lock()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate `count` consecutive interrupt numbers at or after `start`
    pub fn allocate_range(&self, count: u32, start: Irq) -> IrqResult<Irq> {
        self.allocate(&RangeRequest::new(count).starting_at(start))
    }

    /// Allocate a range as described by `request`
    ///
    /// Every slot is materialised before any is marked, so a store failure
    /// leaves no allocated slot behind.
    pub fn allocate(&self, request: &RangeRequest) -> IrqResult<Irq> {
        let count = request.count;
        if count == 0 || request.flags.intersects(DescFlags::INTERNAL) {
            return Err(IrqError::InvalidArgument);
        }
        if request.start >= self.store.limit() {
            return Err(IrqError::InvalidIrq);
        }

        let _range = self.range_lock();
        let base = self.find_unallocated(request.start, count).ok_or_else(|| {
            log::debug!(
                "irq: no room for {} interrupt(s) from {}",
                count,
                request.start
            );
            IrqError::NotFound
        })?;

        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(count as usize)
            .map_err(|_| IrqError::OutOfMemory)?;
        for irq in base..base + count {
            fresh.push(self.store.materialize(irq)?);
        }

        for (offset, desc) in (0..count).zip(fresh) {
            desc.reset_triggered();
            desc.set_group(Some((base, count)));
            let (_irq_guard, mut action) = self.lock_action(desc);
            action.handler = Handler::Unhandled;
            action.controller = request.controller.clone();
            action.hwirq = request.hwirq.wrapping_add(offset);
            desc.store_flags(request.flags | DescFlags::ALLOCATED);
        }

        log::debug!(
            "irq: allocated {}..{} (controller {})",
            base,
            base + count,
            request.controller.as_ref().map_or("-", |dev| dev.name())
        );
        Ok(base)
    }

    /// First run of `count` unallocated slots at or after `start`
    fn find_unallocated(&self, start: Irq, count: u32) -> Option<Irq> {
        let limit = self.store.limit();
        let mut run_start = start;
        let mut run = 0;
        for irq in start..limit {
            if self.is_allocated(irq) {
                run = 0;
                run_start = irq + 1;
            } else {
                run += 1;
                if run == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Release a range returned by [`allocate`](Self::allocate)
    ///
    /// `(base, count)` must name exactly one allocation. Nothing is changed
    /// unless every slot checks out.
    pub fn free_range(&self, base: Irq, count: u32) -> IrqResult<()> {
        if count == 0 {
            return Err(IrqError::InvalidArgument);
        }
        let end = base.checked_add(count).ok_or(IrqError::InvalidIrq)?;

        let _range = self.range_lock();
        for irq in base..end {
            let desc = self.allocated(irq)?;
            if desc.group() != Some((base, count)) {
                return Err(IrqError::RangeMismatch);
            }
        }

        for irq in base..end {
            let Some(desc) = self.store.slot(irq) else {
                continue;
            };
            {
                let (_irq_guard, mut action) = self.lock_action(desc);
                action.handler = Handler::Unhandled;
                action.controller = None;
                action.hwirq = 0;
                desc.store_flags(DescFlags::empty());
            }
            desc.set_group(None);
        }

        log::debug!("irq: freed {}..{}", base, end);
        Ok(())
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    /// Install a handler on an allocated interrupt
    ///
    /// Fills an unhandled or reserved slot. Fails with
    /// [`IrqError::AlreadyInstalled`] if a handler is present.
    pub fn install_handler(
        &self,
        irq: Irq,
        func: IrqHandlerFn,
        state: Option<HandlerState>,
    ) -> IrqResult<()> {
        let desc = self.allocated(irq)?;
        let (_irq_guard, mut action) = self.lock_action(desc);
        if !desc.is_allocated() {
            return Err(IrqError::NotAllocated);
        }
        if let Handler::Installed { .. } = action.handler {
            return Err(IrqError::AlreadyInstalled);
        }
        action.handler = Handler::Installed { func, state };
        desc.remove_flags(DescFlags::RESERVED);
        Ok(())
    }

    /// Remove a handler, returning its state
    ///
    /// The slot goes back to unhandled and is available for reservation.
    pub fn remove_handler(&self, irq: Irq) -> IrqResult<Option<HandlerState>> {
        let desc = self.allocated(irq)?;
        let (_irq_guard, mut action) = self.lock_action(desc);
        match core::mem::replace(&mut action.handler, Handler::Unhandled) {
            Handler::Installed { state, .. } => Ok(state),
            previous => {
                action.handler = previous;
                Err(IrqError::NotInstalled)
            },
        }
    }

    /// Copy of the handler slot
    pub fn handler(&self, irq: Irq) -> IrqResult<Handler> {
        let desc = self.allocated(irq)?;
        let (_irq_guard, action) = self.lock_action(desc);
        Ok(action.handler.clone())
    }

    // ========================================================================
    // Flags and controllers
    // ========================================================================

    /// Flags of an allocated interrupt
    pub fn flags(&self, irq: Irq) -> IrqResult<DescFlags> {
        Ok(self.allocated(irq)?.flags())
    }

    /// Set caller-owned flags
    pub fn set_flags(&self, irq: Irq, flags: DescFlags) -> IrqResult<()> {
        if flags.intersects(DescFlags::INTERNAL) {
            return Err(IrqError::InvalidArgument);
        }
        self.allocated(irq)?.insert_flags(flags);
        Ok(())
    }

    /// Clear caller-owned flags
    pub fn clear_flags(&self, irq: Irq, flags: DescFlags) -> IrqResult<()> {
        if flags.intersects(DescFlags::INTERNAL) {
            return Err(IrqError::InvalidArgument);
        }
        self.allocated(irq)?.remove_flags(flags);
        Ok(())
    }

    /// Bind an allocated interrupt to controller line `hwirq`
    pub fn bind_controller(&self, irq: Irq, device: Arc<IrqDevice>, hwirq: u32) -> IrqResult<()> {
        let desc = self.allocated(irq)?;
        let (_irq_guard, mut action) = self.lock_action(desc);
        action.controller = Some(device);
        action.hwirq = hwirq;
        Ok(())
    }

    /// Owning controller and line of an allocated interrupt
    pub fn controller_of(&self, irq: Irq) -> Option<(Arc<IrqDevice>, u32)> {
        let desc = self.lookup(irq)?;
        let (_irq_guard, action) = self.lock_action(desc);
        action
            .controller
            .as_ref()
            .map(|dev| (Arc::clone(dev), action.hwirq))
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Snapshot of every allocated interrupt, ascending
    pub fn descriptors(&self) -> Vec<DescriptorInfo> {
        self.store
            .slots()
            .filter(|desc| desc.is_allocated())
            .map(|desc| {
                let _irq_guard = LocalIrqGuard::new(self.arch);
                desc.info()
            })
            .collect()
    }

    /// Number of allocated interrupts
    pub fn allocated_count(&self) -> usize {
        self.store.slots().filter(|desc| desc.is_allocated()).count()
    }
}

impl<S: DescriptorStore> fmt::Debug for IrqTable<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqTable")
            .field("limit", &self.limit())
            .field("allocated", &self.allocated_count())
            .finish()
    }
}
