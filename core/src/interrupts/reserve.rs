//! # Range Reservation
//!
//! Contiguous blocks of allocated-but-unhandled interrupts, held for
//! multi-step MSI setup. A slot is free for reservation when it is allocated
//! and still holds [`Handler::Unhandled`]; unallocated slots never qualify.
//!
//! ```text
//!   Unhandled ──reserve──> Reserved ──install_handler──> Installed
//!       ^                     │                              │
//!       └──────release────────┘                              │
//!       └──────────────────remove_handler────────────────────┘
//! ```

use kestrel_hal::IrqRange;

use super::descriptor::{DescFlags, Handler};
use super::store::DescriptorStore;
use super::table::IrqTable;
use super::{Irq, IrqError, IrqResult, IrqSubsystem};

/// Largest block one reservation may cover
pub const MAX_RESERVATION: u32 = 32;

impl<S: DescriptorStore> IrqTable<S> {
    /// Reserve `count` consecutive unhandled interrupts inside `window`
    ///
    /// With `aligned`, only offsets from the window base that are multiples
    /// of `count` are tried. Returns the first interrupt of the block; on
    /// failure no slot is left reserved.
    pub fn find_and_reserve_range(
        &self,
        count: u32,
        aligned: bool,
        window: IrqRange,
    ) -> IrqResult<Irq> {
        self.reserve_flagged(count, aligned, window, DescFlags::empty())
    }

    /// [`find_and_reserve_range`](Self::find_and_reserve_range) that also
    /// sets `flags` on every reserved slot while the range lock is held
    pub(super) fn reserve_flagged(
        &self,
        count: u32,
        aligned: bool,
        window: IrqRange,
        flags: DescFlags,
    ) -> IrqResult<Irq> {
        if count == 0 {
            return Err(IrqError::InvalidArgument);
        }
        if count > MAX_RESERVATION {
            log::debug!("irq: reservation of {} exceeds {}", count, MAX_RESERVATION);
            return Err(IrqError::NotFound);
        }

        let end = window.end.min(self.limit());
        let _range = self.range_lock();

        let mut base = window.start;
        while base < end && end - base >= count {
            match self.try_reserve(base, count, flags) {
                Ok(()) => {
                    log::debug!("irq: reserved {}..{}", base, base + count);
                    return Ok(base);
                },
                Err(offset) if aligned => {
                    // Skip whole blocks the failing slot rules out
                    base += (offset / count + 1) * count;
                },
                Err(offset) => base += offset + 1,
            }
        }

        log::debug!(
            "irq: no {}block of {} in {}..{}",
            if aligned { "aligned " } else { "" },
            count,
            window.start,
            end
        );
        Err(IrqError::NotFound)
    }

    /// Mark `base..base + count` reserved, or return the offset of the first
    /// slot that is not free after undoing the ones already marked
    fn try_reserve(&self, base: Irq, count: u32, flags: DescFlags) -> Result<(), u32> {
        for offset in 0..count {
            if !self.mark_reserved(base + offset, flags) {
                for undo in 0..offset {
                    self.unmark_reserved(base + undo, flags);
                }
                return Err(offset);
            }
        }
        Ok(())
    }

    fn mark_reserved(&self, irq: Irq, flags: DescFlags) -> bool {
        let Some(desc) = self.lookup(irq) else {
            return false;
        };
        let (_irq_guard, mut action) = self.lock_action(desc);
        if !desc.is_allocated() || !matches!(action.handler, Handler::Unhandled) {
            return false;
        }
        action.handler = Handler::Reserved;
        desc.insert_flags(DescFlags::RESERVED | flags);
        true
    }

    fn unmark_reserved(&self, irq: Irq, flags: DescFlags) {
        if let Some(desc) = self.lookup(irq) {
            let (_irq_guard, mut action) = self.lock_action(desc);
            if matches!(action.handler, Handler::Reserved) {
                action.handler = Handler::Unhandled;
            }
            desc.remove_flags(DescFlags::RESERVED | flags);
        }
    }

    /// Return a reserved block to unhandled
    ///
    /// Every slot must still be reserved; slots that already received a
    /// handler are released with [`remove_handler`](Self::remove_handler).
    pub fn release_reserved_range(&self, base: Irq, count: u32) -> IrqResult<()> {
        self.release_flagged(base, count, DescFlags::empty())
    }

    /// Release a reserved block and clear `flags` from it under the range
    /// lock
    pub(super) fn release_flagged(
        &self,
        base: Irq,
        count: u32,
        flags: DescFlags,
    ) -> IrqResult<()> {
        if count == 0 {
            return Err(IrqError::InvalidArgument);
        }
        let end = base.checked_add(count).ok_or(IrqError::InvalidIrq)?;
        if end > self.limit() {
            return Err(IrqError::InvalidIrq);
        }

        let _range = self.range_lock();
        for irq in base..end {
            let desc = self.lookup(irq).ok_or(IrqError::NotAllocated)?;
            let (_irq_guard, action) = self.lock_action(desc);
            if !matches!(action.handler, Handler::Reserved) {
                return Err(IrqError::RangeMismatch);
            }
        }
        for irq in base..end {
            self.unmark_reserved(irq, flags);
        }

        log::debug!("irq: released reservation {}..{}", base, end);
        Ok(())
    }
}

impl<S: DescriptorStore> IrqSubsystem<S> {
    /// Reserve a block of MSI interrupts from the configured windows
    ///
    /// Windows are tried in order. The reserved slots are flagged
    /// [`DescFlags::MSI`] before the range lock is dropped.
    pub fn reserve_msi(&self, count: u32, aligned: bool) -> IrqResult<Irq> {
        if count > self.config().max_reservation {
            return Err(IrqError::NotFound);
        }

        for window in &self.config().msi_windows {
            match self
                .table()
                .reserve_flagged(count, aligned, *window, DescFlags::MSI)
            {
                Ok(base) => return Ok(base),
                Err(IrqError::NotFound) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(IrqError::NotFound)
    }

    /// Release a block obtained from [`reserve_msi`](Self::reserve_msi)
    pub fn release_msi(&self, base: Irq, count: u32) -> IrqResult<()> {
        self.table().release_flagged(base, count, DescFlags::MSI)
    }
}
