//! # Dispatch
//!
//! Glue between a trap entry and the descriptor table.
//!
//! Two entry styles exist:
//!
//! - **Vectored** (x86_64): the vector is the interrupt number. The trap
//!   entry calls [`IrqSubsystem::handle_vectored`], which dispatches and then
//!   signals EOI to the owning controller, if any.
//! - **Acknowledged** (GIC, PLIC): the trap entry only knows which CPU took
//!   it. [`IrqSubsystem::handle_acked`] claims the line from the CPU's
//!   controller, maps it to an interrupt number, dispatches and completes.
//!
//! The handler always runs outside the descriptor lock, on a copy of the
//! (handler, state) pair taken under it.

use kestrel_hal::CpuId;

use super::descriptor::{DescFlags, Handler, IrqFrame, IrqReturn};
use super::device::{AckOutcome, DevError, DevOutcome, IrqDevice, IrqStatus};
use super::store::{DescriptorStore, KernelStore};
use super::{Irq, IrqError, IrqResult, IrqSubsystem};

impl<S: DescriptorStore> IrqSubsystem<S> {
    /// Run the handler of `irq`, delivered through raw `vector`
    ///
    /// # Panics
    ///
    /// Panics if `irq` has no allocated descriptor. Hardware raised a line
    /// nobody allocated, so interrupt routing is misconfigured.
    pub fn dispatch(&self, irq: Irq, vector: u32) -> IrqReturn {
        let Some(desc) = self.table.lookup(irq) else {
            panic!("irq: no descriptor for irq {} (vector {:#x})", irq, vector);
        };

        let handler = {
            let (_irq_guard, action) = self.table.lock_action(desc);
            action.handler.clone()
        };

        let ret = match handler {
            Handler::Installed { func, state } => {
                let frame = IrqFrame {
                    irq,
                    vector,
                    cpu: self.arch.current_cpu(),
                };
                func(&frame, state.as_ref())
            },
            Handler::Unhandled => {
                log::warn!("irq: {} fired with no handler", irq);
                IrqReturn::NotHandled
            },
            Handler::Reserved => {
                log::error!("irq: {} fired while reserved", irq);
                IrqReturn::NotHandled
            },
        };
        desc.count_trigger();

        if let IrqReturn::Failed(code) = ret {
            log::warn!("irq: handler for {} failed with {}", irq, code);
        }
        ret
    }

    /// Vectored trap entry: dispatch `vector` as an interrupt number, then
    /// EOI its controller
    ///
    /// The handler has run even when the EOI fails; the error means the
    /// line was left uncompleted.
    pub fn handle_vectored(&self, vector: u32) -> IrqResult<IrqReturn> {
        let ret = self.dispatch(vector, vector);
        if let Some((device, hwirq)) = self.table.controller_of(vector) {
            Self::complete(&device, self.arch.current_cpu(), hwirq)?;
        }
        Ok(ret)
    }

    /// Acknowledged trap entry for `cpu`
    ///
    /// Returns `Ok(None)` when there was nothing to run: a spurious claim or
    /// one the controller rejected.
    pub fn handle_acked(&self, cpu: CpuId) -> IrqResult<Option<IrqReturn>> {
        let device = self
            .devices
            .cpu_controller(cpu)
            .ok_or(IrqError::NoController)?;
        let controller = device.controller();

        match controller.ack(cpu) {
            AckOutcome::Claimed(hwirq) => {
                let irq = match controller.revmap(hwirq) {
                    DevOutcome::Done(irq) => irq,
                    DevOutcome::Unimplemented => hwirq,
                    DevOutcome::Failed(err) => {
                        log::error!(
                            "irq: {} cannot map line {}: {}",
                            device.name(),
                            hwirq,
                            err
                        );
                        return Self::complete(&device, cpu, hwirq)
                            .and(Err(IrqError::Controller(err)));
                    },
                };
                let ret = self.dispatch(irq, hwirq);
                Self::complete(&device, cpu, hwirq)?;
                Ok(Some(ret))
            },
            AckOutcome::EoiBeforeReturn(hwirq) => {
                log::warn!("irq: {} rejected claim of line {}", device.name(), hwirq);
                Self::complete(&device, cpu, hwirq)?;
                Ok(None)
            },
            AckOutcome::ReturnWithoutEoi => Ok(None),
            AckOutcome::Unimplemented => Err(IrqError::Controller(DevError::Unsupported)),
        }
    }

    fn complete(device: &IrqDevice, cpu: CpuId, hwirq: u32) -> IrqResult<()> {
        match device.controller().eoi(cpu, hwirq) {
            DevOutcome::Done(()) | DevOutcome::Unimplemented => Ok(()),
            DevOutcome::Failed(err) => {
                log::error!("irq: {} eoi of line {} failed: {}", device.name(), hwirq, err);
                Err(IrqError::Controller(err))
            },
        }
    }

    // ========================================================================
    // Line control
    // ========================================================================

    fn checked(&self, irq: Irq) -> IrqResult<()> {
        if irq >= self.table.limit() {
            return Err(IrqError::InvalidIrq);
        }
        if !self.table.is_allocated(irq) {
            return Err(IrqError::NotAllocated);
        }
        Ok(())
    }

    /// Mask an interrupt at its controller, or at the architecture level
    /// when no controller owns it
    pub fn mask_irq(&self, irq: Irq) -> IrqResult<()> {
        self.checked(irq)?;
        match self.table.controller_of(irq) {
            Some((device, hwirq)) => device.controller().disable(hwirq)?,
            None => self.arch.disable_line(irq)?,
        }
        log::debug!("irq: masked {}", irq);
        Ok(())
    }

    /// Unmask an interrupt; the counterpart of [`mask_irq`](Self::mask_irq)
    pub fn unmask_irq(&self, irq: Irq) -> IrqResult<()> {
        self.checked(irq)?;
        match self.table.controller_of(irq) {
            Some((device, hwirq)) => device.controller().enable(hwirq)?,
            None => self.arch.enable_line(irq)?,
        }
        log::debug!("irq: unmasked {}", irq);
        Ok(())
    }

    /// Controller-reported status of an interrupt
    pub fn irq_status(&self, irq: Irq) -> IrqResult<IrqStatus> {
        self.checked(irq)?;
        let (device, hwirq) = self
            .table
            .controller_of(irq)
            .ok_or(IrqError::NoController)?;
        Ok(device.controller().status(hwirq))
    }

    /// Raise an inter-processor interrupt on `cpu`
    ///
    /// `irq` must be allocated with [`DescFlags::IPI`].
    pub fn send_ipi(&self, irq: Irq, cpu: CpuId) -> IrqResult<()> {
        if !self.table.flags(irq)?.contains(DescFlags::IPI) {
            return Err(IrqError::InvalidArgument);
        }
        let (device, hwirq) = self
            .table
            .controller_of(irq)
            .ok_or(IrqError::NoController)?;
        match device.controller().send_ipi(cpu, hwirq) {
            DevOutcome::Done(()) => Ok(()),
            DevOutcome::Failed(err) => Err(IrqError::Controller(err)),
            DevOutcome::Unimplemented => Err(IrqError::Controller(DevError::Unsupported)),
        }
    }
}

// ============================================================================
// Trap entry
// ============================================================================

/// Low-level stub the architecture calls for a vector
fn low_level_entry(vector: u32, _state: usize) -> bool {
    match super::get() {
        Ok(irqs) => irqs.handle_vectored(vector) == Ok(IrqReturn::Handled),
        Err(err) => {
            log::error!("irq: vector {:#x} before init: {}", vector, err);
            false
        },
    }
}

impl IrqSubsystem<KernelStore> {
    /// Route the architecture trap for vector `irq` into the kernel instance
    pub fn install_trap_entry(&self, irq: Irq) -> IrqResult<()> {
        self.checked(irq)?;
        self.arch.install_low_level_handler(irq, low_level_entry, 0)?;
        log::debug!("irq: trap entry installed for {:#x}", irq);
        Ok(())
    }

    /// Remove a trap entry installed by
    /// [`install_trap_entry`](Self::install_trap_entry)
    pub fn uninstall_trap_entry(&self, irq: Irq) -> IrqResult<()> {
        self.arch.uninstall_low_level_handler(irq)?;
        log::debug!("irq: trap entry removed for {:#x}", irq);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interrupts::descriptor::HandlerState;
    use crate::interrupts::device::ControllerFamily;
    use crate::interrupts::store::DenseStore;
    use crate::interrupts::table::RangeRequest;
    use crate::interrupts::testing::{hosted, MockController};
    use crate::interrupts::IrqConfig;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{AtomicU64, Ordering};
    use kestrel_hal::arch::hosted::Hosted;
    use std::sync::Barrier;
    use std::thread;

    fn config() -> IrqConfig {
        IrqConfig {
            capacity: 128,
            msi_windows: Vec::new(),
            max_reservation: 8,
        }
    }

    fn subsystem() -> IrqSubsystem<DenseStore> {
        IrqSubsystem::new(config(), hosted()).unwrap()
    }

    fn counting(_frame: &IrqFrame, state: Option<&HandlerState>) -> IrqReturn {
        match state.and_then(|state| state.downcast_ref::<AtomicU64>()) {
            Some(count) => {
                count.fetch_add(1, Ordering::Relaxed);
                IrqReturn::Handled
            },
            None => IrqReturn::Failed(-22),
        }
    }

    fn report_cpu(frame: &IrqFrame, _state: Option<&HandlerState>) -> IrqReturn {
        IrqReturn::Failed(frame.cpu as i32)
    }

    fn handled(_frame: &IrqFrame, _state: Option<&HandlerState>) -> IrqReturn {
        IrqReturn::Handled
    }

    #[test]
    fn test_concurrent_dispatch_counts_exactly() {
        const CORES: usize = 8;
        const ROUNDS: u64 = 1000;

        let irqs = Arc::new(subsystem());
        let irq = irqs.allocate_range(1, 32).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        irqs.install_handler(irq, counting, Some(count.clone() as HandlerState))
            .unwrap();
        let barrier = Arc::new(Barrier::new(CORES));

        let handles: Vec<_> = (0..CORES)
            .map(|_| {
                let irqs = Arc::clone(&irqs);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..ROUNDS {
                        assert_eq!(irqs.dispatch(irq, irq), IrqReturn::Handled);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let expected = CORES as u64 * ROUNDS;
        assert_eq!(irqs.table().lookup(irq).unwrap().triggered(), expected);
        assert_eq!(count.load(Ordering::Relaxed), expected);
    }

    #[test]
    #[should_panic(expected = "no descriptor")]
    fn test_dispatch_of_unallocated_irq_panics() {
        subsystem().dispatch(7, 7);
    }

    #[test]
    fn test_dispatch_without_handler() {
        let irqs = subsystem();
        let irq = irqs.allocate_range(2, 0).unwrap();
        assert_eq!(irqs.dispatch(irq, 0), IrqReturn::NotHandled);

        irqs.table()
            .find_and_reserve_range(1, false, kestrel_hal::IrqRange::new(1, 2))
            .unwrap();
        assert_eq!(irqs.dispatch(irq + 1, 1), IrqReturn::NotHandled);
        assert_eq!(irqs.table().lookup(irq).unwrap().triggered(), 1);
    }

    #[test]
    fn test_handler_sees_current_cpu() {
        let arch: &'static Hosted = Box::leak(Box::new(Hosted::new()));
        let irqs = IrqSubsystem::<DenseStore>::new(config(), arch).unwrap();
        let irq = irqs.allocate_range(1, 0).unwrap();
        irqs.install_handler(irq, report_cpu, None).unwrap();

        arch.set_current_cpu(3);
        assert_eq!(irqs.dispatch(irq, 0x99), IrqReturn::Failed(3));
    }

    #[test]
    fn test_vectored_entry_signals_eoi() {
        let irqs = subsystem();
        let (apic, state) = MockController::new(ControllerFamily::LocalApic);
        let apic = irqs.register_controller("apic", Box::new(apic)).unwrap();

        let request = RangeRequest::new(2).starting_at(0x40).with_controller(apic, 7);
        let base = irqs.table().allocate(&request).unwrap();
        irqs.install_handler(base + 1, handled, None).unwrap();
        let bare = irqs.allocate_range(1, 0x50).unwrap();

        assert_eq!(irqs.handle_vectored(base + 1), Ok(IrqReturn::Handled));
        assert_eq!(irqs.handle_vectored(bare), Ok(IrqReturn::NotHandled));
        assert_eq!(*state.eois.lock(), [8]);
    }

    #[test]
    fn test_vectored_entry_reports_failed_eoi() {
        let irqs = subsystem();
        let (pic, state) = MockController::new(ControllerFamily::LegacyPic);
        let pic = irqs
            .register_controller("pic", Box::new(pic.with_lines(16)))
            .unwrap();

        // Line 20 is past the controller's last line, so its EOI fails
        let request = RangeRequest::new(1).starting_at(0x60).with_controller(pic, 20);
        let irq = irqs.table().allocate(&request).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        irqs.install_handler(irq, counting, Some(count.clone() as HandlerState))
            .unwrap();

        assert_eq!(
            irqs.handle_vectored(irq),
            Err(IrqError::Controller(DevError::InvalidLine))
        );
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert!(state.eois.lock().is_empty());
    }

    #[test]
    fn test_acked_entry_flows() {
        let irqs = subsystem();
        let (gic, state) = MockController::new(ControllerFamily::GicV2);
        irqs.register_controller("gic", Box::new(gic.with_revmap(32)))
            .unwrap();
        assert_eq!(irqs.handle_acked(0), Err(IrqError::NoController));
        irqs.devices().assign_all_cpus("gic").unwrap();

        let base = irqs.allocate_range(4, 32).unwrap();
        let count = Arc::new(AtomicU64::new(0));
        irqs.install_handler(base + 2, counting, Some(count.clone() as HandlerState))
            .unwrap();

        state.pending.lock().extend([
            AckOutcome::Claimed(2),
            AckOutcome::EoiBeforeReturn(9),
            AckOutcome::Unimplemented,
        ]);

        assert_eq!(irqs.handle_acked(0), Ok(Some(IrqReturn::Handled)));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        assert_eq!(irqs.handle_acked(1), Ok(None));
        assert_eq!(
            irqs.handle_acked(0),
            Err(IrqError::Controller(DevError::Unsupported))
        );
        // Spurious: nothing pending, nothing completed
        assert_eq!(irqs.handle_acked(0), Ok(None));
        assert_eq!(*state.eois.lock(), [2, 9]);
    }

    #[test]
    fn test_acked_entry_identity_mapping() {
        let irqs = subsystem();
        let (plic, state) = MockController::new(ControllerFamily::Plic);
        irqs.register_controller("plic", Box::new(plic)).unwrap();
        irqs.devices().assign_cpu("plic", 1).unwrap();

        let irq = irqs.allocate_range(1, 10).unwrap();
        irqs.install_handler(irq, handled, None).unwrap();
        state.pending.lock().push_back(AckOutcome::Claimed(10));

        assert_eq!(irqs.handle_acked(1), Ok(Some(IrqReturn::Handled)));
        assert_eq!(irqs.table().lookup(irq).unwrap().triggered(), 1);
        assert_eq!(irqs.handle_acked(0), Err(IrqError::NoController));
    }

    #[test]
    fn test_mask_falls_back_to_arch_lines() {
        let arch: &'static Hosted = Box::leak(Box::new(Hosted::new()));
        let irqs = IrqSubsystem::<DenseStore>::new(config(), arch).unwrap();
        let irq = irqs.allocate_range(1, 5).unwrap();

        irqs.unmask_irq(irq).unwrap();
        assert!(arch.line_enabled(irq));
        irqs.mask_irq(irq).unwrap();
        assert!(!arch.line_enabled(irq));

        assert_eq!(irqs.mask_irq(6), Err(IrqError::NotAllocated));
        assert_eq!(irqs.unmask_irq(128), Err(IrqError::InvalidIrq));
        assert_eq!(irqs.irq_status(irq), Err(IrqError::NoController));
    }

    #[test]
    fn test_mask_routes_to_controller() {
        let arch: &'static Hosted = Box::leak(Box::new(Hosted::new()));
        let irqs = IrqSubsystem::<DenseStore>::new(config(), arch).unwrap();
        let (pic, state) = MockController::new(ControllerFamily::LegacyPic);
        let pic = irqs
            .register_controller("pic", Box::new(pic.with_lines(16)))
            .unwrap();

        let request = RangeRequest::new(1).with_controller(Arc::clone(&pic), 4);
        let irq = irqs.table().allocate(&request).unwrap();
        irqs.unmask_irq(irq).unwrap();
        assert!(state.enabled.lock().contains(&4));
        assert!(!arch.line_enabled(irq));
        assert_eq!(irqs.irq_status(irq), Ok(IrqStatus::ENABLED));

        irqs.mask_irq(irq).unwrap();
        assert!(state.enabled.lock().is_empty());

        // A line the controller does not have
        let request = RangeRequest::new(1).with_controller(pic, 40);
        let bad = irqs.table().allocate(&request).unwrap();
        assert_eq!(
            irqs.unmask_irq(bad),
            Err(IrqError::Controller(DevError::InvalidLine))
        );
    }

    #[test]
    fn test_send_ipi() {
        let irqs = subsystem();
        let (gic, state) = MockController::new(ControllerFamily::GicV3);
        let gic = irqs.register_controller("gic", Box::new(gic)).unwrap();

        let request = RangeRequest::new(1)
            .with_controller(Arc::clone(&gic), 1)
            .with_flags(DescFlags::IPI);
        let ipi = irqs.table().allocate(&request).unwrap();
        irqs.send_ipi(ipi, 2).unwrap();
        assert_eq!(*state.ipis.lock(), [(2, 1)]);

        let plain = irqs
            .table()
            .allocate(&RangeRequest::new(1).with_controller(gic, 2))
            .unwrap();
        assert_eq!(irqs.send_ipi(plain, 2), Err(IrqError::InvalidArgument));
        assert_eq!(irqs.send_ipi(100, 0), Err(IrqError::NotAllocated));
    }

    #[test]
    fn test_arch_backend_name() {
        let irqs = subsystem();
        assert_eq!(irqs.arch().name(), "hosted");
    }
}
