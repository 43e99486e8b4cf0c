//! Test doubles shared by the interrupt unit tests.

use alloc::boxed::Box;
use alloc::collections::{BTreeSet, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_hal::arch::hosted::Hosted;
use kestrel_hal::{ArchInterrupts, CpuId};
use spin::Mutex;

use super::device::{
    AckOutcome, Characteristics, ControllerCaps, ControllerFamily, DevError, DevOutcome,
    IrqController, IrqStatus,
};
use super::Irq;

/// A private hosted backend for one test
pub(crate) fn hosted() -> &'static dyn ArchInterrupts {
    Box::leak(Box::new(Hosted::new()))
}

/// How the mock answers `initialize_cpu`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InitMode {
    Unimplemented,
    Succeed,
    Fail,
}

/// Everything the mock records, shared with the test
#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub(crate) pending: Mutex<VecDeque<AckOutcome>>,
    pub(crate) eois: Mutex<Vec<u32>>,
    pub(crate) inits: Mutex<Vec<CpuId>>,
    pub(crate) enabled: Mutex<BTreeSet<u32>>,
    pub(crate) ipis: Mutex<Vec<(CpuId, u32)>>,
}

/// Scriptable controller
pub(crate) struct MockController {
    family: ControllerFamily,
    lines: u32,
    init: InitMode,
    revmap_base: Option<Irq>,
    advertise: bool,
    state: Arc<MockState>,
}

impl MockController {
    pub(crate) fn new(family: ControllerFamily) -> (Self, Arc<MockState>) {
        let state = Arc::new(MockState::default());
        let mock = Self {
            family,
            lines: 64,
            init: InitMode::Unimplemented,
            revmap_base: None,
            advertise: true,
            state: Arc::clone(&state),
        };
        (mock, state)
    }

    pub(crate) fn with_lines(mut self, lines: u32) -> Self {
        self.lines = lines;
        self
    }

    pub(crate) fn with_init(mut self, init: InitMode) -> Self {
        self.init = init;
        self
    }

    /// Translate hwirq `n` to `base + n`
    pub(crate) fn with_revmap(mut self, base: Irq) -> Self {
        self.revmap_base = Some(base);
        self
    }

    pub(crate) fn without_characteristics(mut self) -> Self {
        self.advertise = false;
        self
    }
}

impl IrqController for MockController {
    fn family(&self) -> ControllerFamily {
        self.family
    }

    fn characteristics(&self) -> DevOutcome<Characteristics> {
        if !self.advertise {
            return DevOutcome::Unimplemented;
        }
        DevOutcome::Done(Characteristics {
            family: self.family,
            num_lines: self.lines,
            caps: ControllerCaps::ACK | ControllerCaps::EOI,
        })
    }

    fn initialize_cpu(&self, cpu: CpuId) -> DevOutcome<()> {
        match self.init {
            InitMode::Unimplemented => DevOutcome::Unimplemented,
            InitMode::Succeed => {
                self.state.inits.lock().push(cpu);
                DevOutcome::Done(())
            },
            InitMode::Fail => DevOutcome::Failed(DevError::Hardware(-5)),
        }
    }

    fn ack(&self, _cpu: CpuId) -> AckOutcome {
        self.state
            .pending
            .lock()
            .pop_front()
            .unwrap_or(AckOutcome::ReturnWithoutEoi)
    }

    fn eoi(&self, _cpu: CpuId, hwirq: u32) -> DevOutcome<()> {
        if hwirq >= self.lines {
            return DevOutcome::Failed(DevError::InvalidLine);
        }
        self.state.eois.lock().push(hwirq);
        DevOutcome::Done(())
    }

    fn enable(&self, hwirq: u32) -> Result<(), DevError> {
        if hwirq >= self.lines {
            return Err(DevError::InvalidLine);
        }
        self.state.enabled.lock().insert(hwirq);
        Ok(())
    }

    fn disable(&self, hwirq: u32) -> Result<(), DevError> {
        if hwirq >= self.lines {
            return Err(DevError::InvalidLine);
        }
        self.state.enabled.lock().remove(&hwirq);
        Ok(())
    }

    fn status(&self, hwirq: u32) -> IrqStatus {
        if hwirq >= self.lines {
            return IrqStatus::ERROR;
        }
        let mut status = IrqStatus::empty();
        if self.state.enabled.lock().contains(&hwirq) {
            status |= IrqStatus::ENABLED;
        }
        if self.state.pending.lock().contains(&AckOutcome::Claimed(hwirq)) {
            status |= IrqStatus::PENDING;
        }
        status
    }

    fn revmap(&self, hwirq: u32) -> DevOutcome<Irq> {
        match self.revmap_base {
            Some(base) => DevOutcome::Done(base + hwirq),
            None => DevOutcome::Unimplemented,
        }
    }

    fn send_ipi(&self, cpu: CpuId, hwirq: u32) -> DevOutcome<()> {
        self.state.ipis.lock().push((cpu, hwirq));
        DevOutcome::Done(())
    }
}
