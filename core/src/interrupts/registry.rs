//! # Controller Registry
//!
//! Named interrupt controllers and their CPU bindings.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use kestrel_hal::{CpuId, MAX_CPUS};
use spin::RwLock;

use super::device::{CpuBinding, CpuMask, DevOutcome, IrqController, IrqDevice};
use super::{IrqError, IrqResult};

/// Registry of interrupt controllers, keyed by unique name
#[derive(Debug)]
pub struct IrqDevices {
    devices: RwLock<BTreeMap<String, Arc<IrqDevice>>>,
}

impl IrqDevices {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            devices: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a controller driver
    ///
    /// If the driver reports characteristics they must be self-consistent:
    /// the family matches [`IrqController::family`] and at least one line
    /// exists.
    pub fn register(
        &self,
        name: &str,
        controller: Box<dyn IrqController>,
    ) -> IrqResult<Arc<IrqDevice>> {
        if name.is_empty() {
            return Err(IrqError::InvalidArgument);
        }

        let family = controller.family();
        match controller.characteristics() {
            DevOutcome::Done(chars) => {
                if chars.family != family || chars.num_lines == 0 {
                    log::error!(
                        "irq: controller {} reports inconsistent characteristics {:?}",
                        name,
                        chars
                    );
                    return Err(IrqError::InvalidArgument);
                }
                log::debug!(
                    "irq: controller {} has {} lines, caps {:?}",
                    name,
                    chars.num_lines,
                    chars.caps
                );
            },
            DevOutcome::Failed(err) => return Err(IrqError::Controller(err)),
            DevOutcome::Unimplemented => {},
        }

        let mut devices = self.devices.write();
        if devices.contains_key(name) {
            return Err(IrqError::AlreadyExists);
        }
        let device = Arc::new(IrqDevice::new(name, controller));
        devices.insert(String::from(name), Arc::clone(&device));

        log::info!("irq: registered controller {} ({})", name, family);
        Ok(device)
    }

    /// Remove a controller from the registry
    ///
    /// Descriptors bound to it keep their reference; callers unbind them
    /// first.
    pub fn unregister(&self, name: &str) -> IrqResult<Arc<IrqDevice>> {
        let device = self
            .devices
            .write()
            .remove(name)
            .ok_or(IrqError::NotFound)?;
        log::info!("irq: unregistered controller {}", name);
        Ok(device)
    }

    /// Find a controller by name
    pub fn find(&self, name: &str) -> Option<Arc<IrqDevice>> {
        let device = self.devices.read().get(name).cloned();
        if device.is_none() {
            log::debug!("irq: no controller named {}", name);
        }
        device
    }

    /// Every controller, ordered by name
    pub fn list(&self) -> Vec<Arc<IrqDevice>> {
        self.devices.read().values().cloned().collect()
    }

    /// Number of registered controllers
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Check if no controller is registered
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    // ========================================================================
    // CPU binding
    // ========================================================================

    fn bind(&self, name: &str, binding: CpuBinding) -> IrqResult<()> {
        let device = self.find(name).ok_or(IrqError::NotFound)?;
        device.set_binding(binding);
        log::debug!("irq: controller {} bound to {:?}", name, binding);
        Ok(())
    }

    /// Bind a controller to one CPU
    pub fn assign_cpu(&self, name: &str, cpu: CpuId) -> IrqResult<()> {
        if cpu as usize >= MAX_CPUS {
            return Err(IrqError::InvalidArgument);
        }
        self.bind(name, CpuBinding::Cpu(cpu))
    }

    /// Bind a controller to every CPU
    pub fn assign_all_cpus(&self, name: &str) -> IrqResult<()> {
        self.bind(name, CpuBinding::All)
    }

    /// Bind a controller to a subset of CPUs
    pub fn assign_cpus(&self, name: &str, cpus: CpuMask) -> IrqResult<()> {
        if cpus.is_empty() {
            return Err(IrqError::InvalidArgument);
        }
        self.bind(name, CpuBinding::Set(cpus))
    }

    /// Run per-CPU initialisation of every controller bound to `cpu`
    ///
    /// Controllers without a per-CPU step are skipped. Every controller is
    /// tried; the first failure is returned. On success, returns how many
    /// controllers ran an initialisation step.
    pub fn initialize_cpu(&self, cpu: CpuId) -> IrqResult<usize> {
        let mut initialized = 0;
        let mut first_error = None;

        for device in self.list() {
            if !device.services(cpu) {
                continue;
            }
            match device.controller().initialize_cpu(cpu) {
                DevOutcome::Done(()) => initialized += 1,
                DevOutcome::Unimplemented => {},
                DevOutcome::Failed(err) => {
                    log::error!(
                        "irq: controller {} failed to initialize cpu {}: {}",
                        device.name(),
                        cpu,
                        err
                    );
                    first_error.get_or_insert(IrqError::Controller(err));
                },
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(initialized),
        }
    }

    /// Controller that fields interrupts on `cpu`
    ///
    /// A controller naming the CPU explicitly wins over one bound to all
    /// CPUs.
    pub fn cpu_controller(&self, cpu: CpuId) -> Option<Arc<IrqDevice>> {
        let devices = self.devices.read();
        devices
            .values()
            .find(|device| device.binding().names(cpu))
            .or_else(|| devices.values().find(|device| device.services(cpu)))
            .cloned()
    }
}

impl Default for IrqDevices {
    fn default() -> Self {
        Self::new()
    }
}
