//! The devpci service: one selected backend and its device registry.
//!
//! Callers either own a [`DevPci`] or use the process-wide instance behind
//! the free functions of this crate. The process-wide instance is created
//! by [`init`] or, failing that, by the first call that needs it.

use std::ptr::NonNull;
use std::sync::{Arc, Mutex, PoisonError};

use crate::backend::{self, Backend};
use crate::config::Config;
use crate::device::{DeviceRef, PciAddress};
use crate::error::PciError;
use crate::id::PciId;
use crate::isr::IsrHandler;
use crate::registry::Visit;

/// A selected backend.
///
/// Dropping the service disconnects every interrupt registration and then
/// releases every BAR mapping.
pub struct DevPci {
    backend: Box<dyn Backend>,
}

impl DevPci {
    /// Selects and builds a backend.
    ///
    /// `name` overrides `config.backend`. Any failure of the backend's own
    /// construction is reported as `InitFailed`.
    pub fn open(config: &Config, name: Option<&str>) -> Result<Self, PciError> {
        let name = name.unwrap_or(&config.backend);
        let entry = backend::lookup(name)?;
        let backend = (entry.init)(config).map_err(|e| {
            log::error!("devpci: backend '{}' failed to start: {e}", entry.name);
            PciError::InitFailed
        })?;
        log::info!("devpci: using backend '{}'", backend.name());
        Ok(Self { backend })
    }

    /// Wraps an already built backend.
    #[must_use]
    pub fn with_backend(backend: Box<dyn Backend>) -> Self {
        Self { backend }
    }

    /// Name of the selected backend.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    /// The selected backend.
    #[must_use]
    pub fn backend(&self) -> &dyn Backend {
        &*self.backend
    }

    /// Visits every device matching at least one of `patterns`.
    ///
    /// See [`Registry::find`](crate::registry::Registry::find).
    pub fn find(
        &self,
        patterns: &[PciId],
        mut visit: impl FnMut(&DeviceRef) -> Result<Visit, PciError>,
    ) -> Result<(), PciError> {
        self.backend.find(patterns, &mut visit)
    }

    /// Returns the matching device at `bus:slot.function`.
    pub fn find_bdf(
        &self,
        patterns: &[PciId],
        bus: u8,
        slot: u8,
        function: u8,
    ) -> Result<DeviceRef, PciError> {
        let address = PciAddress::new(bus, slot, function);
        let mut found = None;
        self.find(patterns, |dev| {
            if dev.address() == address {
                found = Some(Arc::clone(dev));
                Ok(Visit::Stop)
            } else {
                Ok(Visit::Continue)
            }
        })?;
        found.ok_or(PciError::NoSuchDevice)
    }

    /// Maps a memory BAR and returns a pointer to its first byte.
    pub fn map_bar(&self, dev: &DeviceRef, bar: usize) -> Result<NonNull<u8>, PciError> {
        self.backend.map_bar(dev, bar)
    }

    /// Returns a BAR's length, probing the hardware when it was not reported.
    pub fn bar_length(&self, dev: &DeviceRef, bar: usize) -> Result<u32, PciError> {
        self.backend.bar_length(dev, bar)
    }

    /// Calls `handler(param)` on a dedicated thread after every interrupt.
    pub fn connect_interrupt(
        &self,
        dev: &DeviceRef,
        handler: IsrHandler,
        param: usize,
    ) -> Result<(), PciError> {
        self.backend.connect_interrupt(dev, handler, param)
    }

    /// Removes a registration; returns once its thread has exited.
    pub fn disconnect_interrupt(
        &self,
        dev: &DeviceRef,
        handler: IsrHandler,
        param: usize,
    ) -> Result<(), PciError> {
        self.backend.disconnect_interrupt(dev, handler, param)
    }
}

impl Drop for DevPci {
    fn drop(&mut self) {
        self.backend.teardown();
    }
}

impl core::fmt::Debug for DevPci {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DevPci").field("backend", &self.name()).finish()
    }
}

// ---------------------------------------------------------------------------
// Process-wide instance
// ---------------------------------------------------------------------------

static GLOBAL: Mutex<Option<Arc<DevPci>>> = Mutex::new(None);

fn open_default(name: Option<&str>) -> Result<Arc<DevPci>, PciError> {
    let config = Config::load()?;
    DevPci::open(&config, name).map(Arc::new)
}

/// Selects the process-wide backend.
///
/// `None` picks the configured default. Only one selection is allowed
/// until [`shutdown`]; a second one fails with `AlreadyInitialized`.
pub fn init(name: Option<&str>) -> Result<(), PciError> {
    let mut global = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(current) = global.as_ref() {
        log::error!("devpci: backend '{}' already selected", current.name());
        return Err(PciError::AlreadyInitialized);
    }
    *global = Some(open_default(name)?);
    Ok(())
}

/// The process-wide service, selecting the default backend on first use.
///
/// The global lock is only held while selecting, never while the service
/// runs, so visitors and interrupt handlers may call back into devpci.
pub fn global() -> Result<Arc<DevPci>, PciError> {
    let mut global = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(current) = global.as_ref() {
        return Ok(Arc::clone(current));
    }
    let service = open_default(None)?;
    *global = Some(Arc::clone(&service));
    Ok(service)
}

/// Tears down the process-wide service.
///
/// Every interrupt registration is disconnected before any mapping is
/// released. Afterwards a new backend may be selected. Does nothing when
/// no backend was selected.
pub fn shutdown() {
    let taken = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(service) = taken {
        log::info!("devpci: shutting down backend '{}'", service.name());
        // Callers still holding the service keep a torn-down registry.
        service.backend.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendEntry;
    use crate::backend::shared::SharedBackend;
    use crate::device::{PciBar, PciDeviceInfo};
    use crate::id::PciIdentity;
    use crate::isr::IsrTiming;
    use crate::testutil::{SimBus, SimConfig};
    use std::time::Duration;

    const EVR: PciId = PciId::new(0x1A3E, 0xE693);

    fn evr(bus: u8) -> PciDeviceInfo {
        let mut info = PciDeviceInfo {
            address: PciAddress::new(bus, 0, 0),
            id: PciIdentity {
                vendor: 0x1A3E,
                device: 0xE693,
                ..PciIdentity::default()
            },
            ..PciDeviceInfo::default()
        };
        info.bars[0] = PciBar::decode(0xFE00_0000, 0x1000);
        info
    }

    fn timing() -> IsrTiming {
        IsrTiming {
            disconnect_poll: Duration::from_millis(1),
            retry: Duration::from_millis(1),
            retry_max: Duration::from_millis(4),
        }
    }

    fn service() -> DevPci {
        let bus = SimBus::new()
            .with_device(evr(3), SimConfig::new())
            .with_device(evr(5), SimConfig::new());
        DevPci::with_backend(Box::new(SharedBackend::new("sim", bus, timing())))
    }

    fn ignore(_: usize) {}

    #[test]
    fn find_bdf_picks_the_address() {
        let pci = service();
        let dev = pci.find_bdf(&[EVR], 5, 0, 0).unwrap();
        assert_eq!(dev.address(), PciAddress::new(5, 0, 0));
        assert_eq!(pci.find_bdf(&[EVR], 4, 0, 0).unwrap_err(), PciError::NoSuchDevice);
    }

    #[test]
    fn visitor_may_map_through_the_service() {
        let pci = service();
        let mut mapped = 0;
        pci.find(&[EVR], |dev| {
            pci.map_bar(dev, 0)?;
            assert_eq!(pci.bar_length(dev, 0)?, 0x1000);
            mapped += 1;
            Ok(Visit::Continue)
        })
        .unwrap();
        assert_eq!(mapped, 2);
    }

    #[test]
    fn drop_disconnects_interrupts() {
        let pci = service();
        let dev = pci.find_bdf(&[EVR], 3, 0, 0).unwrap();
        pci.connect_interrupt(&dev, ignore, 1).unwrap();
        pci.connect_interrupt(&dev, ignore, 2).unwrap();
        assert_eq!(dev.interrupt_count(), 2);

        drop(pci);
        assert_eq!(dev.interrupt_count(), 0);
    }

    #[test]
    fn unknown_backend_is_rejected() {
        let err = DevPci::open(&Config::default(), Some("rtems")).unwrap_err();
        assert_eq!(err, PciError::UnknownBackend);
    }

    fn broken(_: &Config) -> Result<Box<dyn Backend>, PciError> {
        Err(PciError::ConfigAccess)
    }

    #[test]
    fn construction_failure_is_init_failed() {
        backend::register(BackendEntry {
            name: "service-test-broken",
            init: broken,
        })
        .unwrap();
        let err = DevPci::open(&Config::default(), Some("service-test-broken")).unwrap_err();
        assert_eq!(err, PciError::InitFailed);
    }

    #[test]
    fn configured_backend_is_selected() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            backend: "sysfs".into(),
            sysfs_devices: dir.path().to_path_buf(),
            ..Config::default()
        };
        let pci = DevPci::open(&config, None).unwrap();
        assert_eq!(pci.name(), "sysfs");
        assert_eq!(format!("{pci:?}"), "DevPci { backend: \"sysfs\" }");
    }
}
