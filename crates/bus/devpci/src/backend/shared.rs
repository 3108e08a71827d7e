//! Backend shell over a minimal platform interface.
//!
//! A platform that can enumerate devices by ID, map a bus window and reach
//! configuration space gets the whole API from [`SharedBackend`]: lazy
//! registry fill, search, page-aligned BAR mapping and length discovery.
//! Interrupts are available when the platform can open a waiter.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::{Backend, Visitor};
use crate::bar::{self, ConfigSpace, MapRequest, MappedRegion};
use crate::device::{DeviceRef, PciDeviceInfo};
use crate::error::PciError;
use crate::id::PciId;
use crate::isr::{self, IrqWait, IsrHandler, IsrTiming};
use crate::registry::Registry;

/// What a platform provides to [`SharedBackend`].
pub trait BusAccess: Send + Sync {
    /// Enumerates every function with the given vendor and device IDs.
    fn find(&self, vendor: u16, device: u16) -> Result<Vec<PciDeviceInfo>, PciError>;

    /// Maps the window described by `req`.
    fn map(&self, dev: &PciDeviceInfo, req: &MapRequest) -> Result<Box<dyn MappedRegion>, PciError>;

    /// Opens the device's configuration space.
    fn config(&self, dev: &PciDeviceInfo) -> Result<Box<dyn ConfigSpace>, PciError>;

    /// Opens a cancellable interrupt wait. Unsupported by default.
    fn open_irq(&self, dev: &PciDeviceInfo) -> Result<Arc<dyn IrqWait>, PciError> {
        let _ = dev;
        Err(PciError::NotSupported)
    }
}

/// Generic backend over a [`BusAccess`] platform.
pub struct SharedBackend<B> {
    name: &'static str,
    bus: B,
    registry: Registry,
    timing: IsrTiming,
    page_size: usize,
}

impl<B: BusAccess> SharedBackend<B> {
    /// Creates a backend with an empty registry.
    pub fn new(name: &'static str, bus: B, timing: IsrTiming) -> Self {
        Self {
            name,
            bus,
            registry: Registry::new(),
            timing,
            page_size: bar::page_size(),
        }
    }

    /// Overrides the host page size used to align mappings.
    #[must_use]
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// The platform interface.
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// The device registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl<B: BusAccess> Backend for SharedBackend<B> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn find(&self, patterns: &[PciId], visit: &mut Visitor<'_>) -> Result<(), PciError> {
        self.registry.fill(patterns, |vendor, device| self.bus.find(vendor, device))?;
        self.registry.find(patterns, visit)
    }

    fn map_bar(&self, dev: &DeviceRef, bar: usize) -> Result<NonNull<u8>, PciError> {
        if dev.bar(bar).ok_or(PciError::BadArgument)?.is_io() {
            return Err(PciError::NotSupported);
        }
        let len = self.bar_length(dev, bar)?;
        let info = dev.info();
        let mut state = dev.lock();
        bar::map_bar_locked(&mut state, info, bar, len, self.page_size, |_, req| {
            self.bus.map(info, req)
        })
    }

    fn bar_length(&self, dev: &DeviceRef, bar: usize) -> Result<u32, PciError> {
        let info = dev.info();
        let mut state = dev.lock();
        bar::bar_length_locked(&mut state, info, bar, |_| self.bus.config(info))
    }

    fn connect_interrupt(
        &self,
        dev: &DeviceRef,
        handler: IsrHandler,
        param: usize,
    ) -> Result<(), PciError> {
        isr::connect(dev, handler, param, self.timing, |_| self.bus.open_irq(dev.info()))
    }

    fn disconnect_interrupt(
        &self,
        dev: &DeviceRef,
        handler: IsrHandler,
        param: usize,
    ) -> Result<(), PciError> {
        isr::disconnect(dev, handler, param, self.timing)
    }

    fn teardown(&self) {
        self.registry.teardown(self.timing);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{PciAddress, PciBar};
    use crate::id::PciIdentity;
    use crate::isr::IsrState;
    use crate::registry::Visit;
    use crate::testutil::{SimBus, SimConfig, wait_for};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex, Weak};
    use std::time::Duration;

    const EVR: PciId = PciId::new(0x1A3E, 0xE693);

    fn timing() -> IsrTiming {
        IsrTiming {
            disconnect_poll: Duration::from_millis(2),
            ..IsrTiming::default()
        }
    }

    fn card(bus: u8, bar0: u64, len: u32) -> PciDeviceInfo {
        let mut info = PciDeviceInfo {
            address: PciAddress::new(bus, 0, 0),
            id: PciIdentity {
                vendor: 0x1A3E,
                device: 0xE693,
                ..PciIdentity::default()
            },
            irq: 0x10,
            ..PciDeviceInfo::default()
        };
        info.bars[0] = PciBar::decode(bar0, len);
        info.bars[1] = PciBar::decode(0xE001, 0x20);
        info
    }

    fn backend() -> SharedBackend<SimBus> {
        let cfg = SimConfig::new();
        cfg.set_bar(0, 0x0004_3000, 0x80);
        let bus = SimBus::new()
            .with_device(card(1, 0xFE00_0840, 0x80), SimConfig::new())
            .with_device(card(2, 0x0004_3000, 0), cfg);
        SharedBackend::new("sim", bus, timing()).with_page_size(4096)
    }

    fn first(be: &SharedBackend<SimBus>, patterns: &[PciId]) -> DeviceRef {
        let mut found = None;
        be.find(patterns, &mut |dev| {
            found = Some(Arc::clone(dev));
            Ok(Visit::Stop)
        })
        .unwrap();
        found.unwrap()
    }

    #[test]
    fn search_fills_registry_once() {
        let be = backend();
        for _ in 0..3 {
            let mut seen = 0;
            be.find(&[EVR, PciId::END], &mut |_| {
                seen += 1;
                Ok(Visit::Continue)
            })
            .unwrap();
            assert_eq!(seen, 2);
        }
        assert_eq!(be.bus().finds(), 1);
        assert_eq!(be.registry().len(), 2);
    }

    #[test]
    fn wildcard_search_is_rejected() {
        let be = backend();
        let res = be.find(&[PciId::ANY], &mut |_| Ok(Visit::Continue));
        assert_eq!(res, Err(PciError::BadArgument));
        assert_eq!(be.bus().finds(), 0);
    }

    #[test]
    fn map_is_cached() {
        let be = backend();
        let dev = first(&be, &[EVR]);
        let a = be.map_bar(&dev, 0).unwrap();
        let b = be.map_bar(&dev, 0).unwrap();
        assert_eq!(a, b);
        assert_eq!(be.bus().maps(), 1);
    }

    #[test]
    fn map_rejects_io_and_out_of_range_bars() {
        let be = backend();
        let dev = first(&be, &[EVR]);
        assert_eq!(be.map_bar(&dev, 1), Err(PciError::NotSupported));
        assert_eq!(be.map_bar(&dev, 6), Err(PciError::BadArgument));
        assert_eq!(be.bar_length(&dev, 6), Err(PciError::BadArgument));
        assert_eq!(be.bus().maps(), 0);
    }

    #[test]
    fn unreported_length_is_probed() {
        let be = backend();
        let dev = be.registry().find_bdf(&[EVR], PciAddress::new(2, 0, 0));
        // Not discovered until searched.
        assert_eq!(dev.unwrap_err(), PciError::NoSuchDevice);

        let mut second = None;
        be.find(&[EVR], &mut |dev| {
            if dev.address().bus == 2 {
                second = Some(Arc::clone(dev));
            }
            Ok(Visit::Continue)
        })
        .unwrap();
        let dev = second.unwrap();
        assert_eq!(be.bar_length(&dev, 0), Ok(0x80));
        be.map_bar(&dev, 0).unwrap();
        assert_eq!(be.bus().maps(), 1);
    }

    static HITS: AtomicUsize = AtomicUsize::new(0);

    fn hit(_: usize) {
        HITS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn interrupts_reach_the_handler() {
        let be = backend();
        let dev = first(&be, &[EVR]);
        be.connect_interrupt(&dev, hit, 0).unwrap();
        assert_eq!(be.connect_interrupt(&dev, hit, 0), Err(PciError::AlreadyRegistered));
        wait_for(|| isr::state_of(&dev, hit, 0) == Some(IsrState::Running));

        be.bus().last_waiter().unwrap().fire();
        wait_for(|| HITS.load(Ordering::SeqCst) == 1);
        be.disconnect_interrupt(&dev, hit, 0).unwrap();
        assert_eq!(be.disconnect_interrupt(&dev, hit, 0), Err(PciError::NotRegistered));
    }

    #[test]
    fn teardown_disconnects_before_unmapping() {
        let be = backend();
        let mut devs = Vec::new();
        be.find(&[EVR], &mut |dev| {
            devs.push(Arc::clone(dev));
            Ok(Visit::Continue)
        })
        .unwrap();
        assert_eq!(devs.len(), 2);

        let mut waiters = Vec::new();
        for dev in &devs {
            be.map_bar(dev, 0).unwrap();
            be.connect_interrupt(dev, hit, 1).unwrap();
            waiters.push(Arc::downgrade(&be.bus().last_waiter().unwrap()));
        }

        // A waiter still referenced by a registration or its thread has
        // more than the bus's own reference.
        let holders = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&holders);
        be.bus().on_unmap(move || {
            let counts: Vec<usize> = waiters.iter().map(Weak::strong_count).collect();
            seen.lock().unwrap().push(counts);
        });

        be.teardown();
        assert_eq!(*holders.lock().unwrap(), [[1, 1], [1, 1]]);
        for dev in &devs {
            assert_eq!(dev.interrupt_count(), 0);
            assert!(dev.lock().bars[0].mapping.is_none());
        }
    }
}
