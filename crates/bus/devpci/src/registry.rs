//! Device registry and search engine.
//!
//! The registry owns every discovered [`PciDevice`]. It is built once when a
//! backend initializes; afterwards only the lazy per-`(vendor, device)` fill
//! of the portable backend appends to it, under the registry lock.
//!
//! Lock order: the registry lock is taken before any device lock. Searches
//! hold the registry lock only while filling and snapshotting the list, so
//! visitors run with no lock held and may call back into devpci.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::device::{DeviceRef, PciAddress, PciDevice, PciDeviceInfo};
use crate::error::PciError;
use crate::id::{self, PciId};
use crate::isr::{self, IsrTiming};
use crate::lockorder;

/// What a search visitor wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Keep searching.
    Continue,
    /// Stop; the search succeeds.
    Stop,
}

#[derive(Default)]
struct RegistryInner {
    devices: Vec<DeviceRef>,
    /// `(vendor, device)` pairs already queried by the lazy fill.
    queried: Vec<(u16, u16)>,
}

/// Process-scoped list of discovered devices.
#[derive(Default)]
pub struct Registry {
    inner: Mutex<RegistryInner>,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the given devices, in order.
    #[must_use]
    pub fn with_devices(devices: impl IntoIterator<Item = PciDeviceInfo>) -> Self {
        let devices = devices
            .into_iter()
            .map(|info| Arc::new(PciDevice::new(info)))
            .collect();
        Self {
            inner: Mutex::new(RegistryInner {
                devices,
                queried: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        lockorder::registry_acquiring();
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of devices currently known.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().devices.len()
    }

    /// Returns `true` if no device is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all known devices.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceRef> {
        self.lock().devices.clone()
    }

    /// Ensures every `(vendor, device)` pair of the pattern list has been
    /// queried exactly once, appending what `query` discovers.
    ///
    /// Wildcard vendor or device fields cannot be queried and yield
    /// `BadArgument`. A failed query leaves its pair unrecorded so a later
    /// search retries it.
    pub fn fill(
        &self,
        patterns: &[PciId],
        mut query: impl FnMut(u16, u16) -> Result<Vec<PciDeviceInfo>, PciError>,
    ) -> Result<(), PciError> {
        let mut inner = self.lock();
        for pattern in id::live(patterns) {
            let (Some(vendor), Some(device)) = (pattern.vendor, pattern.device) else {
                log::error!("devpci: wildcards are not supported in device and vendor fields");
                return Err(PciError::BadArgument);
            };
            if inner.queried.contains(&(vendor, device)) {
                continue;
            }

            let found = query(vendor, device)?;
            log::debug!(
                "devpci: bus query {vendor:04x}:{device:04x} found {} device(s)",
                found.len()
            );
            for info in found {
                if inner.devices.iter().any(|d| d.address() == info.address) {
                    continue;
                }
                inner.devices.push(Arc::new(PciDevice::new(info)));
            }
            inner.queried.push((vendor, device));
        }
        Ok(())
    }

    /// Visits every device that satisfies at least one pattern.
    ///
    /// The visitor decides whether to continue, stop successfully, or stop
    /// with an error, which is returned as-is. An empty pattern list is a
    /// `BadArgument`.
    pub fn find(
        &self,
        patterns: &[PciId],
        mut visit: impl FnMut(&DeviceRef) -> Result<Visit, PciError>,
    ) -> Result<(), PciError> {
        if patterns.is_empty() {
            return Err(PciError::BadArgument);
        }

        for dev in self.devices() {
            if !id::any_matches(patterns, dev.identity()) {
                continue;
            }
            match visit(&dev)? {
                Visit::Continue => {}
                Visit::Stop => break,
            }
        }
        Ok(())
    }

    /// Returns the matching device at `address`.
    pub fn find_bdf(&self, patterns: &[PciId], address: PciAddress) -> Result<DeviceRef, PciError> {
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

    /// Disconnects every interrupt registration, then drops every mapping.
    ///
    /// All registrations of all devices are gone before the first BAR is
    /// unmapped, so no handler can run against unmapped memory.
    pub fn teardown(&self, timing: IsrTiming) {
        let devices = self.devices();
        let mut disconnected = 0;
        for dev in &devices {
            disconnected += isr::disconnect_all(dev, timing);
        }
        for dev in &devices {
            dev.release();
        }
        log::debug!(
            "devpci: teardown released {} device(s), {disconnected} ISR(s)",
            devices.len()
        );
    }
}
