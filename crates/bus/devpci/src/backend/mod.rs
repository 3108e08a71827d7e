//! Platform backends and the table they are selected from.
//!
//! A backend owns the device registry and knows how to reach the hardware.
//! Two are built in:
//!
//! - `"native"`: Linux UIO. The device list comes from the kernel's textual
//!   bus listing, BARs are mapped through `/dev/uioN` and interrupts are
//!   delivered by reading the same node.
//! - `"sysfs"`: portable fallback built on [`shared::SharedBackend`]. Devices
//!   are discovered lazily per `(vendor, device)` pair and interrupts are
//!   not supported.
//!
//! Further backends can be added with [`register`] before selection.

pub mod native;
pub mod shared;
pub mod sysfs;
pub mod uio;

use std::ptr::NonNull;
use std::sync::{Mutex, PoisonError};

use crate::config::Config;
use crate::device::DeviceRef;
use crate::error::PciError;
use crate::id::PciId;
use crate::isr::IsrHandler;
use crate::registry::Visit;

/// Search visitor as seen by backends.
pub type Visitor<'a> = dyn FnMut(&DeviceRef) -> Result<Visit, PciError> + 'a;

/// Operations every platform backend provides.
pub trait Backend: Send + Sync {
    /// Name the backend was selected by.
    fn name(&self) -> &'static str;

    /// Visits every device matching at least one pattern.
    fn find(&self, patterns: &[PciId], visit: &mut Visitor<'_>) -> Result<(), PciError>;

    /// Maps a memory BAR, returning the cached pointer on later calls.
    fn map_bar(&self, dev: &DeviceRef, bar: usize) -> Result<NonNull<u8>, PciError>;

    /// Returns a BAR's length in bytes.
    fn bar_length(&self, dev: &DeviceRef, bar: usize) -> Result<u32, PciError>;

    /// Starts delivering the device's interrupts to `handler(param)`.
    fn connect_interrupt(
        &self,
        dev: &DeviceRef,
        handler: IsrHandler,
        param: usize,
    ) -> Result<(), PciError>;

    /// Stops a registration made with [`Backend::connect_interrupt`].
    fn disconnect_interrupt(
        &self,
        dev: &DeviceRef,
        handler: IsrHandler,
        param: usize,
    ) -> Result<(), PciError>;

    /// Disconnects every interrupt registration, then releases every mapping.
    fn teardown(&self);
}

/// A selectable backend.
#[derive(Clone, Copy)]
pub struct BackendEntry {
    /// Selection name (for configuration and logging).
    pub name: &'static str,
    /// Builds the backend, discovering devices where the backend does so
    /// eagerly.
    pub init: fn(&Config) -> Result<Box<dyn Backend>, PciError>,
}

impl core::fmt::Debug for BackendEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BackendEntry").field("name", &self.name).finish_non_exhaustive()
    }
}

const BUILTIN: &[BackendEntry] = &[native::ENTRY, sysfs::ENTRY];

static REGISTERED: Mutex<Vec<BackendEntry>> = Mutex::new(Vec::new());

/// Adds a backend to the selection table.
///
/// Names are unique; registering a taken name is a `BadArgument`.
pub fn register(entry: BackendEntry) -> Result<(), PciError> {
    let mut registered = REGISTERED.lock().unwrap_or_else(PoisonError::into_inner);
    let taken = BUILTIN.iter().chain(registered.iter()).any(|e| e.name == entry.name);
    if taken {
        log::error!("devpci: backend '{}' is already registered", entry.name);
        return Err(PciError::BadArgument);
    }
    log::debug!("devpci: registered backend '{}'", entry.name);
    registered.push(entry);
    Ok(())
}

/// Looks up a backend by name.
pub fn lookup(name: &str) -> Result<BackendEntry, PciError> {
    let registered = REGISTERED.lock().unwrap_or_else(PoisonError::into_inner);
    BUILTIN
        .iter()
        .chain(registered.iter())
        .find(|e| e.name == name)
        .copied()
        .ok_or_else(|| {
            log::error!("devpci: no backend named '{name}'");
            PciError::UnknownBackend
        })
}

/// Names of every selectable backend, built-ins first.
#[must_use]
pub fn names() -> Vec<&'static str> {
    let registered = REGISTERED.lock().unwrap_or_else(PoisonError::into_inner);
    BUILTIN.iter().chain(registered.iter()).map(|e| e.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn refuse(_: &Config) -> Result<Box<dyn Backend>, PciError> {
        Err(PciError::InitFailed)
    }

    #[test]
    fn builtins_are_listed() {
        let names = names();
        assert_eq!(&names[..2], ["native", "sysfs"]);
        assert_eq!(lookup("sysfs").unwrap().name, "sysfs");
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert_eq!(lookup("vxworks").unwrap_err(), PciError::UnknownBackend);
    }

    #[test]
    fn registered_backend_is_found_once() {
        let entry = BackendEntry {
            name: "unit-test-refuse",
            init: refuse,
        };
        register(entry).unwrap();
        assert_eq!(register(entry), Err(PciError::BadArgument));
        let taken = BackendEntry {
            name: "native",
            init: refuse,
        };
        assert_eq!(register(taken), Err(PciError::BadArgument));

        let found = lookup("unit-test-refuse").unwrap();
        assert!((found.init)(&Config::default()).is_err());
    }
}
