//! Linux UIO backend.
//!
//! The device list is read once from the kernel's textual bus listing and
//! completed with sysfs attributes. Mapping and interrupts go through the
//! `/dev/uioN` node of a function bound to a UIO driver: map `N` of the
//! node exposes BAR `N` at offset `N * page_size`, and each interrupt
//! waiter holds its own descriptor on the node.

pub mod devlist;

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::backend::sysfs::{self, SysfsConfig};
use crate::backend::uio::UioWaiter;
use crate::backend::{Backend, BackendEntry, Visitor};
use crate::bar::{self, MappedRegion, Mmap};
use crate::config::Config;
use crate::device::{DeviceRef, DeviceState, PciDeviceInfo};
use crate::error::PciError;
use crate::id::PciId;
use crate::isr::{self, IrqWait, IsrHandler, IsrTiming};
use crate::registry::Registry;

/// Selection entry for the UIO backend.
pub const ENTRY: BackendEntry = BackendEntry {
    name: "native",
    init,
};

fn init(config: &Config) -> Result<Box<dyn Backend>, PciError> {
    Ok(Box::new(NativeBackend::open(config)?))
}

/// UIO backend over an eagerly built registry.
pub struct NativeBackend {
    registry: Registry,
    sysfs_root: PathBuf,
    dev_dir: PathBuf,
    timing: IsrTiming,
    page_size: usize,
}

impl NativeBackend {
    /// Reads the bus listing and sysfs attributes named by `config`.
    pub fn open(config: &Config) -> Result<Self, PciError> {
        let listing = &config.proc_devices;
        let text = std::fs::read_to_string(listing).map_err(|err| {
            log::error!("devpci: failed to read device list {}: {err}", listing.display());
            PciError::InitFailed
        })?;
        let mut devices = devlist::parse(&text).map_err(|err| {
            log::error!("devpci: failed to parse {} at {err}", listing.display());
            PciError::InitFailed
        })?;

        for info in &mut devices {
            read_attributes(&config.sysfs_devices, info);
        }
        log::info!("devpci: native backend found {} device(s)", devices.len());

        Ok(Self {
            registry: Registry::with_devices(devices),
            sysfs_root: config.sysfs_devices.clone(),
            dev_dir: config.dev_dir.clone(),
            timing: config.timing(),
            page_size: bar::page_size(),
        })
    }

    /// The device registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn uio_path(&self, info: &PciDeviceInfo) -> io::Result<PathBuf> {
        let n = sysfs::find_uio(&sysfs::device_dir(&self.sysfs_root, info.address))?;
        Ok(self.dev_dir.join(format!("uio{n}")))
    }

    /// Opens the shared mapping descriptor on first use.
    fn node_locked(
        &self,
        state: &mut DeviceState,
        info: &PciDeviceInfo,
    ) -> Result<Arc<File>, PciError> {
        if let Some(node) = &state.handle {
            return Ok(Arc::clone(node));
        }
        let node = self
            .uio_path(info)
            .and_then(|path| OpenOptions::new().read(true).write(true).open(path))
            .map_err(|err| {
                log::error!("devpci: cannot open UIO node of {}: {err}", info.address);
                PciError::MapFailed
            })?;
        let node = Arc::new(node);
        state.handle = Some(Arc::clone(&node));
        Ok(node)
    }
}

/// Fills the identity fields the listing lacks. Missing attributes stay
/// zero, which can make searches on those fields miss the device.
fn read_attributes(root: &Path, info: &mut PciDeviceInfo) {
    let dir = sysfs::device_dir(root, info.address);
    let read = |name: &str| sysfs::read_hex(&dir.join(name));

    let mut failed = Vec::new();
    let mut field = |name: &'static str| {
        read(name).unwrap_or_else(|_| {
            failed.push(name);
            0
        })
    };
    let sub_vendor = field("subsystem_vendor") as u16;
    let sub_device = field("subsystem_device") as u16;
    let class = field("class") as u32 & 0x00FF_FFFF;
    let revision = field("revision") as u8;

    info.id.sub_vendor = sub_vendor;
    info.id.sub_device = sub_device;
    info.id.class = class;
    info.id.revision = revision;
    if info.driver.is_none() {
        info.driver = sysfs::driver_name(&dir);
    }

    if !failed.is_empty() {
        log::warn!(
            "devpci: failed to read {} of {}; searches on these fields may fail",
            failed.join(", "),
            info.address
        );
    }
}

impl Backend for NativeBackend {
    fn name(&self) -> &'static str {
        ENTRY.name
    }

    fn find(&self, patterns: &[PciId], visit: &mut Visitor<'_>) -> Result<(), PciError> {
        self.registry.find(patterns, visit)
    }

    fn map_bar(&self, dev: &DeviceRef, bar: usize) -> Result<NonNull<u8>, PciError> {
        if dev.bar(bar).ok_or(PciError::BadArgument)?.is_io() {
            return Err(PciError::NotSupported);
        }
        let len = self.bar_length(dev, bar)?;
        let info = dev.info();
        let offset = (bar * self.page_size) as u64;

        let mut state = dev.lock();
        bar::map_bar_locked(&mut state, info, bar, len, self.page_size, |state, req| {
            let node = self.node_locked(state, info)?;
            match Mmap::map(&node, offset, req.span) {
                Ok(region) => Ok(Box::new(region) as Box<dyn MappedRegion>),
                Err(err) => {
                    log::error!("devpci: failed to map BAR {bar} of {}: {err}", info.address);
                    Err(PciError::MapFailed)
                }
            }
        })
    }

    fn bar_length(&self, dev: &DeviceRef, bar: usize) -> Result<u32, PciError> {
        let info = dev.info();
        let mut state = dev.lock();
        bar::bar_length_locked(&mut state, info, bar, |_| {
            let dir = sysfs::device_dir(&self.sysfs_root, info.address);
            match SysfsConfig::open(&dir) {
                Ok(cfg) => Ok(Box::new(cfg)),
                Err(err) => {
                    log::error!("devpci: opening configuration space of {}: {err}", info.address);
                    Err(PciError::ConfigAccess)
                }
            }
        })
    }

    fn connect_interrupt(
        &self,
        dev: &DeviceRef,
        handler: IsrHandler,
        param: usize,
    ) -> Result<(), PciError> {
        let info = dev.info();
        isr::connect(dev, handler, param, self.timing, |_| {
            match self.uio_path(info).and_then(|path| UioWaiter::open(&path)) {
                Ok(waiter) => Ok(Arc::new(waiter) as Arc<dyn IrqWait>),
                Err(err) => {
                    log::error!("devpci: cannot listen for interrupts of {}: {err}", info.address);
                    Err(PciError::NotSupported)
                }
            }
        })
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
