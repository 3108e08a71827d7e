//! Linux sysfs access and the portable `"sysfs"` backend.
//!
//! Every PCI function has a directory `<root>/0000:BB:SS.F` holding hex
//! attribute files, a `config` file exposing configuration space, one
//! `resourceN` file per memory BAR that can be mapped, and (when bound to a
//! UIO driver) a link to its `uioN` node.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::backend::shared::{BusAccess, SharedBackend};
use crate::backend::{Backend, BackendEntry};
use crate::bar::{ConfigSpace, MapRequest, MappedRegion, Mmap};
use crate::config::Config;
use crate::device::{PciAddress, PciDeviceInfo};
use crate::error::PciError;
use crate::header;

/// Selection entry for the portable backend.
pub const ENTRY: BackendEntry = BackendEntry {
    name: "sysfs",
    init,
};

fn init(config: &Config) -> Result<Box<dyn Backend>, PciError> {
    let root = &config.sysfs_devices;
    if !root.is_dir() {
        log::error!("devpci: {} is not a directory", root.display());
        return Err(PciError::InitFailed);
    }
    let bus = SysfsBus::new(root.clone());
    Ok(Box::new(SharedBackend::new(ENTRY.name, bus, config.timing())))
}

/// Attribute directory of the function at `address` (domain 0).
#[must_use]
pub fn device_dir(root: &Path, address: PciAddress) -> PathBuf {
    root.join(format!(
        "0000:{:02x}:{:02x}.{:x}",
        address.bus, address.slot, address.function
    ))
}

/// Parses a `DDDD:BB:SS.F` directory name. Only domain 0 is addressable.
#[must_use]
pub fn parse_dir_name(name: &str) -> Option<PciAddress> {
    let rest = name.strip_prefix("0000:")?;
    let (bus, rest) = rest.split_once(':')?;
    let (slot, function) = rest.split_once('.')?;
    Some(PciAddress::new(
        u8::from_str_radix(bus, 16).ok()?,
        u8::from_str_radix(slot, 16).ok()?,
        u8::from_str_radix(function, 16).ok()?,
    ))
}

/// Reads a hex attribute such as `0x1a3e`.
pub fn read_hex(path: &Path) -> io::Result<u64> {
    let text = std::fs::read_to_string(path)?;
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{}: '{text}': {err}", path.display()),
        )
    })
}

/// Name of the kernel driver bound to the function, if any.
#[must_use]
pub fn driver_name(dir: &Path) -> Option<String> {
    let target = std::fs::read_link(dir.join("driver")).ok()?;
    Some(target.file_name()?.to_string_lossy().into_owned())
}

/// Finds the number `N` of the function's `uioN` node.
///
/// Both the flat `uio:uioN` entry and the `uio/uioN` subdirectory layout
/// are recognized. Exactly one node must exist.
pub fn find_uio(dir: &Path) -> io::Result<u32> {
    fn scan(dir: &Path, prefix: &str, found: &mut Vec<u32>) -> io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name();
            let number = name
                .to_str()
                .and_then(|n| n.strip_prefix(prefix))
                .and_then(|n| n.parse::<u32>().ok());
            found.extend(number);
        }
        Ok(())
    }

    let mut found = Vec::new();
    scan(dir, "uio:uio", &mut found)?;
    let nested = dir.join("uio");
    if nested.is_dir() {
        scan(&nested, "uio", &mut found)?;
    }
    found.sort_unstable();
    found.dedup();

    match found[..] {
        [n] => Ok(n),
        [] => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no UIO node under {}", dir.display()),
        )),
        _ => Err(io::Error::other(format!(
            "{} UIO nodes under {}",
            found.len(),
            dir.display()
        ))),
    }
}

/// Configuration space through the sysfs `config` file.
#[derive(Debug)]
pub struct SysfsConfig {
    file: File,
}

impl SysfsConfig {
    /// Opens `<dir>/config` for reading and writing.
    pub fn open(dir: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(dir.join("config"))?;
        Ok(Self { file })
    }

    /// Opens `<dir>/config` for reading only.
    pub fn open_read_only(dir: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(dir.join("config"))?,
        })
    }
}

impl ConfigSpace for SysfsConfig {
    fn read_u32(&self, offset: u16) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, u64::from(offset))?;
        Ok(u32::from_le_bytes(buf))
    }

    fn write_u32(&self, offset: u16, value: u32) -> io::Result<()> {
        self.file.write_all_at(&value.to_le_bytes(), u64::from(offset))
    }
}

/// Bus access through sysfs only; no UIO driver needed.
#[derive(Debug)]
pub struct SysfsBus {
    root: PathBuf,
}

impl SysfsBus {
    /// Creates a bus rooted at a `/sys/bus/pci/devices`-like directory.
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn probe_dir(&self, dir: &Path, address: PciAddress) -> io::Result<PciDeviceInfo> {
        let cfg = SysfsConfig::open_read_only(dir)?;
        let mut info = header::read_header(&cfg, address)?;
        info.driver = driver_name(dir);
        Ok(info)
    }
}

impl BusAccess for SysfsBus {
    fn find(&self, vendor: u16, device: u16) -> Result<Vec<PciDeviceInfo>, PciError> {
        let entries = std::fs::read_dir(&self.root).map_err(|err| {
            log::error!("devpci: listing {}: {err}", self.root.display());
            PciError::NoSuchDevice
        })?;

        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(address) = name.to_str().and_then(parse_dir_name) else {
                continue;
            };
            let dir = entry.path();
            let ids = (read_hex(&dir.join("vendor")), read_hex(&dir.join("device")));
            let (Ok(v), Ok(d)) = ids else {
                log::warn!("devpci: cannot read IDs of {address}");
                continue;
            };
            if v != u64::from(vendor) || d != u64::from(device) {
                continue;
            }

            match self.probe_dir(&dir, address) {
                Ok(info) => found.push(info),
                Err(err) => {
                    log::error!("devpci: reading configuration of {address}: {err}");
                    return Err(PciError::ConfigAccess);
                }
            }
        }
        found.sort_by_key(|info| info.address);
        Ok(found)
    }

    fn map(
        &self,
        dev: &PciDeviceInfo,
        req: &MapRequest,
    ) -> Result<Box<dyn MappedRegion>, PciError> {
        let path = device_dir(&self.root, dev.address).join(format!("resource{}", req.bar));
        let mapped = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .and_then(|file| Mmap::map(&file, 0, req.span));
        match mapped {
            Ok(region) => Ok(Box::new(region)),
            Err(err) => {
                log::error!("devpci: failed to map {}: {err}", path.display());
                Err(PciError::MapFailed)
            }
        }
    }

    fn config(&self, dev: &PciDeviceInfo) -> Result<Box<dyn ConfigSpace>, PciError> {
        let dir = device_dir(&self.root, dev.address);
        match SysfsConfig::open(&dir) {
            Ok(cfg) => Ok(Box::new(cfg)),
            Err(err) => {
                log::error!("devpci: opening configuration space of {}: {err}", dev.address);
                Err(PciError::ConfigAccess)
            }
        }
    }
}
