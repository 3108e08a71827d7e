//! BAR mapping and length discovery.
//!
//! Mapping primitives work on whole host pages, but a BAR may start
//! anywhere inside a page. The mapper maps from the page boundary below the
//! BAR and hands callers a pointer advanced by the in-page offset, so the
//! pointer lines up with the hardware base address.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

use crate::device::{DeviceState, PciDeviceInfo};
use crate::error::PciError;

/// Offset of BAR0 in configuration space; BAR1-5 follow at 4-byte steps.
pub const BAR0: u16 = 0x10;

/// Address bits of a memory BAR.
pub const MEM_ADDR_MASK: u32 = 0xFFFF_FFF0;

/// Address bits of an I/O BAR.
pub const IO_ADDR_MASK: u32 = 0xFFFF_FFFC;

/// A live mapping of device memory into the process.
pub trait MappedRegion: Send {
    /// Start of the mapped range.
    fn as_ptr(&self) -> NonNull<u8>;

    /// Length of the mapped range in bytes.
    fn len(&self) -> usize;
}

/// Window a platform mapper is asked to provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapRequest {
    /// BAR index being mapped.
    pub bar: usize,
    /// Page-aligned bus address the mapping starts at.
    pub page_base: u64,
    /// Bytes to map: in-page offset plus BAR length.
    pub span: usize,
}

/// A cached BAR mapping.
pub(crate) struct BarMapping {
    region: Box<dyn MappedRegion>,
    offset: usize,
}

impl BarMapping {
    /// Pointer to the first byte of the BAR itself.
    pub(crate) fn ptr(&self) -> NonNull<u8> {
        // SAFETY: `offset < span <= region.len()`, checked when the
        // mapping was recorded.
        unsafe { self.region.as_ptr().add(self.offset) }
    }
}

/// Host page size in bytes.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no preconditions.
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        usize::try_from(size).ok().filter(|&s| s > 0).unwrap_or(4096)
    })
}

/// Maps a BAR on first use and returns the cached pointer afterwards.
///
/// Must be called with the device lock held (`state` is the guarded
/// state). `map` is only invoked when no mapping exists yet; if it fails
/// nothing is recorded.
pub(crate) fn map_bar_locked(
    state: &mut DeviceState,
    info: &PciDeviceInfo,
    bar: usize,
    len: u32,
    page_size: usize,
    map: impl FnOnce(&mut DeviceState, &MapRequest) -> Result<Box<dyn MappedRegion>, PciError>,
) -> Result<NonNull<u8>, PciError> {
    let desc = info.bars.get(bar).ok_or(PciError::BadArgument)?;
    if desc.is_io() {
        return Err(PciError::NotSupported);
    }

    if let Some(mapping) = &state.bars[bar].mapping {
        return Ok(mapping.ptr());
    }

    if len == 0 {
        log::error!("devpci: BAR {bar} of {} has no length, cannot map", info.address);
        return Err(PciError::MapFailed);
    }

    let page = page_size as u64;
    let offset = (desc.base % page) as usize;
    let req = MapRequest {
        bar,
        page_base: desc.base - offset as u64,
        span: offset + len as usize,
    };

    let region = map(state, &req)?;
    if region.len() < req.span {
        log::error!(
            "devpci: mapping of BAR {bar} of {} is {:#x} bytes, need {:#x}",
            info.address,
            region.len(),
            req.span
        );
        return Err(PciError::MapFailed);
    }

    log::debug!(
        "devpci: mapped BAR {bar} of {} ({:#x} bytes, page offset {offset:#x})",
        info.address,
        req.span
    );
    let mapping = BarMapping { region, offset };
    let ptr = mapping.ptr();
    state.bars[bar].mapping = Some(mapping);
    Ok(ptr)
}

/// Returns a BAR's length: the discovered value when one was reported,
/// otherwise the cached or freshly probed one.
///
/// Must be called with the device lock held. `open` provides configuration
/// space access and only runs when a probe is needed.
pub(crate) fn bar_length_locked(
    state: &mut DeviceState,
    info: &PciDeviceInfo,
    bar: usize,
    open: impl FnOnce(&mut DeviceState) -> Result<Box<dyn ConfigSpace>, PciError>,
) -> Result<u32, PciError> {
    let desc = info.bars.get(bar).ok_or(PciError::BadArgument)?;
    if desc.len != 0 {
        return Ok(desc.len);
    }
    if let Some(len) = state.bars[bar].probed_len {
        return Ok(len);
    }

    let cfg = open(state)?;
    let len = probe_bar_len(&*cfg, bar, desc.is_io())?;
    log::debug!("devpci: probed BAR {bar} of {}: {len:#x} bytes", info.address);
    state.bars[bar].probed_len = Some(len);
    Ok(len)
}

// ---------------------------------------------------------------------------
// mmap-backed regions
// ---------------------------------------------------------------------------

/// A shared, read-write `mmap` of a device node, unmapped on drop.
#[derive(Debug)]
pub struct Mmap {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is plain device memory owned by this value; access
// discipline is the caller's, as with any raw MMIO pointer.
unsafe impl Send for Mmap {}

impl Mmap {
    /// Maps `len` bytes of `file` starting at `offset`.
    pub fn map(file: &File, offset: u64, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "zero-length mapping"));
        }
        let offset = libc::off_t::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mapping offset too large"))?;

        // SAFETY: a fresh shared mapping of a file we hold open; the kernel
        // picks the address. The result is checked against MAP_FAILED.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned a null mapping"))?;
        Ok(Self { ptr, len })
    }
}

impl MappedRegion for Mmap {
    fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mmap {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` are exactly what mmap returned.
        let rc = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if rc != 0 {
            log::warn!("devpci: munmap failed: {}", io::Error::last_os_error());
        }
    }
}

// ---------------------------------------------------------------------------
// Length discovery
// ---------------------------------------------------------------------------

/// 32-bit access to one function's configuration space.
pub trait ConfigSpace {
    /// Reads the dword at `offset`.
    fn read_u32(&self, offset: u16) -> io::Result<u32>;

    /// Writes the dword at `offset`.
    fn write_u32(&self, offset: u16, value: u32) -> io::Result<()>;
}

impl<T: ConfigSpace + ?Sized> ConfigSpace for Arc<T> {
    fn read_u32(&self, offset: u16) -> io::Result<u32> {
        (**self).read_u32(offset)
    }

    fn write_u32(&self, offset: u16, value: u32) -> io::Result<()> {
        (**self).write_u32(offset, value)
    }
}

impl<T: ConfigSpace + ?Sized> ConfigSpace for Box<T> {
    fn read_u32(&self, offset: u16) -> io::Result<u32> {
        (**self).read_u32(offset)
    }

    fn write_u32(&self, offset: u16, value: u32) -> io::Result<()> {
        (**self).write_u32(offset, value)
    }
}

/// Discovers a BAR's length by writing ones to its address bits.
///
/// The address decoder only keeps the bits above its window size, so the
/// lowest set address bit read back after writing the mask is the length.
/// For example, a memory BAR at `0x0004_3000` reading back `0xFFFF_FF80`
/// is `0x80` bytes long.
///
/// An unprogrammed BAR (zero address) reports `0` and is left untouched.
/// The original register value is always written back, including when the
/// read-back fails. Callers hold the device lock; the probe assumes a 32-bit
/// BAR.
pub fn probe_bar_len<C: ConfigSpace + ?Sized>(
    cfg: &C,
    bar: usize,
    io_space: bool,
) -> Result<u32, PciError> {
    if bar >= crate::device::BAR_COUNT {
        return Err(PciError::BadArgument);
    }
    let reg = BAR0 + (bar as u16) * 4;
    let mask = if io_space {
        IO_ADDR_MASK
    } else {
        MEM_ADDR_MASK
    };

    let start = cfg.read_u32(reg).map_err(config_error(reg))?;
    if start & mask == 0 {
        return Ok(0);
    }

    let sized = cfg.write_u32(reg, mask).and_then(|()| cfg.read_u32(reg));
    let restored = cfg.write_u32(reg, start);

    let max = sized.map_err(config_error(reg))? & mask;
    restored.map_err(config_error(reg))?;

    Ok(max & max.wrapping_neg())
}

fn config_error(reg: u16) -> impl Fn(io::Error) -> PciError {
    move |err| {
        log::error!("devpci: config space access at {reg:#04x} failed: {err}");
        PciError::ConfigAccess
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{PciAddress, PciBar};
    use crate::testutil::{HeapRegion, SimConfig};
    use std::io::Write;

    fn info_with_bar(bar: PciBar) -> PciDeviceInfo {
        let mut info = PciDeviceInfo {
            address: PciAddress::new(0, 3, 0),
            ..PciDeviceInfo::default()
        };
        info.bars[0] = bar;
        info
    }

    #[test]
    fn probe_finds_lowest_address_bit() {
        let cfg = SimConfig::new();
        cfg.set_bar(0, 0x0004_3000, 0x80);
        assert_eq!(probe_bar_len(&cfg, 0, false), Ok(0x80));
    }

    #[test]
    fn probe_restores_register() {
        let cfg = SimConfig::new();
        cfg.set_bar(2, 0xFE10_0008, 0x1000);
        let before = cfg.read_u32(BAR0 + 8).unwrap();
        assert_eq!(probe_bar_len(&cfg, 2, false), Ok(0x1000));
        assert_eq!(cfg.read_u32(BAR0 + 8).unwrap(), before);
    }

    #[test]
    fn probe_skips_unprogrammed_bar() {
        let cfg = SimConfig::new();
        cfg.set_bar(1, 0, 0x100);
        assert_eq!(probe_bar_len(&cfg, 1, false), Ok(0));
        assert_eq!(cfg.writes(), 0);
    }

    #[test]
    fn probe_io_bar_uses_io_mask() {
        let cfg = SimConfig::new();
        cfg.set_bar(4, 0xE001, 0x20);
        assert_eq!(probe_bar_len(&cfg, 4, true), Ok(0x20));
        assert_eq!(cfg.read_u32(BAR0 + 16).unwrap(), 0xE001);
    }

    #[test]
    fn probe_restores_even_when_readback_fails() {
        let cfg = SimConfig::new();
        cfg.set_bar(0, 0x0004_3000, 0x80);
        // First read is the original value, second is the read-back.
        cfg.fail_read(1);
        assert_eq!(probe_bar_len(&cfg, 0, false), Err(PciError::ConfigAccess));
        assert_eq!(cfg.read_u32(BAR0).unwrap(), 0x0004_3000);
    }

    #[test]
    fn probe_rejects_out_of_range_bar() {
        let cfg = SimConfig::new();
        assert_eq!(probe_bar_len(&cfg, 6, false), Err(PciError::BadArgument));
    }

    #[test]
    fn map_applies_page_offset() {
        let info = info_with_bar(PciBar::decode(0xFE00_0840, 0x80));
        let mut state = DeviceState::default();
        let mut requested = None;

        let ptr = map_bar_locked(&mut state, &info, 0, 0x80, 4096, |_, req| {
            requested = Some(*req);
            Ok(Box::new(HeapRegion::new(req.span)))
        })
        .unwrap();

        let req = requested.unwrap();
        assert_eq!(req.page_base, 0xFE00_0000);
        assert_eq!(req.span, 0x840 + 0x80);
        let base = state.bars[0].mapping.as_ref().unwrap().region.as_ptr();
        assert_eq!(ptr.as_ptr() as usize - base.as_ptr() as usize, 0x840);
    }

    #[test]
    fn map_is_idempotent() {
        let info = info_with_bar(PciBar::decode(0xFE00_0000, 0x1000));
        let mut state = DeviceState::default();
        let mut calls = 0;
        let mut map = |_: &mut DeviceState, req: &MapRequest| {
            calls += 1;
            Ok::<Box<dyn MappedRegion>, PciError>(Box::new(HeapRegion::new(req.span)))
        };

        let first = map_bar_locked(&mut state, &info, 0, 0x1000, 4096, &mut map).unwrap();
        let second = map_bar_locked(&mut state, &info, 0, 0x1000, 4096, &mut map).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls, 1);
    }

    #[test]
    fn failed_map_records_nothing() {
        let info = info_with_bar(PciBar::decode(0xFE00_0000, 0x1000));
        let mut state = DeviceState::default();
        let err = map_bar_locked(&mut state, &info, 0, 0x1000, 4096, |_, _| {
            Err(PciError::MapFailed)
        });
        assert_eq!(err, Err(PciError::MapFailed));
        assert!(state.bars[0].mapping.is_none());
    }

    #[test]
    fn short_region_is_rejected() {
        let info = info_with_bar(PciBar::decode(0xFE00_0000, 0x1000));
        let mut state = DeviceState::default();
        let err = map_bar_locked(&mut state, &info, 0, 0x1000, 4096, |_, _| {
            Ok(Box::new(HeapRegion::new(0x10)))
        });
        assert_eq!(err, Err(PciError::MapFailed));
        assert!(state.bars[0].mapping.is_none());
    }

    #[test]
    fn io_bar_cannot_be_mapped() {
        let info = info_with_bar(PciBar::decode(0xE001, 0x20));
        let mut state = DeviceState::default();
        let err = map_bar_locked(&mut state, &info, 0, 0x20, 4096, |_, _| {
            panic!("mapper must not run for I/O BARs")
        });
        assert_eq!(err, Err(PciError::NotSupported));
    }

    #[test]
    fn zero_length_cannot_be_mapped() {
        let info = info_with_bar(PciBar::decode(0xFE00_0000, 0));
        let mut state = DeviceState::default();
        let err = map_bar_locked(&mut state, &info, 0, 0, 4096, |_, _| {
            panic!("mapper must not run without a length")
        });
        assert_eq!(err, Err(PciError::MapFailed));
    }

    #[test]
    fn reported_length_skips_the_probe() {
        let info = info_with_bar(PciBar::decode(0xFE00_0000, 0x1000));
        let mut state = DeviceState::default();
        let len = bar_length_locked(&mut state, &info, 0, |_| {
            panic!("config space must not be opened")
        });
        assert_eq!(len, Ok(0x1000));
    }

    #[test]
    fn probed_length_is_cached() {
        let info = info_with_bar(PciBar::decode(0x0004_3000, 0));
        let mut state = DeviceState::default();
        let cfg = Arc::new(SimConfig::new());
        cfg.set_bar(0, 0x0004_3000, 0x80);

        let mut opens = 0;
        for _ in 0..2 {
            let len = bar_length_locked(&mut state, &info, 0, |_| {
                opens += 1;
                Ok(Box::new(Arc::clone(&cfg)))
            });
            assert_eq!(len, Ok(0x80));
        }
        assert_eq!(opens, 1);
        assert_eq!(state.bars[0].probed_len, Some(0x80));
    }

    #[test]
    fn mmap_of_file_is_shared() {
        let page = page_size();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&vec![0u8; page * 2]).unwrap();

        let map = Mmap::map(&file, page as u64, page).unwrap();
        assert_eq!(map.len(), page);
        // SAFETY: the mapping is one page long and exclusively ours.
        unsafe { map.as_ptr().as_ptr().write_volatile(0x5A) };

        use std::os::unix::fs::FileExt;
        let mut byte = [0u8; 1];
        file.read_exact_at(&mut byte, page as u64).unwrap();
        assert_eq!(byte[0], 0x5A);
    }

    #[test]
    fn mmap_rejects_zero_length() {
        let file = tempfile::tempfile().unwrap();
        assert!(Mmap::map(&file, 0, 0).is_err());
    }
}
