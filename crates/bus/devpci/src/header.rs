//! Type 0 configuration header decoding.

use std::io;

use crate::bar::ConfigSpace;
use crate::device::{BAR_COUNT, BarFlags, PciAddress, PciBar, PciDeviceInfo};
use crate::id::PciIdentity;

/// Standard configuration space register offsets (dword aligned).
pub mod regs {
    /// Vendor ID (low half) and device ID (high half).
    pub const ID: u16 = 0x00;
    /// Revision (byte 0) and class code (bytes 1-3).
    pub const CLASS_REV: u16 = 0x08;
    /// Header type in byte 2.
    pub const HEADER: u16 = 0x0C;
    /// Subsystem vendor (low half) and subsystem device (high half).
    pub const SUBSYSTEM: u16 = 0x2C;
    /// Expansion ROM base address.
    pub const ROM: u16 = 0x30;
    /// Interrupt line in byte 0.
    pub const INTERRUPT: u16 = 0x3C;
}

/// Reads identity, BARs, ROM and interrupt line from a type 0 header.
///
/// BAR lengths are left at zero: sizing writes to the device and is
/// deferred until a length is actually asked for.
pub fn read_header<C: ConfigSpace + ?Sized>(
    cfg: &C,
    address: PciAddress,
) -> io::Result<PciDeviceInfo> {
    let ids = cfg.read_u32(regs::ID)?;
    let class_rev = cfg.read_u32(regs::CLASS_REV)?;
    let header_type = (cfg.read_u32(regs::HEADER)? >> 16) & 0x7F;

    let (sub_vendor, sub_device, rom) = if header_type == 0 {
        let sub = cfg.read_u32(regs::SUBSYSTEM)?;
        let rom = cfg.read_u32(regs::ROM)?;
        (sub as u16, (sub >> 16) as u16, u64::from(rom & !0x7FF))
    } else {
        (0, 0, 0)
    };

    Ok(PciDeviceInfo {
        address,
        id: PciIdentity {
            vendor: ids as u16,
            device: (ids >> 16) as u16,
            sub_vendor,
            sub_device,
            class: class_rev >> 8,
            revision: class_rev as u8,
        },
        bars: decode_bars(cfg, if header_type == 1 { 2 } else { BAR_COUNT })?,
        rom,
        irq: cfg.read_u32(regs::INTERRUPT)? as u8,
        driver: None,
    })
}

fn decode_bars<C: ConfigSpace + ?Sized>(
    cfg: &C,
    max_bars: usize,
) -> io::Result<[PciBar; BAR_COUNT]> {
    let mut bars = [PciBar::UNUSED; BAR_COUNT];
    let mut i = 0;
    while i < max_bars {
        let raw = u64::from(cfg.read_u32(crate::bar::BAR0 + (i as u16) * 4)?);
        let mut bar = PciBar::decode(raw, 0);

        if bar.flags.contains(BarFlags::ADDR64) && i + 1 < max_bars {
            // Upper half of the address lives in the next slot.
            let high = cfg.read_u32(crate::bar::BAR0 + (i as u16 + 1) * 4)?;
            bar.base |= u64::from(high) << 32;
            bars[i] = bar;
            i += 2;
        } else {
            bars[i] = bar;
            i += 1;
        }
    }
    Ok(bars)
}

/// Human-readable name for a class/subclass pair.
#[must_use]
pub fn class_name(class: u32) -> &'static str {
    match (class >> 16, (class >> 8) & 0xFF) {
        (0x00, 0x00) => "Non-VGA Unclassified",
        (0x01, 0x01) => "IDE Controller",
        (0x01, 0x06) => "SATA Controller",
        (0x02, 0x00) => "Ethernet Controller",
        (0x03, 0x00) => "VGA Controller",
        (0x04, 0x00) => "Video Device",
        (0x06, 0x00) => "Host Bridge",
        (0x06, 0x01) => "ISA Bridge",
        (0x06, 0x04) => "PCI-to-PCI Bridge",
        (0x06, 0x80) => "Other Bridge",
        (0x0C, 0x03) => "USB Controller",
        (0x0C, 0x05) => "SMBus Controller",
        (0x11, 0x80) => "Signal Processing Controller",
        (0xFF, _) => "Unassigned",
        _ => "Unknown",
    }
}
