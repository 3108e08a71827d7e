//! Human-readable device reports.
//!
//! ```text
//! 03:00.0 1a3e:e693                                   level 0
//!   subsystem 1a3e:10e6 rev 02                        level 1
//!   class 118000 Signal Processing Controller
//!   irq 16 driver mrf-pci
//!   bar0 mem 32-bit @ 0xfe000000 len 0x1000           level 2
//!   bar2 mem 64-bit prefetch @ 0xfd000000 len ?
//! ```

use core::fmt;

use crate::device::{BAR_COUNT, BarFlags, PciBar, PciDevice};
use crate::error::PciError;
use crate::header::class_name;

/// Report on one device at detail level 0, 1 or 2.
///
/// Levels above 2 print the same as 2.
pub struct DeviceReport<'a> {
    dev: &'a PciDevice,
    level: u8,
    lengths: [Option<u32>; BAR_COUNT],
}

impl<'a> DeviceReport<'a> {
    /// Creates a report using the BAR lengths from discovery.
    #[must_use]
    pub fn new(dev: &'a PciDevice, level: u8) -> Self {
        let mut lengths = [None; BAR_COUNT];
        for (len, bar) in lengths.iter_mut().zip(&dev.info().bars) {
            *len = (bar.len != 0).then_some(bar.len);
        }
        Self { dev, level, lengths }
    }

    /// Fills in the lengths discovery did not report by asking `length`,
    /// typically a backend's `bar_length`. Only done at level 2.
    ///
    /// A failed lookup leaves the length unknown.
    #[must_use]
    pub fn with_lengths(mut self, mut length: impl FnMut(usize) -> Result<u32, PciError>) -> Self {
        if self.level < 2 {
            return self;
        }
        for (idx, bar) in self.dev.info().bars.iter().enumerate() {
            if in_use(bar) && self.lengths[idx].is_none() {
                match length(idx) {
                    Ok(len) => self.lengths[idx] = Some(len),
                    Err(e) => log::debug!("devpci: {} bar{idx} length: {e}", self.dev.address()),
                }
            }
        }
        self
    }
}

fn in_use(bar: &PciBar) -> bool {
    bar.base != 0
}

fn write_bar(
    f: &mut fmt::Formatter<'_>,
    idx: usize,
    bar: &PciBar,
    len: Option<u32>,
) -> fmt::Result {
    write!(f, "\n  bar{idx} ")?;
    if bar.is_io() {
        f.write_str("io")?;
    } else {
        let width = if bar.flags.contains(BarFlags::ADDR64) {
            "64-bit"
        } else {
            "32-bit"
        };
        write!(f, "mem {width}")?;
        if bar.flags.contains(BarFlags::BELOW_1M) {
            f.write_str(" below-1M")?;
        }
        if bar.flags.contains(BarFlags::PREFETCH) {
            f.write_str(" prefetch")?;
        }
    }
    write!(f, " @ {:#x} len ", bar.base)?;
    match len {
        Some(len) => write!(f, "{len:#x}"),
        None => f.write_str("?"),
    }
}

impl fmt::Display for DeviceReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.dev.info();
        write!(f, "{} {}", info.address, info.id)?;
        if self.level == 0 {
            return Ok(());
        }

        let id = &info.id;
        write!(
            f,
            "\n  subsystem {:04x}:{:04x} rev {:02x}\n  class {:06x} {}\n  irq {}",
            id.sub_vendor,
            id.sub_device,
            id.revision,
            id.class,
            class_name(id.class),
            info.irq,
        )?;
        if let Some(driver) = &info.driver {
            write!(f, " driver {driver}")?;
        }
        if self.level == 1 {
            return Ok(());
        }

        for (idx, bar) in info.bars.iter().enumerate() {
            if in_use(bar) {
                write_bar(f, idx, bar, self.lengths[idx])?;
            }
        }
        if info.rom != 0 {
            write!(f, "\n  rom @ {:#x}", info.rom)?;
        }
        Ok(())
    }
}
