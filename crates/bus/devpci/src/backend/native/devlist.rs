//! Parser for the kernel's textual PCI device listing.
//!
//! One line per function, whitespace-separated hex fields:
//!
//! ```text
//! bdf  vendor<<16|device  irq  base0..base5  rom  size0..size5  romsize  [driver]
//! 0300 1a3ee693           10   fe000008      ...                          mrf-pci
//! ```
//!
//! Base addresses carry the BAR flag bits in their low nibble.

use core::fmt;

use crate::device::{BAR_COUNT, PciAddress, PciBar, PciDeviceInfo};
use crate::id::PciIdentity;

/// Fields before the optional driver name.
const FIXED_FIELDS: usize = 3 + 2 * (BAR_COUNT + 1);

/// Position of the first malformed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError {
    /// 1-based line number.
    pub line: usize,
    /// 1-based field number within the line.
    pub column: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {} column {}", self.line, self.column)
    }
}

impl std::error::Error for ParseError {}

/// Parses a whole listing. Blank lines are skipped; any malformed line
/// fails the parse.
pub fn parse(text: &str) -> Result<Vec<PciDeviceInfo>, ParseError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            parse_line(line).map_err(|column| ParseError {
                line: idx + 1,
                column,
            })
        })
        .collect()
}

/// Parses one line; the error is the 1-based column of the bad field.
fn parse_line(line: &str) -> Result<PciDeviceInfo, usize> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let hex = |column: usize| -> Result<u64, usize> {
        let field = fields.get(column - 1).ok_or(column)?;
        u64::from_str_radix(field, 16).map_err(|_| column)
    };

    let bdf = u16::try_from(hex(1)?).map_err(|_| 1usize)?;
    let ids = u32::try_from(hex(2)?).map_err(|_| 2usize)?;
    let irq = u8::try_from(hex(3)?).map_err(|_| 3usize)?;

    let mut raw = [0u64; BAR_COUNT];
    for (i, value) in raw.iter_mut().enumerate() {
        *value = hex(4 + i)?;
    }
    let rom = hex(4 + BAR_COUNT)?;

    let mut bars = [PciBar::UNUSED; BAR_COUNT];
    for (i, bar) in bars.iter_mut().enumerate() {
        let size = hex(5 + BAR_COUNT + i)?;
        // Sizes above 4 GiB are not representable; leave them to the probe.
        *bar = PciBar::decode(raw[i], u32::try_from(size).unwrap_or(0));
    }
    hex(FIXED_FIELDS)?;

    let driver = fields
        .get(FIXED_FIELDS..)
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.join(" "));

    Ok(PciDeviceInfo {
        address: PciAddress::from_bdf(bdf),
        id: PciIdentity {
            vendor: (ids >> 16) as u16,
            device: ids as u16,
            ..PciIdentity::default()
        },
        bars,
        rom: rom & !0x7FF,
        irq,
        driver,
    })
}
