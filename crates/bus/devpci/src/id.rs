//! PCI identity patterns for device searches.

use core::fmt;

/// Concrete identity of a discovered PCI function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PciIdentity {
    /// Vendor ID.
    pub vendor: u16,
    /// Device ID.
    pub device: u16,
    /// Subsystem vendor ID.
    pub sub_vendor: u16,
    /// Subsystem device ID.
    pub sub_device: u16,
    /// Class code: `(class << 16) | (subclass << 8) | prog_if`.
    pub class: u32,
    /// Revision ID.
    pub revision: u8,
}

impl fmt::Display for PciIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.device)
    }
}

/// Identity pattern used to search for devices.
///
/// Every field is either a concrete value or `None`, which matches
/// anything. Pattern lists are plain slices; a list ends at its last
/// element or at the first [`PciId::END`] entry, whichever comes first.
///
/// ```ignore
/// static TIMING_CARDS: &[PciId] = &[
///     PciId::new(0x1A3E, 0xE693),
///     PciId::new(0x10B5, 0x9030).with_subsystem(0x1A3E, 0x10E6),
///     PciId::END,
/// ];
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciId {
    /// Vendor ID (`None` = wildcard).
    pub vendor: Option<u16>,
    /// Device ID (`None` = wildcard, `Some(0)` = list terminator).
    pub device: Option<u16>,
    /// Subsystem vendor ID (`None` = wildcard).
    pub sub_vendor: Option<u16>,
    /// Subsystem device ID (`None` = wildcard).
    pub sub_device: Option<u16>,
    /// 24-bit class code (`None` = wildcard).
    pub class: Option<u32>,
    /// Revision ID (`None` = wildcard).
    pub revision: Option<u8>,
}

impl PciId {
    /// List terminator. Entries after it are never considered.
    pub const END: Self = Self {
        device: Some(0),
        ..Self::ANY
    };

    /// Matches every device.
    pub const ANY: Self = Self {
        vendor: None,
        device: None,
        sub_vendor: None,
        sub_device: None,
        class: None,
        revision: None,
    };

    /// Creates a pattern matching a specific vendor/device pair.
    #[must_use]
    pub const fn new(vendor: u16, device: u16) -> Self {
        Self {
            vendor: Some(vendor),
            device: Some(device),
            ..Self::ANY
        }
    }

    /// Restricts the pattern to one subsystem vendor/device pair.
    #[must_use]
    pub const fn with_subsystem(self, sub_vendor: u16, sub_device: u16) -> Self {
        Self {
            sub_vendor: Some(sub_vendor),
            sub_device: Some(sub_device),
            ..self
        }
    }

    /// Restricts the pattern to one 24-bit class code.
    #[must_use]
    pub const fn with_class(self, class: u32) -> Self {
        Self {
            class: Some(class & 0x00FF_FFFF),
            ..self
        }
    }

    /// Restricts the pattern to one revision.
    #[must_use]
    pub const fn with_revision(self, revision: u8) -> Self {
        Self {
            revision: Some(revision),
            ..self
        }
    }

    /// Returns `true` for the list terminator.
    #[must_use]
    pub const fn is_end(&self) -> bool {
        matches!(self.device, Some(0))
    }

    /// Returns `true` if every non-wildcard field equals the identity's.
    #[must_use]
    pub fn matches(&self, id: &PciIdentity) -> bool {
        fn field<T: PartialEq>(want: Option<T>, have: T) -> bool {
            want.is_none_or(|w| w == have)
        }

        field(self.vendor, id.vendor)
            && field(self.device, id.device)
            && field(self.sub_vendor, id.sub_vendor)
            && field(self.sub_device, id.sub_device)
            && field(self.class, id.class)
            && field(self.revision, id.revision)
    }
}

/// Iterates the live entries of a pattern list, stopping at [`PciId::END`].
pub fn live(list: &[PciId]) -> impl Iterator<Item = &PciId> {
    list.iter().take_while(|p| !p.is_end())
}

/// Returns `true` if the identity satisfies at least one pattern of the list.
#[must_use]
pub fn any_matches(list: &[PciId], id: &PciIdentity) -> bool {
    live(list).any(|p| p.matches(id))
}
