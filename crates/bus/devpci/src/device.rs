//! Device records: immutable discovery data plus lock-guarded runtime state.

use core::fmt;
use std::any::Any;
use std::fs::File;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;

use crate::bar::BarMapping;
use crate::id::PciIdentity;
use crate::isr::IsrRegistration;
use crate::lockorder;

/// Number of BAR slots in a type 0 configuration header.
pub const BAR_COUNT: usize = 6;

/// Shared handle to a device record.
pub type DeviceRef = Arc<PciDevice>;

/// PCI bus/slot/function address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PciAddress {
    /// Bus number (0-255).
    pub bus: u8,
    /// Slot (device) number (0-31).
    pub slot: u8,
    /// Function number (0-7).
    pub function: u8,
}

impl PciAddress {
    /// Creates an address from its components.
    #[must_use]
    pub const fn new(bus: u8, slot: u8, function: u8) -> Self {
        Self {
            bus,
            slot,
            function,
        }
    }

    /// Decodes the packed `bus << 8 | slot << 3 | function` form.
    #[must_use]
    pub const fn from_bdf(bdf: u16) -> Self {
        Self {
            bus: (bdf >> 8) as u8,
            slot: ((bdf >> 3) & 0x1F) as u8,
            function: (bdf & 0x07) as u8,
        }
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.slot, self.function)
    }
}

bitflags! {
    /// Decoded BAR attribute bits.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct BarFlags: u8 {
        /// I/O port space (otherwise memory space).
        const IO = 1 << 0;
        /// 64-bit memory BAR (consumes the following slot).
        const ADDR64 = 1 << 1;
        /// Memory BAR that must be placed below 1 MiB.
        const BELOW_1M = 1 << 2;
        /// Prefetchable memory.
        const PREFETCH = 1 << 3;
    }
}

/// One BAR descriptor as discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PciBar {
    /// Bus address of the window, flag bits stripped.
    pub base: u64,
    /// Window length in bytes (0 = not reported).
    pub len: u32,
    /// Attribute bits.
    pub flags: BarFlags,
}

impl PciBar {
    /// An unused slot.
    pub const UNUSED: Self = Self {
        base: 0,
        len: 0,
        flags: BarFlags::empty(),
    };

    /// Decodes a raw BAR value whose low bits carry the space/type flags.
    #[must_use]
    pub fn decode(raw: u64, len: u32) -> Self {
        if raw & 0x1 != 0 {
            return Self {
                base: raw & !0x3,
                len,
                flags: BarFlags::IO,
            };
        }

        let mut flags = BarFlags::empty();
        match (raw >> 1) & 0x3 {
            1 => flags |= BarFlags::BELOW_1M,
            2 => flags |= BarFlags::ADDR64,
            _ => {}
        }
        if raw & 0x8 != 0 {
            flags |= BarFlags::PREFETCH;
        }
        Self {
            base: raw & !0xF,
            len,
            flags,
        }
    }

    /// Returns `true` for an I/O port BAR.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        self.flags.contains(BarFlags::IO)
    }
}

/// Immutable description of one discovered PCI function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PciDeviceInfo {
    /// Bus/slot/function address.
    pub address: PciAddress,
    /// Identity fields.
    pub id: PciIdentity,
    /// Base Address Registers.
    pub bars: [PciBar; BAR_COUNT],
    /// Expansion ROM address.
    pub rom: u64,
    /// Interrupt line.
    pub irq: u8,
    /// Name of the kernel driver bound to the device, if any.
    pub driver: Option<String>,
}

/// Per-BAR runtime state.
#[derive(Default)]
pub(crate) struct BarState {
    /// Live mapping, created on first use.
    pub(crate) mapping: Option<BarMapping>,
    /// Length found by the discovery probe.
    pub(crate) probed_len: Option<u32>,
}

/// Mutable device state, only touched under the device lock.
#[derive(Default)]
pub(crate) struct DeviceState {
    pub(crate) bars: [BarState; BAR_COUNT],
    /// UIO node the native backend maps BARs through, opened on first map.
    pub(crate) handle: Option<Arc<File>>,
    pub(crate) isrs: Vec<IsrRegistration>,
    driver_data: Option<Box<dyn Any + Send>>,
}

/// A discovered device record.
///
/// The discovery data never changes. The runtime state (mappings,
/// interrupt registrations, driver-private data) sits behind the device
/// lock, which ranks below the registry lock.
pub struct PciDevice {
    info: PciDeviceInfo,
    state: Mutex<DeviceState>,
}

impl PciDevice {
    /// Creates a record with empty runtime state.
    #[must_use]
    pub fn new(info: PciDeviceInfo) -> Self {
        Self {
            info,
            state: Mutex::new(DeviceState::default()),
        }
    }

    /// Returns the discovery data.
    #[must_use]
    pub fn info(&self) -> &PciDeviceInfo {
        &self.info
    }

    /// Returns the bus/slot/function address.
    #[must_use]
    pub fn address(&self) -> PciAddress {
        self.info.address
    }

    /// Returns the identity fields.
    #[must_use]
    pub fn identity(&self) -> &PciIdentity {
        &self.info.id
    }

    /// Returns a BAR descriptor, or `None` if `index` is out of range.
    #[must_use]
    pub fn bar(&self, index: usize) -> Option<&PciBar> {
        self.info.bars.get(index)
    }

    /// Returns the interrupt line.
    #[must_use]
    pub fn irq(&self) -> u8 {
        self.info.irq
    }

    /// Stores driver-private data, returning the previous value.
    pub fn set_driver_data(&self, data: Box<dyn Any + Send>) -> Option<Box<dyn Any + Send>> {
        self.lock().driver_data.replace(data)
    }

    /// Runs `f` with the driver-private data if it is of type `T`.
    pub fn with_driver_data<T: Any, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut state = self.lock();
        f(state.driver_data.as_mut().and_then(|d| d.downcast_mut::<T>()))
    }

    /// Number of live interrupt registrations.
    #[must_use]
    pub fn interrupt_count(&self) -> usize {
        self.lock().isrs.len()
    }

    /// Acquires the device lock.
    pub(crate) fn lock(&self) -> DeviceGuard<'_> {
        // A panicking interrupt handler never holds this lock, so poisoning
        // only reflects a panic in our own bookkeeping; the data stays valid.
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        lockorder::device_acquired();
        DeviceGuard { guard }
    }

    /// Drops every BAR mapping and the access handle.
    ///
    /// Callers must have disconnected all interrupt registrations first.
    pub(crate) fn release(&self) {
        let mut state = self.lock();
        debug_assert!(state.isrs.is_empty(), "releasing {} with live ISRs", self.info.address);
        for bar in &mut state.bars {
            bar.mapping = None;
        }
        state.handle = None;
    }
}

impl fmt::Debug for PciDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PciDevice")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Guard for the device lock, tracked for lock-order checking.
pub(crate) struct DeviceGuard<'a> {
    guard: MutexGuard<'a, DeviceState>,
}

impl Deref for DeviceGuard<'_> {
    type Target = DeviceState;

    fn deref(&self) -> &DeviceState {
        &self.guard
    }
}

impl DerefMut for DeviceGuard<'_> {
    fn deref_mut(&mut self) -> &mut DeviceState {
        &mut self.guard
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        lockorder::device_released();
    }
}
