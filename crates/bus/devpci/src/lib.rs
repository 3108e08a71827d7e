//! Userspace PCI device directory and interrupt dispatch.
//!
//! Finds PCI functions by identity pattern, maps their memory BARs into the
//! process and runs a dedicated thread per interrupt registration. Platform
//! differences live behind a [`Backend`], selected once per process.
//!
//! # Usage
//!
//! ```ignore
//! use devpci::{PciId, Visit};
//!
//! static CARDS: &[PciId] = &[PciId::new(0x1A3E, 0xE693), PciId::END];
//!
//! fn on_irq(card: usize) { /* acknowledge */ }
//!
//! devpci::find(CARDS, |dev| {
//!     let regs = devpci::map_bar(dev, 0)?;
//!     devpci::connect_interrupt(dev, on_irq, regs.as_ptr() as usize)?;
//!     Ok(Visit::Continue)
//! })?;
//! ```
//!
//! # Locking
//!
//! Every device has a lock guarding its mappings and interrupt
//! registrations; the registry has one guarding the device list. The
//! registry lock always comes first. Searches snapshot the device list and
//! call visitors without holding either lock.

pub mod backend;
pub mod bar;
pub mod config;
pub mod device;
pub mod error;
pub mod header;
pub mod id;
pub mod isr;
mod lockorder;
pub mod registry;
pub mod service;
pub mod show;

#[cfg(test)]
mod testutil;

use std::ptr::NonNull;

pub use backend::{Backend, BackendEntry};
pub use config::Config;
pub use device::{BarFlags, DeviceRef, PciAddress, PciBar, PciDevice, PciDeviceInfo};
pub use error::PciError;
pub use id::{PciId, PciIdentity};
pub use isr::{IrqWait, IsrHandler, IsrTiming};
pub use registry::Visit;
pub use service::{DevPci, init, shutdown};

/// Visits every device matching at least one of `patterns`.
///
/// The visitor returns `Ok(Visit::Continue)` to keep going,
/// `Ok(Visit::Stop)` to end the search successfully, or an error, which
/// ends the search and is returned.
pub fn find(
    patterns: &[PciId],
    visit: impl FnMut(&DeviceRef) -> Result<Visit, PciError>,
) -> Result<(), PciError> {
    service::global()?.find(patterns, visit)
}

/// Returns the device matching `patterns` at `bus:slot.function`.
pub fn find_bdf(
    patterns: &[PciId],
    bus: u8,
    slot: u8,
    function: u8,
) -> Result<DeviceRef, PciError> {
    service::global()?.find_bdf(patterns, bus, slot, function)
}

/// Maps a memory BAR; later calls return the same pointer.
pub fn map_bar(dev: &DeviceRef, bar: usize) -> Result<NonNull<u8>, PciError> {
    service::global()?.map_bar(dev, bar)
}

/// Returns a BAR's length in bytes.
pub fn bar_length(dev: &DeviceRef, bar: usize) -> Result<u32, PciError> {
    service::global()?.bar_length(dev, bar)
}

/// Starts calling `handler(param)` after every interrupt of `dev`.
pub fn connect_interrupt(
    dev: &DeviceRef,
    handler: IsrHandler,
    param: usize,
) -> Result<(), PciError> {
    service::global()?.connect_interrupt(dev, handler, param)
}

/// Stops a registration; returns once its thread has exited.
pub fn disconnect_interrupt(
    dev: &DeviceRef,
    handler: IsrHandler,
    param: usize,
) -> Result<(), PciError> {
    service::global()?.disconnect_interrupt(dev, handler, param)
}
