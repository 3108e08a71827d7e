//! PCI subsystem error types.

use core::fmt;

/// Errors returned by every devpci operation.
///
/// All operations are synchronous and leave no partial state behind when
/// they fail. `AlreadyInitialized` and `BadArgument` indicate programmer
/// error; every other variant is recoverable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PciError {
    /// A required argument was missing or out of range.
    BadArgument,
    /// No device matched the search or coordinate lookup.
    NoSuchDevice,
    /// The operation is not supported for this BAR kind or backend.
    NotSupported,
    /// The platform mapping call failed.
    MapFailed,
    /// An identical (handler, parameter) pair is already connected.
    AlreadyRegistered,
    /// No connection matches the (handler, parameter) pair.
    NotRegistered,
    /// The interrupt waiter thread could not be created.
    ThreadSpawnFailed,
    /// A backend has already been selected for this process.
    AlreadyInitialized,
    /// No backend is registered under the requested name.
    UnknownBackend,
    /// The selected backend failed to build its device registry.
    InitFailed,
    /// Reading or writing configuration space failed.
    ConfigAccess,
    /// A search visitor stopped the search with a caller-defined code.
    Callback(i32),
}

impl PciError {
    /// Returns a stable status number for diagnostics.
    ///
    /// Every variant except `Callback` has its own non-zero number.
    /// `Callback` reports the visitor's code unchanged, so `Callback(0)` and
    /// `Callback(1)` give 0 and 1 and may collide with other variants. Match
    /// on the variant, not the number, to tell a visitor abort apart.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::BadArgument => 2,
            Self::NoSuchDevice => 3,
            Self::NotSupported => 4,
            Self::MapFailed => 5,
            Self::AlreadyRegistered => 6,
            Self::NotRegistered => 7,
            Self::ThreadSpawnFailed => 8,
            Self::AlreadyInitialized => 9,
            Self::UnknownBackend => 10,
            Self::InitFailed => 11,
            Self::ConfigAccess => 12,
            Self::Callback(code) => code,
        }
    }
}

impl fmt::Display for PciError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArgument => f.write_str("bad argument"),
            Self::NoSuchDevice => f.write_str("no such device"),
            Self::NotSupported => f.write_str("operation not supported"),
            Self::MapFailed => f.write_str("BAR mapping failed"),
            Self::AlreadyRegistered => f.write_str("interrupt handler already registered"),
            Self::NotRegistered => f.write_str("interrupt handler not registered"),
            Self::ThreadSpawnFailed => f.write_str("failed to spawn interrupt thread"),
            Self::AlreadyInitialized => f.write_str("backend already initialized"),
            Self::UnknownBackend => f.write_str("unknown backend"),
            Self::InitFailed => f.write_str("backend initialization failed"),
            Self::ConfigAccess => f.write_str("configuration space access failed"),
            Self::Callback(code) => write!(f, "search aborted by visitor (code {code})"),
        }
    }
}

impl std::error::Error for PciError {}
