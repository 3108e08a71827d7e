//! Registry/device lock ordering checks.
//!
//! The registry lock is always taken before any device lock. Each thread
//! counts the device locks it holds; acquiring the registry lock with a
//! non-zero count is an ordering violation and trips a debug assertion.
//! Release builds compile the bookkeeping out.

#[cfg(debug_assertions)]
use std::cell::Cell;

#[cfg(debug_assertions)]
thread_local! {
    static DEVICE_LOCKS_HELD: Cell<usize> = const { Cell::new(0) };
}

/// Records that the current thread acquired a device lock.
#[inline]
pub(crate) fn device_acquired() {
    #[cfg(debug_assertions)]
    DEVICE_LOCKS_HELD.with(|held| held.set(held.get() + 1));
}

/// Records that the current thread released a device lock.
#[inline]
pub(crate) fn device_released() {
    #[cfg(debug_assertions)]
    DEVICE_LOCKS_HELD.with(|held| held.set(held.get().saturating_sub(1)));
}

/// Checks that the current thread may block on the registry lock.
#[inline]
pub(crate) fn registry_acquiring() {
    #[cfg(debug_assertions)]
    DEVICE_LOCKS_HELD.with(|held| {
        debug_assert_eq!(
            held.get(),
            0,
            "registry lock acquired while holding {} device lock(s)",
            held.get()
        );
    });
}

/// Number of device locks held by the current thread (debug builds only).
#[cfg(all(test, debug_assertions))]
pub(crate) fn device_locks_held() -> usize {
    DEVICE_LOCKS_HELD.with(Cell::get)
}
