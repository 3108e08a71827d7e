//! Interrupt registrations and their waiter threads.
//!
//! Every `(handler, param)` registration owns one thread that blocks in a
//! cancellable wait and calls the handler after each wake-up. The state of
//! each registration is only read or written under the device lock:
//!
//! ```text
//! Starting ──► Running ──► Stopping ──► Done
//!     └───────────────────────┘ (disconnect before the thread started)
//! ```
//!
//! `disconnect` moves a registration to `Stopping`, cancels the wait of a
//! running waiter, and polls until the thread reports `Done`.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::device::{DeviceGuard, DeviceRef, DeviceState, PciDevice};
use crate::error::PciError;

/// Interrupt handler; receives the parameter it was connected with.
pub type IsrHandler = fn(usize);

/// A blocking wait for device interrupts that another thread can cancel.
///
/// `cancel` is sticky: when it races ahead of `wait`, the next `wait`
/// returns immediately. Cancelling one waiter never disturbs another.
pub trait IrqWait: Send + Sync {
    /// Blocks until an interrupt arrives (`Ok`) or the wait is cancelled
    /// (`Err` of kind [`io::ErrorKind::Interrupted`]). Any other error is
    /// treated as transient by the waiter thread.
    fn wait(&self) -> io::Result<()>;

    /// Wakes the pending or next `wait` of this waiter.
    fn cancel(&self);
}

/// Registration lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsrState {
    /// Thread spawned, identity not yet recorded.
    Starting,
    /// Thread identity recorded, dispatching interrupts.
    Running,
    /// Stop requested.
    Stopping,
    /// Thread finished, resources can be released.
    Done,
}

/// Timing knobs for waiter threads and disconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsrTiming {
    /// Sleep between state checks while disconnecting.
    pub disconnect_poll: Duration,
    /// First sleep after a failed wait.
    pub retry: Duration,
    /// Upper bound for the doubling retry sleep.
    pub retry_max: Duration,
}

impl Default for IsrTiming {
    fn default() -> Self {
        Self {
            disconnect_poll: Duration::from_millis(100),
            retry: Duration::from_millis(50),
            retry_max: Duration::from_millis(500),
        }
    }
}

/// One live interrupt registration.
pub(crate) struct IsrRegistration {
    key: u64,
    handler: IsrHandler,
    param: usize,
    state: IsrState,
    waiter_id: Option<ThreadId>,
    waiter: Arc<dyn IrqWait>,
    thread: Option<JoinHandle<()>>,
}

impl IsrRegistration {
    fn is(&self, handler: IsrHandler, param: usize) -> bool {
        std::ptr::fn_addr_eq(self.handler, handler) && self.param == param
    }
}

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

fn find(state: &DeviceState, key: u64) -> Option<&IsrRegistration> {
    state.isrs.iter().find(|r| r.key == key)
}

fn find_mut(state: &mut DeviceState, key: u64) -> Option<&mut IsrRegistration> {
    state.isrs.iter_mut().find(|r| r.key == key)
}

fn remove(state: &mut DeviceState, key: u64) -> Option<IsrRegistration> {
    let idx = state.isrs.iter().position(|r| r.key == key)?;
    Some(state.isrs.remove(idx))
}

/// Current state of the `(handler, param)` registration on `dev`, if any.
#[must_use]
pub fn state_of(dev: &PciDevice, handler: IsrHandler, param: usize) -> Option<IsrState> {
    dev.lock()
        .isrs
        .iter()
        .find(|r| r.is(handler, param))
        .map(|r| r.state)
}

/// Starts a waiter thread from a configured builder.
type Spawner = fn(thread::Builder, Box<dyn FnOnce() + Send>) -> io::Result<JoinHandle<()>>;

fn spawn_thread(
    builder: thread::Builder,
    body: Box<dyn FnOnce() + Send>,
) -> io::Result<JoinHandle<()>> {
    builder.spawn(body)
}

/// Connects `handler(param)` to the device's interrupts.
///
/// `open_waiter` runs under the device lock after the duplicate check;
/// if it fails nothing is recorded.
pub(crate) fn connect(
    dev: &DeviceRef,
    handler: IsrHandler,
    param: usize,
    timing: IsrTiming,
    open_waiter: impl FnOnce(&mut DeviceState) -> Result<Arc<dyn IrqWait>, PciError>,
) -> Result<(), PciError> {
    connect_with(dev, handler, param, timing, open_waiter, spawn_thread)
}

fn connect_with(
    dev: &DeviceRef,
    handler: IsrHandler,
    param: usize,
    timing: IsrTiming,
    open_waiter: impl FnOnce(&mut DeviceState) -> Result<Arc<dyn IrqWait>, PciError>,
    spawn: Spawner,
) -> Result<(), PciError> {
    let key = NEXT_KEY.fetch_add(1, Ordering::Relaxed);
    let waiter = {
        let mut state = dev.lock();
        if state.isrs.iter().any(|r| r.is(handler, param)) {
            log::error!("devpci: ISR already registered on {}", dev.address());
            return Err(PciError::AlreadyRegistered);
        }
        let waiter = open_waiter(&mut *state)?;
        state.isrs.push(IsrRegistration {
            key,
            handler,
            param,
            state: IsrState::Starting,
            waiter_id: None,
            waiter: Arc::clone(&waiter),
            thread: None,
        });
        waiter
    };

    let name = format!("{:02x}PCIISR", dev.irq());
    let thread_dev = Arc::clone(dev);
    let spawned = spawn(
        thread::Builder::new().name(name.clone()),
        Box::new(move || waiter_main(&thread_dev, key, handler, param, &*waiter, timing)),
    );

    let handle = match spawned {
        Ok(handle) => handle,
        Err(err) => {
            log::error!("devpci: failed to create ISR thread {name}: {err}");
            remove(&mut dev.lock(), key);
            return Err(PciError::ThreadSpawnFailed);
        }
    };

    let mut state = dev.lock();
    if let Some(reg) = find_mut(&mut state, key) {
        reg.thread = Some(handle);
    } else {
        // A disconnect already observed `Done` and dropped the record.
        drop(state);
        join(handle);
    }
    log::debug!("devpci: connected ISR thread {name} on {}", dev.address());
    Ok(())
}

/// Disconnects `handler(param)`, returning once its thread has exited.
pub(crate) fn disconnect(
    dev: &PciDevice,
    handler: IsrHandler,
    param: usize,
    timing: IsrTiming,
) -> Result<(), PciError> {
    let state = dev.lock();
    let key = state
        .isrs
        .iter()
        .find(|r| r.is(handler, param))
        .map(|r| r.key)
        .ok_or(PciError::NotRegistered)?;

    let (state, thread) = stop_locked(dev, state, key, timing);
    drop(state);
    if let Some(handle) = thread {
        join(handle);
    }
    Ok(())
}

/// Disconnects every registration of the device. Returns how many there were.
pub(crate) fn disconnect_all(dev: &PciDevice, timing: IsrTiming) -> usize {
    let mut state = dev.lock();
    let keys: Vec<u64> = state.isrs.iter().map(|r| r.key).collect();
    let mut threads = Vec::with_capacity(keys.len());
    for &key in &keys {
        let (next, thread) = stop_locked(dev, state, key, timing);
        state = next;
        threads.extend(thread);
    }
    drop(state);
    for handle in threads {
        join(handle);
    }
    keys.len()
}

/// Stops one registration and removes it. Called with the device lock held;
/// the lock is released while polling and held again on return.
fn stop_locked<'a>(
    dev: &'a PciDevice,
    mut state: DeviceGuard<'a>,
    key: u64,
    timing: IsrTiming,
) -> (DeviceGuard<'a>, Option<JoinHandle<()>>) {
    if let Some(reg) = find_mut(&mut state, key) {
        match reg.state {
            IsrState::Done => {}
            IsrState::Running => {
                log::trace!("devpci: cancelling waiter {:?}", reg.waiter_id);
                reg.waiter.cancel();
                reg.state = IsrState::Stopping;
            }
            IsrState::Starting | IsrState::Stopping => reg.state = IsrState::Stopping,
        }
    }

    while matches!(find(&state, key).map(|r| r.state), Some(s) if s != IsrState::Done) {
        drop(state);
        thread::sleep(timing.disconnect_poll);
        state = dev.lock();
    }

    let thread = remove(&mut state, key).and_then(|r| r.thread);
    (state, thread)
}

fn join(handle: JoinHandle<()>) {
    let name = handle.thread().name().unwrap_or("<unnamed>").to_owned();
    if handle.join().is_err() {
        log::error!("devpci: ISR thread {name} panicked");
    }
}

/// Body of a waiter thread.
fn waiter_main(
    dev: &PciDevice,
    key: u64,
    handler: IsrHandler,
    param: usize,
    waiter: &dyn IrqWait,
    timing: IsrTiming,
) {
    let mut state = dev.lock();
    let Some(reg) = find_mut(&mut state, key) else {
        return;
    };
    if reg.state != IsrState::Starting {
        reg.state = IsrState::Done;
        return;
    }
    reg.waiter_id = Some(thread::current().id());
    reg.state = IsrState::Running;

    let mut fired = false;
    let mut backoff = timing.retry;
    while find(&state, key).is_some_and(|r| r.state == IsrState::Running) {
        drop(state);

        if fired {
            fired = false;
            if panic::catch_unwind(AssertUnwindSafe(|| handler(param))).is_err() {
                log::error!("devpci: ISR handler on {} panicked", dev.address());
            }
        }

        match waiter.wait() {
            Ok(()) => {
                fired = true;
                backoff = timing.retry;
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                log::error!(
                    "devpci: ISR thread '{}' wait error: {err}",
                    thread::current().name().unwrap_or("<unnamed>")
                );
                thread::sleep(backoff);
                backoff = (backoff * 2).min(timing.retry_max);
            }
        }

        state = dev.lock();
    }

    if let Some(reg) = find_mut(&mut state, key) {
        reg.state = IsrState::Done;
    }
}
