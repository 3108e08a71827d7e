//! Simulated hardware for unit tests.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::backend::shared::BusAccess;
use crate::bar::{BAR0, ConfigSpace, MapRequest, MappedRegion};
use crate::device::{BAR_COUNT, PciDeviceInfo};
use crate::error::PciError;
use crate::isr::IrqWait;

/// Polls `cond` until it holds, panicking after five seconds.
pub fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached within 5s");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Creates a FIFO at `path`. It behaves like a UIO node: reads block
/// until someone writes.
pub fn fake_node(path: &Path) {
    let c = CString::new(path.as_os_str().as_bytes()).unwrap();
    // SAFETY: `c` is a valid NUL-terminated path.
    assert_eq!(unsafe { libc::mkfifo(c.as_ptr(), 0o600) }, 0);
}

/// Callback run when a simulated mapping is dropped.
type UnmapHook = Arc<Mutex<Option<Box<dyn Fn() + Send>>>>;

/// Heap memory standing in for a device mapping.
pub struct HeapRegion {
    buf: Vec<u8>,
    on_drop: Option<UnmapHook>,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        Self {
            buf: vec![0; len],
            on_drop: None,
        }
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        if let Some(hook) = &self.on_drop {
            if let Some(f) = hook.lock().unwrap().as_ref() {
                f();
            }
        }
    }
}

impl MappedRegion for HeapRegion {
    fn as_ptr(&self) -> NonNull<u8> {
        NonNull::new(self.buf.as_ptr().cast_mut()).unwrap_or(NonNull::dangling())
    }

    fn len(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Configuration space
// ---------------------------------------------------------------------------

struct ConfigState {
    regs: [u32; 64],
    sizes: [u32; BAR_COUNT],
    writes: usize,
    reads: usize,
    fail_at: Option<usize>,
}

impl Default for ConfigState {
    fn default() -> Self {
        Self {
            regs: [0; 64],
            sizes: [0; BAR_COUNT],
            writes: 0,
            reads: 0,
            fail_at: None,
        }
    }
}

/// Configuration space whose BARs decode like real hardware: address bits
/// below the window size read back as zero, flag bits are read-only.
#[derive(Default)]
pub struct SimConfig {
    state: Mutex<ConfigState>,
}

impl SimConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs a BAR with its raw value and window size.
    pub fn set_bar(&self, bar: usize, raw: u32, size: u32) {
        let mut s = self.state.lock().unwrap();
        s.regs[usize::from(BAR0 / 4) + bar] = raw;
        s.sizes[bar] = size;
    }

    /// Number of writes seen so far.
    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    /// Makes the `n`th read from now on (counting from 0) fail.
    pub fn fail_read(&self, n: usize) {
        let mut s = self.state.lock().unwrap();
        s.reads = 0;
        s.fail_at = Some(n);
    }
}

impl ConfigSpace for SimConfig {
    fn read_u32(&self, offset: u16) -> io::Result<u32> {
        let mut s = self.state.lock().unwrap();
        let n = s.reads;
        s.reads += 1;
        if s.fail_at == Some(n) {
            s.fail_at = None;
            return Err(io::Error::other("simulated config read failure"));
        }
        Ok(s.regs[usize::from(offset / 4)])
    }

    fn write_u32(&self, offset: u16, value: u32) -> io::Result<()> {
        let mut s = self.state.lock().unwrap();
        s.writes += 1;
        let idx = usize::from(offset / 4);
        let first = usize::from(BAR0 / 4);
        if (first..first + BAR_COUNT).contains(&idx) {
            let bar = idx - first;
            let old = s.regs[idx];
            let flag_bits = if old & 1 != 0 { 0x3 } else { 0xF };
            let size = s.sizes[bar];
            let addr = if size == 0 {
                0
            } else {
                value & !flag_bits & !(size - 1)
            };
            s.regs[idx] = addr | (old & flag_bits);
        } else {
            s.regs[idx] = value;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Interrupt waits
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WaitState {
    pending: usize,
    cancelled: bool,
    failures: usize,
    cancels: usize,
}

/// Condition-variable interrupt source.
#[derive(Default)]
pub struct SimWait {
    state: Mutex<WaitState>,
    cond: Condvar,
}

impl SimWait {
    /// Raises one interrupt.
    pub fn fire(&self) {
        self.state.lock().unwrap().pending += 1;
        self.cond.notify_all();
    }

    /// Makes the next `n` waits fail with a non-cancellation error.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().unwrap().failures += n;
        self.cond.notify_all();
    }

    /// Number of `cancel` calls received.
    pub fn cancels(&self) -> usize {
        self.state.lock().unwrap().cancels
    }
}

impl IrqWait for SimWait {
    fn wait(&self) -> io::Result<()> {
        let mut s = self.state.lock().unwrap();
        loop {
            if s.cancelled {
                s.cancelled = false;
                return Err(io::ErrorKind::Interrupted.into());
            }
            if s.failures > 0 {
                s.failures -= 1;
                return Err(io::Error::other("simulated wait failure"));
            }
            if s.pending > 0 {
                s.pending -= 1;
                return Ok(());
            }
            s = self.cond.wait(s).unwrap();
        }
    }

    fn cancel(&self) {
        let mut s = self.state.lock().unwrap();
        s.cancelled = true;
        s.cancels += 1;
        self.cond.notify_all();
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// In-memory bus for the shared backend.
#[derive(Default)]
pub struct SimBus {
    devices: Vec<(PciDeviceInfo, Arc<SimConfig>)>,
    finds: AtomicUsize,
    maps: AtomicUsize,
    waiters: Mutex<Vec<Arc<SimWait>>>,
    on_unmap: UnmapHook,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device with its configuration space.
    pub fn with_device(mut self, info: PciDeviceInfo, cfg: SimConfig) -> Self {
        self.devices.push((info, Arc::new(cfg)));
        self
    }

    /// Number of bus queries.
    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    /// Number of platform mapping calls.
    pub fn maps(&self) -> usize {
        self.maps.load(Ordering::SeqCst)
    }

    /// Runs `f` whenever a mapping made by this bus is dropped, including
    /// mappings made before the call.
    pub fn on_unmap(&self, f: impl Fn() + Send + 'static) {
        *self.on_unmap.lock().unwrap() = Some(Box::new(f));
    }

    /// Most recently opened interrupt waiter.
    pub fn last_waiter(&self) -> Option<Arc<SimWait>> {
        self.waiters.lock().unwrap().last().cloned()
    }
}

impl BusAccess for SimBus {
    fn find(&self, vendor: u16, device: u16) -> Result<Vec<PciDeviceInfo>, PciError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .devices
            .iter()
            .filter(|(info, _)| info.id.vendor == vendor && info.id.device == device)
            .map(|(info, _)| info.clone())
            .collect())
    }

    fn map(
        &self,
        _dev: &PciDeviceInfo,
        req: &MapRequest,
    ) -> Result<Box<dyn MappedRegion>, PciError> {
        self.maps.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(HeapRegion {
            buf: vec![0; req.span],
            on_drop: Some(Arc::clone(&self.on_unmap)),
        }))
    }

    fn config(&self, dev: &PciDeviceInfo) -> Result<Box<dyn ConfigSpace>, PciError> {
        let (_, cfg) = self
            .devices
            .iter()
            .find(|(info, _)| info.address == dev.address)
            .ok_or(PciError::NoSuchDevice)?;
        Ok(Box::new(Arc::clone(cfg)))
    }

    fn open_irq(&self, _dev: &PciDeviceInfo) -> Result<Arc<dyn IrqWait>, PciError> {
        let wait = Arc::new(SimWait::default());
        self.waiters.lock().unwrap().push(Arc::clone(&wait));
        Ok(wait)
    }
}
