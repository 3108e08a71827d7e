//! Interrupt waits on Linux UIO device nodes.
//!
//! Reading 4 bytes from `/dev/uioN` blocks until the next interrupt. Each
//! waiter owns its own descriptor on the node plus an `eventfd` used for
//! cancellation, and blocks in `poll` on both. Cancelling bumps the eventfd
//! counter, which stays readable until the waiter drains it, so a cancel
//! that lands between two waits is not lost.

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;

use crate::isr::IrqWait;

/// Cancellable interrupt wait on one UIO node.
#[derive(Debug)]
pub struct UioWaiter {
    node: File,
    cancel: OwnedFd,
}

impl UioWaiter {
    /// Opens a new listener on the UIO node at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let node = OpenOptions::new().read(true).write(true).open(path)?;

        // SAFETY: plain syscall; the result is checked before use.
        let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `fd` is a fresh descriptor nobody else owns.
        let cancel = unsafe { OwnedFd::from_raw_fd(fd) };

        Ok(Self { node, cancel })
    }

    fn drain_cancel(&self) {
        let mut count = [0u8; 8];
        // SAFETY: reads at most 8 bytes into a local buffer of that size.
        // The eventfd is non-blocking, so a concurrent drain cannot hang us.
        let _ = unsafe {
            libc::read(self.cancel.as_raw_fd(), count.as_mut_ptr().cast(), count.len())
        };
    }
}

impl IrqWait for UioWaiter {
    fn wait(&self) -> io::Result<()> {
        let mut fds = [
            libc::pollfd {
                fd: self.node.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.cancel.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: `fds` is a valid array of two pollfd structures.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        if fds[1].revents & libc::POLLIN != 0 {
            self.drain_cancel();
            return Err(io::ErrorKind::Interrupted.into());
        }

        let node = fds[0].revents;
        if node & libc::POLLIN != 0 {
            // The event count is not used.
            let mut count = [0u8; 4];
            (&self.node).read_exact(&mut count)?;
            return Ok(());
        }
        if node & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(io::Error::other(format!("UIO node reported poll events {node:#x}")));
        }

        // Woken without an event on either descriptor.
        Err(io::ErrorKind::Interrupted.into())
    }

    fn cancel(&self) {
        let one = 1u64.to_ne_bytes();
        // SAFETY: writes exactly 8 bytes from a local buffer to our eventfd.
        let rc = unsafe { libc::write(self.cancel.as_raw_fd(), one.as_ptr().cast(), one.len()) };
        if rc < 0 {
            log::warn!("devpci: cancelling UIO wait failed: {}", io::Error::last_os_error());
        }
    }
}
