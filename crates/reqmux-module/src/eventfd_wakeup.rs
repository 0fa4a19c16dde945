//! `EventFdWakeup`: default `Wakeup` implementation on Linux.
//!
//! `wake()` adds 1 to an eventfd counter; `wait()` polls the fd and drains
//! the counter with a single read. Any number of wakes between two waits
//! collapse into one (eventfd counter semantics).
//!
//! A native multi-handle can also hand `fd()` to its own poll set so that a
//! wake interrupts the transport's socket wait directly.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use reqmux_core::error::{MuxError, Result};
use reqmux_core::wakeup::{Wakeup, WakeupWait};

pub struct EventFdWakeup {
    fd: OwnedFd,
}

impl EventFdWakeup {
    /// Create a new non-blocking, close-on-exec eventfd.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(MuxError::Os(Errno::last() as i32));
        }
        // Safety: eventfd returned a fresh descriptor that nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd })
    }

    /// Raw descriptor, for adding to an external poll set.
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Consume any pending wake. Returns `true` if one was pending.
    fn drain(&self) -> Result<bool> {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            if errno == Errno::EAGAIN {
                return Ok(false);
            }
            return Err(MuxError::Wakeup(errno as i32));
        }
        Ok(val > 0)
    }
}

impl Wakeup for EventFdWakeup {
    fn wake(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = Errno::last();
            // EAGAIN: the counter is saturated, so a wake is already pending.
            if errno == Errno::EAGAIN {
                return Ok(());
            }
            return Err(MuxError::Wakeup(errno as i32));
        }
        Ok(())
    }
}

impl WakeupWait for EventFdWakeup {
    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        if self.drain()? {
            return Ok(true);
        }

        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => {
                // Round up so a sub-millisecond timeout still sleeps.
                let ms = d.as_micros().div_ceil(1000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        };

        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if ret < 0 {
                let errno = Errno::last();
                if errno == Errno::EINTR {
                    continue;
                }
                return Err(MuxError::Wakeup(errno as i32));
            }
            if ret == 0 {
                return Ok(false);
            }
            return self.drain();
        }
    }
}
