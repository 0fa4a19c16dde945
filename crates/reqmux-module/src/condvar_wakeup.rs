//! Portable `Wakeup` using a flag and a condition variable.
//!
//! Used on platforms without eventfd. Same coalescing semantics: the flag is
//! either set or not, one wait consumes it.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use reqmux_core::error::Result;
use reqmux_core::wakeup::{Wakeup, WakeupWait};

pub struct CondvarWakeup {
    /// true = wake pending
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl CondvarWakeup {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Infallible; mirrors `EventFdWakeup::create` so either can back
    /// `PlatformWakeup`.
    pub fn create() -> Result<Self> {
        Ok(Self::new())
    }
}

impl Default for CondvarWakeup {
    fn default() -> Self {
        Self::new()
    }
}

impl Wakeup for CondvarWakeup {
    fn wake(&self) -> Result<()> {
        *self.pending.lock() = true;
        self.condvar.notify_one();
        Ok(())
    }
}

impl WakeupWait for CondvarWakeup {
    fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let mut pending = self.pending.lock();
        let deadline = timeout.map(|t| Instant::now() + t);
        while !*pending {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut pending, deadline).timed_out() {
                        break;
                    }
                }
                None => self.condvar.wait(&mut pending),
            }
        }
        Ok(std::mem::replace(&mut *pending, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_park_timeout() {
        let w = CondvarWakeup::new();
        let start = Instant::now();
        assert!(!w.wait(Some(Duration::from_millis(30))).unwrap());
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_pending_wake_consumed_once() {
        let w = CondvarWakeup::new();
        w.wake().unwrap();
        w.wake().unwrap();
        assert!(w.wait(Some(Duration::ZERO)).unwrap());
        assert!(!w.wait(Some(Duration::ZERO)).unwrap());
    }

    #[test]
    fn test_wake_one() {
        let w = Arc::new(CondvarWakeup::new());
        let w2 = Arc::clone(&w);
        let handle = thread::spawn(move || w2.wait(Some(Duration::from_secs(10))).unwrap());

        thread::sleep(Duration::from_millis(30));
        w.wake().unwrap();
        assert!(handle.join().unwrap());
    }
}
