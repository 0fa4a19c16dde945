//! Cross-thread wakeup abstraction.
//!
//! A `Wakeup` interrupts a multi-handle that is blocked inside `perform()`,
//! so a freshly submitted request or a posted cancellation is picked up
//! without waiting out a full poll interval.
//!
//! # Implementors (reqmux-module)
//!
//! - `EventFdWakeup` (Linux default): writes 1 to an eventfd; the perform
//!   step polls the eventfd alongside its transfer sockets.
//! - `CondvarWakeup` (portable fallback): flag + condition variable.

use std::time::Duration;

use crate::error::Result;

/// Interrupts one in-progress (or the next) blocking wait.
///
/// **Contract:**
/// - `wake()` must NEVER block.
/// - Safe to call from any thread, any number of times.
/// - Multiple wakes before the waiter runs are coalesced into one.
pub trait Wakeup: Send + Sync {
    /// Signal the waiter.
    fn wake(&self) -> Result<()>;
}

/// The waiting half, used by multi-handle implementations.
pub trait WakeupWait: Wakeup {
    /// Block until woken or until `timeout` expires (`None` = no limit).
    ///
    /// Returns `true` if a wake was consumed, `false` on timeout.
    /// A wake raised before the call returns immediately.
    fn wait(&self, timeout: Option<Duration>) -> Result<bool>;
}
