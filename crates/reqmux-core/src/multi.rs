//! Native multi-handle boundary.
//!
//! A `MultiHandle` drives many concurrent transfers from ONE thread. It is the
//! only piece of reqmux that talks to the real transport (a curl multi handle,
//! an in-process loopback, a test double).
//!
//! The executor constructs it on its worker thread and never lets it leave:
//! the trait is deliberately not `Send`. The only cross-thread entry point is
//! the `Wakeup` returned by `waker()`.

use std::sync::Arc;

use crate::completion::CompletionSlot;
use crate::context::CancelCause;
use crate::error::{RequestError, Result};
use crate::request::{RequestData, Response};
use crate::wakeup::Wakeup;

/// Single-threaded multi-transfer driver.
///
/// **Contract:**
/// - Every method except the `Wakeup` is called from the owning thread only.
/// - `schedule()` never blocks.
/// - `perform()` may block for a bounded poll window and must return early
///   when the wakeup is raised.
/// - Each scheduled transfer's slot is resolved exactly once by the handle,
///   either in `perform()` or in `cancel()`.
/// - `close()` is called exactly once, after the last `perform()`. It
///   should fail whatever it still holds; any slot left unresolved is failed
///   by the worker with `LoopTerminated` once `close()` returns.
pub trait MultiHandle {
    /// Per-transfer token returned by `schedule()`.
    type Handle: Copy + Eq + core::fmt::Debug;

    /// Add a transfer. The handle takes a clone of `completion` and resolves
    /// it when the transfer finishes.
    ///
    /// An `Err` rejects this request only; the worker fails its slot.
    fn schedule(
        &mut self,
        request: RequestData,
        completion: CompletionSlot<Response>,
    ) -> std::result::Result<Self::Handle, RequestError>;

    /// Advance every in-flight transfer one step and resolve finished ones.
    ///
    /// An `Err` means the handle itself is unusable (loop-fatal).
    fn perform(&mut self) -> Result<()>;

    /// Cross-thread interrupt for a blocking `perform()`.
    fn waker(&self) -> Arc<dyn Wakeup>;

    /// Abort a transfer. Best-effort: the transfer may already have finished.
    fn cancel(&mut self, handle: Self::Handle, cause: &CancelCause);

    /// True while at least one transfer is in flight.
    fn has_pending_work(&self) -> bool;

    /// Release all native resources. Transfers still in flight should be
    /// resolved here.
    fn close(&mut self);
}
