//! The worker loop: sole owner of the multi-handle.
//!
//! ```text
//! loop {
//!     1. Run posted control tasks (cancellations)
//!     2. Drain the submission queue → schedule() each container
//!          pending transfers? non-blocking, at most drain_batch
//!          idle?              park until submit / control task / close
//!     3. Closed + drained + idle → exit
//!     4. perform() once (bounded, interrupted by the wakeup)
//!     5. Prune resolved entries from the in-flight registry
//! }
//! multi.close()
//! fail whatever close() left unresolved
//! ```
//!
//! Caller threads never touch the multi-handle. A cancellation reaches it as
//! a `ControlTask` posted by the request's cancel hook; the worker applies it
//! on its own thread.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::Parker;

use reqmux_core::completion::CompletionSlot;
use reqmux_core::context::{CancelCause, HookRegistration};
use reqmux_core::error::{MuxError, RequestError, Result};
use reqmux_core::multi::MultiHandle;
use reqmux_core::request::{RequestId, Response};
use reqmux_core::wakeup::Wakeup;
use reqmux_core::{kdebug, kerror, kinfo, ktrace, kwarn};

use crate::container::RequestContainer;
use crate::queue::SubmissionQueue;

/// Lifecycle of the worker loop.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Thread spawned, multi-handle under construction.
    Starting = 0,
    Running = 1,
    /// Intake closed; serving what is left.
    DrainingFinal = 2,
    /// Multi-handle closed, thread exiting or gone.
    Stopped = 3,
    /// Stopped by a loop-fatal error.
    Failed = 4,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Starting,
            1 => LoopState::Running,
            2 => LoopState::DrainingFinal,
            3 => LoopState::Stopped,
            _ => LoopState::Failed,
        }
    }

    /// True once the loop can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Stopped | LoopState::Failed)
    }
}

/// Work posted to the loop from other threads.
#[derive(Debug)]
pub(crate) enum ControlTask {
    Cancel { id: RequestId, cause: CancelCause },
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub rejected: AtomicU64,
    pub scheduled: AtomicU64,
    pub schedule_errors: AtomicU64,
    pub cancels_posted: AtomicU64,
    pub cancels_applied: AtomicU64,
    pub performs: AtomicU64,
    pub resolved: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared between the `Processor` handle and the worker thread.
pub(crate) struct Shared {
    pub queue: SubmissionQueue<RequestContainer>,
    pub control: SegQueue<ControlTask>,
    state: AtomicU8,
    pub counters: Counters,
}

impl Shared {
    pub fn new(parker: &Parker) -> Self {
        Self {
            queue: SubmissionQueue::new(parker),
            control: SegQueue::new(),
            state: AtomicU8::new(LoopState::Starting as u8),
            counters: Counters::default(),
        }
    }

    #[inline]
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: LoopState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Hand a task to the loop and interrupt whatever it is blocked in.
    pub fn post(&self, task: ControlTask, waker: &dyn Wakeup) {
        self.control.push(task);
        if let Err(e) = waker.wake() {
            kwarn!("control task wakeup failed: {}", e);
        }
        self.queue.notify();
    }
}

struct InFlight<H> {
    handle: H,
    slot: CompletionSlot<Response>,
    registration: Arc<HookRegistration>,
}

pub(crate) struct Worker<M: MultiHandle> {
    multi: M,
    shared: Arc<Shared>,
    waker: Arc<dyn Wakeup>,
    parker: Parker,
    in_flight: HashMap<RequestId, InFlight<M::Handle>>,
    /// Slot out of the registry while the multi-handle is called for it,
    /// failed on a fatal exit if that call panics.
    in_hand: Option<CompletionSlot<Response>>,
    drain_batch: usize,
}

impl<M: MultiHandle> Worker<M> {
    pub fn new(multi: M, shared: Arc<Shared>, parker: Parker, drain_batch: usize) -> Self {
        let waker = multi.waker();
        Self {
            multi,
            shared,
            waker,
            parker,
            in_flight: HashMap::new(),
            in_hand: None,
            drain_batch,
        }
    }

    /// Run until closed and idle, or until a loop-fatal error.
    ///
    /// Always closes the multi-handle exactly once before returning.
    pub fn run(mut self) -> Result<()> {
        kinfo!("worker running, drain_batch={}", self.drain_batch);

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_loop()));
        let result = match outcome {
            Ok(result) => result,
            Err(payload) => Err(MuxError::WorkerPanicked(panic_message(&*payload))),
        };

        if let Err(e) = &result {
            kerror!("worker loop failed: {}", e);
            self.fail_outstanding(e);
        }

        if catch_unwind(AssertUnwindSafe(|| self.multi.close())).is_err() {
            kerror!("multi handle panicked during close");
        }
        self.release_in_flight();

        let final_state = if result.is_ok() {
            LoopState::Stopped
        } else {
            LoopState::Failed
        };
        self.shared.set_state(final_state);
        kinfo!("worker stopped ({:?})", final_state);
        result
    }

    fn run_loop(&mut self) -> Result<()> {
        loop {
            self.run_control_tasks();
            self.drain();

            if self.shared.queue.is_closed() && self.shared.state() == LoopState::Running {
                self.shared.set_state(LoopState::DrainingFinal);
                kdebug!("intake closed, draining {} in flight", self.in_flight.len());
            }

            if self.shared.queue.is_terminated() && !self.multi.has_pending_work() {
                // Cancellations that raced the last completions are no-ops,
                // but applying them keeps the registry empty on exit.
                self.run_control_tasks();
                return Ok(());
            }

            self.multi.perform()?;
            Counters::bump(&self.shared.counters.performs);
            self.prune();
        }
    }

    fn run_control_tasks(&mut self) {
        while let Some(task) = self.shared.control.pop() {
            match task {
                ControlTask::Cancel { id, cause } => self.apply_cancel(id, cause),
            }
        }
    }

    fn apply_cancel(&mut self, id: RequestId, cause: CancelCause) {
        let Some(entry) = self.in_flight.remove(&id) else {
            ktrace!("cancel for {} ignored: not in flight", id);
            return;
        };
        if entry.slot.is_resolved() {
            return;
        }
        self.in_hand = Some(entry.slot.clone());
        self.multi.cancel(entry.handle, &cause);
        self.in_hand = None;
        // No-op if the multi-handle already failed the slot itself.
        entry.slot.fail(RequestError::Cancelled(cause));
        Counters::bump(&self.shared.counters.cancels_applied);
        Counters::bump(&self.shared.counters.resolved);
        kdebug!("cancelled {}", id);
    }

    fn drain(&mut self) {
        let mut may_park = !self.multi.has_pending_work();
        let mut drained = 0;

        while drained < self.drain_batch {
            let next = if may_park {
                let control = &self.shared.control;
                self.shared
                    .queue
                    .pop_blocking(&self.parker, || !control.is_empty())
            } else {
                self.shared.queue.try_pop()
            };
            let Some(container) = next else {
                break;
            };
            self.schedule(container);
            drained += 1;
            may_park = false;
        }
    }

    fn schedule(&mut self, container: RequestContainer) {
        let RequestContainer {
            id,
            request,
            completion,
        } = container;

        if let Err(e) = request.context.check() {
            completion.fail(e);
            return;
        }

        let context = request.context.clone();
        self.in_hand = Some(completion.clone());
        let scheduled = self.multi.schedule(request, completion.clone());
        self.in_hand = None;
        let handle = match scheduled {
            Ok(handle) => handle,
            Err(e) => {
                kdebug!("schedule {} failed: {}", id, e);
                Counters::bump(&self.shared.counters.schedule_errors);
                completion.fail(e);
                return;
            }
        };
        Counters::bump(&self.shared.counters.scheduled);

        let shared = Arc::clone(&self.shared);
        let waker = Arc::clone(&self.waker);
        let registration = Arc::new(context.on_cancel(move |cause| {
            Counters::bump(&shared.counters.cancels_posted);
            shared.post(
                ControlTask::Cancel {
                    id,
                    cause: cause.clone(),
                },
                &*waker,
            );
        }));

        let disarm = Arc::clone(&registration);
        completion.on_resolved(move || {
            disarm.dispose();
        });

        self.in_flight.insert(
            id,
            InFlight {
                handle,
                slot: completion,
                registration,
            },
        );
    }

    fn prune(&mut self) {
        let before = self.in_flight.len();
        self.in_flight.retain(|_, entry| !entry.slot.is_resolved());
        let pruned = (before - self.in_flight.len()) as u64;
        if pruned > 0 {
            self.shared
                .counters
                .resolved
                .fetch_add(pruned, Ordering::Relaxed);
        }
    }

    /// After `close()`: a transfer the handle dropped without resolving
    /// never will be.
    fn release_in_flight(&mut self) {
        let mut released = 0u64;
        for (id, entry) in self.in_flight.drain() {
            entry.registration.dispose();
            if entry
                .slot
                .fail(RequestError::LoopTerminated("multi handle closed".to_string()))
            {
                kwarn!("{} left unresolved by close", id);
            }
            released += 1;
        }
        if released > 0 {
            self.shared
                .counters
                .resolved
                .fetch_add(released, Ordering::Relaxed);
        }
    }

    /// Fatal exit: nothing submitted may be left unresolved.
    fn fail_outstanding(&mut self, error: &MuxError) {
        let reason = error.to_string();

        if let Some(slot) = self.in_hand.take() {
            slot.fail(RequestError::LoopTerminated(reason.clone()));
        }
        for (_, entry) in self.in_flight.drain() {
            entry.registration.dispose();
            entry.slot.fail(RequestError::LoopTerminated(reason.clone()));
        }

        let queued = self.shared.queue.drain_remaining();
        if !queued.is_empty() {
            kwarn!("failing {} queued requests", queued.len());
        }
        for container in queued {
            container
                .completion
                .fail(RequestError::LoopTerminated(reason.clone()));
        }

        while self.shared.control.pop().is_some() {}
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trip() {
        for state in [
            LoopState::Starting,
            LoopState::Running,
            LoopState::DrainingFinal,
            LoopState::Stopped,
            LoopState::Failed,
        ] {
            assert_eq!(LoopState::from_u8(state as u8), state);
        }
        assert!(LoopState::Failed.is_terminal());
        assert!(!LoopState::DrainingFinal.is_terminal());
    }

    #[test]
    fn test_panic_message() {
        let payload = catch_unwind(|| panic!("boom {}", 1)).unwrap_err();
        assert_eq!(panic_message(&*payload), "boom 1");

        let payload = catch_unwind(|| panic!("static")).unwrap_err();
        assert_eq!(panic_message(&*payload), "static");
    }
}
