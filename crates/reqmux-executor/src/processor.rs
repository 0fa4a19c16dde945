//! `Processor`: the caller-facing handle to one worker thread.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};

use crossbeam_utils::sync::Parker;
use parking_lot::Mutex;

use reqmux_core::completion::{CompletionSlot, ResponseFuture};
use reqmux_core::error::{MuxError, RequestError, Result};
use reqmux_core::multi::MultiHandle;
use reqmux_core::request::{RequestData, RequestId, Response};
use reqmux_core::wakeup::Wakeup;
use reqmux_core::{kdebug, kerror, kinfo, kwarn};

use crate::config::ProcessorConfig;
use crate::container::RequestContainer;
use crate::worker::{panic_message, Counters, LoopState, Shared, Worker};

/// Point-in-time counters of a `Processor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorStats {
    pub state: LoopState,
    /// Accepted by `submit`.
    pub submitted: u64,
    /// Refused by `submit` because intake was closed.
    pub rejected: u64,
    /// Handed to the multi-handle.
    pub scheduled: u64,
    /// Refused by the multi-handle's `schedule`.
    pub schedule_errors: u64,
    /// Cancel hooks that fired.
    pub cancels_posted: u64,
    /// Cancellations that reached an unresolved transfer.
    pub cancels_applied: u64,
    pub performs: u64,
    /// Transfers removed from the in-flight registry: pruned, cancelled or
    /// released at close.
    pub resolved: u64,
    /// Times the worker parked on an empty queue.
    pub parks: u64,
    /// Containers waiting in the submission queue.
    pub queued: usize,
}

/// Handle to a running worker loop.
///
/// `Send + Sync`: share it behind an `Arc` and submit from any thread.
/// Dropping it closes intake and joins the worker.
pub struct Processor {
    shared: Arc<Shared>,
    waker: Arc<dyn Wakeup>,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
    worker_id: thread::ThreadId,
    outcome: Mutex<Option<Result<()>>>,
}

impl Processor {
    /// Spawn the worker thread and build the multi-handle on it.
    ///
    /// Blocks until the loop is `Running`; returns the factory's error (or
    /// its panic) if construction failed.
    pub fn start<M, F>(config: ProcessorConfig, factory: F) -> Result<Self>
    where
        M: MultiHandle + 'static,
        F: FnOnce() -> Result<M> + Send + 'static,
    {
        config.validate().map_err(MuxError::Config)?;

        let parker = Parker::new();
        let shared = Arc::new(Shared::new(&parker));
        let worker_shared = Arc::clone(&shared);
        let drain_batch = config.drain_batch;
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<Arc<dyn Wakeup>>>(1);

        let mut builder = thread::Builder::new().name(config.thread_name.clone());
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }

        let handle = builder
            .spawn(move || {
                let built = catch_unwind(AssertUnwindSafe(factory)).unwrap_or_else(|payload| {
                    Err(MuxError::MultiInit(format!(
                        "factory panicked: {}",
                        panic_message(&*payload)
                    )))
                });
                let multi = match built {
                    Ok(multi) => multi,
                    Err(e) => {
                        worker_shared.queue.close();
                        worker_shared.set_state(LoopState::Failed);
                        let _ = ready_tx.send(Err(e.clone()));
                        return Err(e);
                    }
                };

                let waker = multi.waker();
                let worker = Worker::new(multi, Arc::clone(&worker_shared), parker, drain_batch);
                worker_shared.set_state(LoopState::Running);
                let _ = ready_tx.send(Ok(waker));
                worker.run()
            })
            .map_err(|e| MuxError::Spawn(e.to_string()))?;

        let waker = match ready_rx.recv() {
            Ok(Ok(waker)) => waker,
            Ok(Err(e)) => {
                let _ = handle.join();
                kerror!("processor start failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                // Worker exited without reporting in.
                return Err(match handle.join() {
                    Ok(Err(e)) => e,
                    Ok(Ok(())) => MuxError::MultiInit("worker exited during startup".into()),
                    Err(payload) => MuxError::WorkerPanicked(panic_message(&*payload)),
                });
            }
        };

        kinfo!("processor started on thread '{}'", config.thread_name);
        let worker_id = handle.thread().id();
        Ok(Self {
            shared,
            waker,
            next_id: AtomicU64::new(1),
            thread: Mutex::new(Some(handle)),
            worker_id,
            outcome: Mutex::new(None),
        })
    }

    /// Queue a request. Never blocks.
    ///
    /// Fails with `QueueClosed` once `close()` was called or the loop died.
    pub fn submit(&self, request: RequestData) -> std::result::Result<ResponseFuture<Response>, RequestError> {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (slot, future) = CompletionSlot::new();

        if self
            .shared
            .queue
            .push(RequestContainer::new(id, request, slot))
            .is_err()
        {
            Counters::bump(&self.shared.counters.rejected);
            return Err(RequestError::QueueClosed);
        }
        Counters::bump(&self.shared.counters.submitted);
        self.wake();
        Ok(future)
    }

    /// Submit and await the response.
    pub async fn execute_request(&self, request: RequestData) -> std::result::Result<Response, RequestError> {
        self.submit(request)?.await
    }

    /// Submit and block the calling thread until the response arrives.
    pub fn execute_blocking(&self, request: RequestData) -> std::result::Result<Response, RequestError> {
        self.submit(request)?.wait()
    }

    /// Stop intake. Idempotent and non-blocking; already queued requests
    /// are still served. Use `join()` to wait for the worker.
    pub fn close(&self) {
        if self.shared.queue.close() {
            kdebug!("processor intake closed");
        }
        self.wake();
    }

    /// Block until the worker thread has exited.
    ///
    /// Returns the loop-fatal error, if any. Later calls return the same
    /// result. Does not close intake by itself.
    pub fn join(&self) -> Result<()> {
        if thread::current().id() == self.worker_id {
            return Err(MuxError::Spawn("join called from the worker thread".into()));
        }

        let mut outcome = self.outcome.lock();
        if let Some(result) = outcome.as_ref() {
            return result.clone();
        }
        let Some(handle) = self.thread.lock().take() else {
            return Ok(());
        };
        let result = match handle.join() {
            Ok(result) => result,
            Err(payload) => Err(MuxError::WorkerPanicked(panic_message(&*payload))),
        };
        *outcome = Some(result.clone());
        result
    }

    pub fn state(&self) -> LoopState {
        self.shared.state()
    }

    pub fn stats(&self) -> ProcessorStats {
        let c = &self.shared.counters;
        ProcessorStats {
            state: self.shared.state(),
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            scheduled: c.scheduled.load(Ordering::Relaxed),
            schedule_errors: c.schedule_errors.load(Ordering::Relaxed),
            cancels_posted: c.cancels_posted.load(Ordering::Relaxed),
            cancels_applied: c.cancels_applied.load(Ordering::Relaxed),
            performs: c.performs.load(Ordering::Relaxed),
            resolved: c.resolved.load(Ordering::Relaxed),
            parks: self.shared.queue.parks(),
            queued: self.shared.queue.len(),
        }
    }

    fn wake(&self) {
        if self.shared.state().is_terminal() {
            return;
        }
        if let Err(e) = self.waker.wake() {
            kwarn!("wakeup failed: {}", e);
        }
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.close();
        if thread::current().id() == self.worker_id {
            // Dropped from a completion hook; the loop exits on its own.
            return;
        }
        let _ = self.join();
    }
}
